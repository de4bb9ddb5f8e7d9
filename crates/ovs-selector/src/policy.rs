//! Hard policy enforcement over selector candidates.
//!
//! These filters run after feature evaluation and before scoring, and they
//! are non-bypassable: the LLM tie-breaker only ever sees candidates that
//! survived this pass. Soft constraints (approval needed, background
//! required) are attached as flags, never used to filter.

use std::collections::HashSet;

use ovs_schemas::ToolPolicy;
use serde::{Deserialize, Serialize};

/// Why a candidate was removed. Serialized into the explain output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyViolation {
    MaxCostExceeded,
    NotProductionSafe,
    MissingPermission,
    EnvironmentNotAllowed,
}

/// Soft constraints surfaced to the engine alongside the selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftConstraints {
    pub needs_approval: bool,
    /// Heavyweight patterns should not run inline.
    pub background_required: bool,
}

/// Evaluate the hard constraints for one candidate.
/// `None` means the candidate survives.
pub fn check_policy(
    policy: &ToolPolicy,
    evaluated_cost: f64,
    environment: &str,
    actor_permissions: &HashSet<String>,
) -> Option<PolicyViolation> {
    if let Some(max_cost) = policy.max_cost {
        if evaluated_cost > max_cost {
            return Some(PolicyViolation::MaxCostExceeded);
        }
    }

    let is_production = environment.eq_ignore_ascii_case("production");
    if is_production && !policy.production_safe {
        return Some(PolicyViolation::NotProductionSafe);
    }

    for perm in &policy.required_permissions {
        if !actor_permissions.contains(perm) {
            return Some(PolicyViolation::MissingPermission);
        }
    }

    if !policy.allowed_environments.is_empty()
        && !policy
            .allowed_environments
            .iter()
            .any(|e| e.eq_ignore_ascii_case(environment))
    {
        return Some(PolicyViolation::EnvironmentNotAllowed);
    }

    None
}

/// Derive the soft-constraint flags for a surviving candidate.
pub fn soft_constraints(policy: &ToolPolicy, estimated_time_ms: f64) -> SoftConstraints {
    SoftConstraints {
        needs_approval: policy.requires_approval,
        background_required: estimated_time_ms > 10_000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ToolPolicy {
        ToolPolicy {
            production_safe: false,
            requires_approval: false,
            required_permissions: vec!["asset.read".to_string()],
            max_cost: Some(2.0),
            allowed_environments: vec!["staging".to_string(), "production".to_string()],
        }
    }

    fn perms(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn max_cost_is_a_hard_wall() {
        let p = policy();
        assert_eq!(
            check_policy(&p, 2.5, "staging", &perms(&["asset.read"])),
            Some(PolicyViolation::MaxCostExceeded)
        );
        assert_eq!(check_policy(&p, 1.5, "staging", &perms(&["asset.read"])), None);
    }

    #[test]
    fn production_unsafe_tools_vanish_in_production() {
        let p = policy();
        assert_eq!(
            check_policy(&p, 0.0, "production", &perms(&["asset.read"])),
            Some(PolicyViolation::NotProductionSafe)
        );
        // staging is fine
        assert_eq!(check_policy(&p, 0.0, "staging", &perms(&["asset.read"])), None);
    }

    #[test]
    fn missing_permission_filters() {
        let p = policy();
        assert_eq!(
            check_policy(&p, 0.0, "staging", &perms(&[])),
            Some(PolicyViolation::MissingPermission)
        );
    }

    #[test]
    fn environment_allowlist_filters() {
        let p = policy();
        assert_eq!(
            check_policy(&p, 0.0, "dev", &perms(&["asset.read"])),
            Some(PolicyViolation::EnvironmentNotAllowed)
        );
    }

    #[test]
    fn soft_constraints_do_not_filter() {
        let mut p = policy();
        p.requires_approval = true;
        assert_eq!(check_policy(&p, 0.0, "staging", &perms(&["asset.read"])), None);
        let flags = soft_constraints(&p, 60_000.0);
        assert!(flags.needs_approval);
        assert!(flags.background_required);
    }
}
