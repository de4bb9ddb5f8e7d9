//! Submit-time classification: action class, SLA class, routing mode, and
//! queue priority.

use ovs_schemas::{ActionClass, ExecutionMode, SlaClass, ToolSpec};
use serde::{Deserialize, Serialize};

/// Caller preferences accepted on submit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Preferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla: Option<SlaClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_mode: Option<ovs_schemas::SelectionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// The classification result stamped onto the execution row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub action_class: ActionClass,
    pub sla_class: SlaClass,
    pub mode: ExecutionMode,
    pub priority: i32,
}

/// Cost above which an otherwise-immediate execution routes to background.
const IMMEDIATE_COST_CEILING: f64 = 1.0;

/// Classify a plan given the resolved tool specs (one per step, plan order)
/// and the target environment.
pub fn classify(
    specs: &[ToolSpec],
    environment: &str,
    prefs: &Preferences,
    estimated_cost: f64,
) -> Classification {
    // Any write/delete step raises the whole plan's tier.
    let action_class = specs
        .iter()
        .map(|s| s.action_class())
        .max()
        .unwrap_or(ActionClass::Read);

    // Caller preference, capped by policy: writes never run in the FAST tier.
    let requested = prefs.sla.unwrap_or(SlaClass::Fast);
    let sla_class = if action_class.is_write() && requested == SlaClass::Fast {
        SlaClass::Medium
    } else {
        requested
    };

    let is_production = environment.eq_ignore_ascii_case("production");
    let requires_approval = specs.iter().any(|s| s.policy.requires_approval)
        || (action_class == ActionClass::Destructive && is_production);

    let mode = if requires_approval {
        ExecutionMode::ApprovalRequired
    } else if sla_class == SlaClass::Fast
        && action_class == ActionClass::Read
        && estimated_cost <= IMMEDIATE_COST_CEILING
    {
        ExecutionMode::Immediate
    } else {
        ExecutionMode::Background
    };

    // Lower number = sooner. Reads ahead of writes within a tier.
    let priority = prefs.priority.unwrap_or(match (sla_class, action_class) {
        (SlaClass::Fast, _) => 10,
        (SlaClass::Medium, ActionClass::Read) => 50,
        (SlaClass::Medium, _) => 60,
        (SlaClass::Long, ActionClass::Read) => 100,
        (SlaClass::Long, _) => 110,
    });

    Classification {
        action_class,
        sla_class,
        mode,
        priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovs_schemas::{ToolCategory, ToolPolicy};
    use std::collections::BTreeMap;

    fn spec(category: ToolCategory, requires_approval: bool) -> ToolSpec {
        ToolSpec {
            tool_name: format!("{category}"),
            version: 1,
            platform: ovs_schemas::Platform::Cross,
            category,
            capabilities: vec![],
            patterns: BTreeMap::new(),
            inputs: vec![],
            expected_outputs: vec![],
            policy: ToolPolicy {
                production_safe: true,
                requires_approval,
                ..Default::default()
            },
            performance_profile: BTreeMap::new(),
            enabled: true,
        }
    }

    #[test]
    fn read_only_fast_cheap_is_immediate() {
        let c = classify(
            &[spec(ToolCategory::AssetQuery, false)],
            "staging",
            &Preferences::default(),
            0.1,
        );
        assert_eq!(c.action_class, ActionClass::Read);
        assert_eq!(c.sla_class, SlaClass::Fast);
        assert_eq!(c.mode, ExecutionMode::Immediate);
    }

    #[test]
    fn any_write_step_raises_the_action_class() {
        let c = classify(
            &[
                spec(ToolCategory::AssetQuery, false),
                spec(ToolCategory::ServiceControl, false),
            ],
            "staging",
            &Preferences::default(),
            0.1,
        );
        assert_eq!(c.action_class, ActionClass::Mutate);
        assert_eq!(c.mode, ExecutionMode::Background);
    }

    #[test]
    fn writes_are_capped_out_of_the_fast_tier() {
        let c = classify(
            &[spec(ToolCategory::ServiceControl, false)],
            "staging",
            &Preferences {
                sla: Some(SlaClass::Fast),
                ..Default::default()
            },
            0.1,
        );
        assert_eq!(c.sla_class, SlaClass::Medium);
    }

    #[test]
    fn destructive_in_production_requires_approval() {
        let c = classify(
            &[spec(ToolCategory::DataRemoval, false)],
            "production",
            &Preferences::default(),
            0.1,
        );
        assert_eq!(c.mode, ExecutionMode::ApprovalRequired);

        // same plan outside production routes to background
        let c = classify(
            &[spec(ToolCategory::DataRemoval, false)],
            "staging",
            &Preferences::default(),
            0.1,
        );
        assert_eq!(c.mode, ExecutionMode::Background);
    }

    #[test]
    fn tool_level_approval_flag_wins_everywhere() {
        let c = classify(
            &[spec(ToolCategory::AssetQuery, true)],
            "dev",
            &Preferences::default(),
            0.0,
        );
        assert_eq!(c.mode, ExecutionMode::ApprovalRequired);
    }

    #[test]
    fn expensive_reads_are_not_immediate() {
        let c = classify(
            &[spec(ToolCategory::AssetQuery, false)],
            "staging",
            &Preferences::default(),
            5.0,
        );
        assert_eq!(c.mode, ExecutionMode::Background);
    }

    #[test]
    fn caller_priority_overrides_the_derived_one() {
        let c = classify(
            &[spec(ToolCategory::AssetQuery, false)],
            "staging",
            &Preferences {
                priority: Some(3),
                ..Default::default()
            },
            0.0,
        );
        assert_eq!(c.priority, 3);
    }
}
