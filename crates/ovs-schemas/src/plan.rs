//! Plan, step, and target payloads.
//!
//! A plan travels as an ordered sequence of tagged steps with explicit field
//! names — no runtime introspection. Step inputs may embed secret references
//! (`{"type": "secret", "path": "..."}`); those are resolved by the safety
//! layer at step start and never persisted in resolved form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OvsError;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Ordered sequence of steps produced by the external planner stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    /// Structural validation performed at submit time.
    ///
    /// # Errors
    /// `VALIDATION` when the plan is empty, a step name is blank, or a tool
    /// name is blank. Tool existence is checked later against the catalog.
    pub fn validate(&self) -> Result<(), OvsError> {
        if self.steps.is_empty() {
            return Err(OvsError::validation("plan has no steps"));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(OvsError::validation(format!("step {i} has a blank name")));
            }
            if step.tool_name.trim().is_empty() {
                return Err(OvsError::validation(format!(
                    "step '{}' has a blank tool name",
                    step.name
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PlanStep
// ---------------------------------------------------------------------------

/// A single planned tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    /// Human-readable step label, unique within the plan by convention.
    pub name: String,
    /// Catalog tool to invoke.
    pub tool_name: String,
    /// Execution pattern of the tool; `None` lets Stage B pick one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Tool inputs; may contain secret references.
    #[serde(default = "default_inputs")]
    pub inputs: Value,
    /// What to do when this step fails terminally.
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

fn default_inputs() -> Value {
    Value::Object(Default::default())
}

// ---------------------------------------------------------------------------
// FailurePolicy
// ---------------------------------------------------------------------------

/// Per-step failure disposition. The step loop stops on the first terminal
/// failure unless the step opts into `Continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Halt,
    Continue,
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Asset reference an execution runs against. At least one locator must be
/// present; the asset-context resolver turns this into a full record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl Target {
    pub fn validate(&self) -> Result<(), OvsError> {
        if self.asset_id.is_none() && self.hostname.is_none() {
            return Err(OvsError::validation(
                "target must carry an asset_id or a hostname",
            ));
        }
        Ok(())
    }

    /// Mutex key for per-asset serialization: the strongest locator we have.
    pub fn lock_key(&self) -> String {
        match (&self.asset_id, &self.hostname) {
            (Some(id), _) => format!("asset:{id}"),
            (None, Some(host)) => format!("host:{host}"),
            (None, None) => "unresolved".to_string(),
        }
    }
}

/// Returns `true` if `v` is a secret reference object:
/// `{"type": "secret", "path": "<ref>"}`.
pub fn is_secret_ref(v: &Value) -> bool {
    v.get("type").and_then(Value::as_str) == Some("secret")
        && v.get("path").and_then(Value::as_str).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(name: &str, tool: &str) -> PlanStep {
        PlanStep {
            name: name.to_string(),
            tool_name: tool.to_string(),
            pattern: None,
            inputs: json!({}),
            on_failure: FailurePolicy::Halt,
        }
    }

    #[test]
    fn empty_plan_is_invalid() {
        let err = Plan { steps: vec![] }.validate().unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Validation);
    }

    #[test]
    fn blank_tool_name_is_invalid() {
        let plan = Plan {
            steps: vec![step("lookup", "  ")],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn well_formed_plan_passes() {
        let plan = Plan {
            steps: vec![step("lookup", "asset_search"), step("restart", "restart_service")],
        };
        plan.validate().unwrap();
    }

    #[test]
    fn target_needs_a_locator() {
        assert!(Target::default().validate().is_err());
        let t = Target {
            hostname: Some("web-prod-01".into()),
            ..Default::default()
        };
        t.validate().unwrap();
        assert_eq!(t.lock_key(), "host:web-prod-01");
    }

    #[test]
    fn secret_ref_shape_is_detected() {
        assert!(is_secret_ref(&json!({"type": "secret", "path": "db/admin"})));
        assert!(!is_secret_ref(&json!({"type": "secret"})));
        assert!(!is_secret_ref(&json!("secret")));
    }

    #[test]
    fn on_failure_defaults_to_halt() {
        let s: PlanStep =
            serde_json::from_value(json!({"name": "x", "tool_name": "y"})).unwrap();
        assert_eq!(s.on_failure, FailurePolicy::Halt);
    }
}
