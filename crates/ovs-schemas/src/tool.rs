//! Tool catalog records.
//!
//! A `ToolSpec` is the versioned unit the catalog stores; `(tool_name,
//! version)` is unique and exactly one row per tool is the latest. The
//! performance formulas are stored as strings and evaluated only through the
//! selector's safe math evaluator.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::ActionClass;

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Windows,
    Cross,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
            Self::Cross => "cross",
        }
    }

    /// A `cross` tool serves every platform; otherwise exact match.
    pub fn serves(&self, wanted: Platform) -> bool {
        *self == Platform::Cross || *self == wanted
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            "cross" => Ok(Self::Cross),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ToolCategory
// ---------------------------------------------------------------------------

/// Functional family of a tool. The step dispatcher keys its handler registry
/// off this, and the engine infers the plan's action class from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    AssetQuery,
    HealthCheck,
    ServiceControl,
    CommandRun,
    DataRemoval,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssetQuery => "asset_query",
            Self::HealthCheck => "health_check",
            Self::ServiceControl => "service_control",
            Self::CommandRun => "command_run",
            Self::DataRemoval => "data_removal",
        }
    }

    /// Side-effect tier implied by invoking a tool of this category.
    pub fn action_class(&self) -> ActionClass {
        match self {
            Self::AssetQuery | Self::HealthCheck => ActionClass::Read,
            Self::ServiceControl | Self::CommandRun => ActionClass::Mutate,
            Self::DataRemoval => ActionClass::Destructive,
        }
    }
}

impl FromStr for ToolCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asset_query" => Ok(Self::AssetQuery),
            "health_check" => Ok(Self::HealthCheck),
            "service_control" => Ok(Self::ServiceControl),
            "command_run" => Ok(Self::CommandRun),
            "data_removal" => Ok(Self::DataRemoval),
            other => Err(format!("unknown tool category '{other}'")),
        }
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ToolPolicy
// ---------------------------------------------------------------------------

/// Hard constraints enforced by the selector's policy filter and by the
/// engine's approval routing. Non-bypassable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolPolicy {
    /// May this tool run against production assets at all?
    pub production_safe: bool,
    /// Any invocation must be routed through the approval flow.
    #[serde(default)]
    pub requires_approval: bool,
    /// Capabilities the actor must hold.
    #[serde(default)]
    pub required_permissions: Vec<String>,
    /// Upper bound on the evaluated cost feature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    /// Environments the tool may run in; empty = all.
    #[serde(default)]
    pub allowed_environments: Vec<String>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            production_safe: false,
            requires_approval: false,
            required_permissions: Vec::new(),
            max_cost: None,
            allowed_environments: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// PatternPerf
// ---------------------------------------------------------------------------

/// Per-pattern performance formulas. Formula strings are authoritative —
/// prose descriptions elsewhere are ignored. Allowed variables: `N`, `pages`,
/// `p95_latency`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternPerf {
    pub time_ms_formula: String,
    pub cost_formula: String,
    /// Formula or constant in [0,1]; higher = more complex.
    pub complexity: String,
    /// Constant in [0,1].
    pub accuracy: f64,
    /// Constant in [0,1].
    pub completeness: f64,
}

// ---------------------------------------------------------------------------
// ParamSpec
// ---------------------------------------------------------------------------

/// Typed input parameter declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    /// "string" | "integer" | "number" | "boolean" | "object" | "array"
    pub param_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// ToolSpec
// ---------------------------------------------------------------------------

/// The versioned catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub tool_name: String,
    /// Monotonic per tool; assigned by the catalog on put.
    pub version: i32,
    pub platform: Platform,
    pub category: ToolCategory,
    pub capabilities: Vec<String>,
    /// Named execution profiles; keys are pattern names.
    pub patterns: BTreeMap<String, Value>,
    pub inputs: Vec<ParamSpec>,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
    pub policy: ToolPolicy,
    /// Keyed by pattern name; every pattern in `patterns` must have a row.
    pub performance_profile: BTreeMap<String, PatternPerf>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ToolSpec {
    /// Action class implied by invoking this tool.
    pub fn action_class(&self) -> ActionClass {
        self.category.action_class()
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_platform_serves_everything() {
        assert!(Platform::Cross.serves(Platform::Linux));
        assert!(Platform::Cross.serves(Platform::Windows));
        assert!(Platform::Linux.serves(Platform::Linux));
        assert!(!Platform::Linux.serves(Platform::Windows));
    }

    #[test]
    fn category_maps_to_action_class() {
        assert_eq!(ToolCategory::AssetQuery.action_class(), ActionClass::Read);
        assert_eq!(
            ToolCategory::ServiceControl.action_class(),
            ActionClass::Mutate
        );
        assert_eq!(
            ToolCategory::DataRemoval.action_class(),
            ActionClass::Destructive
        );
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = ToolSpec {
            tool_name: "asset_search".into(),
            version: 3,
            platform: Platform::Cross,
            category: ToolCategory::AssetQuery,
            capabilities: vec!["asset.lookup".into()],
            patterns: BTreeMap::from([(
                "single_lookup".to_string(),
                serde_json::json!({"page_size": 50}),
            )]),
            inputs: vec![ParamSpec {
                name: "search".into(),
                param_type: "string".into(),
                required: true,
                description: None,
            }],
            expected_outputs: vec!["assets".into()],
            policy: ToolPolicy {
                production_safe: true,
                ..Default::default()
            },
            performance_profile: BTreeMap::from([(
                "single_lookup".to_string(),
                PatternPerf {
                    time_ms_formula: "50 + p95_latency".into(),
                    cost_formula: "0".into(),
                    complexity: "0.1".into(),
                    accuracy: 0.95,
                    completeness: 1.0,
                },
            )]),
            enabled: true,
        };
        let v = serde_json::to_value(&spec).unwrap();
        let back: ToolSpec = serde_json::from_value(v).unwrap();
        assert_eq!(back, spec);
    }
}
