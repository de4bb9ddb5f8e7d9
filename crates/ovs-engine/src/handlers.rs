//! Step handlers, keyed by tool category.
//!
//! A handler receives resolved inputs (secret refs already swapped for
//! handles), the execution target, the remaining deadline, and the
//! cancellation token. Handlers observe the token at every I/O boundary and
//! must return rather than block once it fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ovs_schemas::{OvsError, Target, ToolCategory};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::automation::AutomationClient;
use ovs_assets::client::AssetQuery;
use ovs_assets::{disambiguate, AssetResolver, Projection};

/// Everything a handler may see for one step run.
pub struct StepRunContext<'a> {
    pub tenant_id: &'a str,
    pub inputs: &'a Value,
    pub target: &'a Target,
    pub deadline: Duration,
    pub token: CancellationToken,
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, cx: &StepRunContext<'_>) -> Result<Value, OvsError>;
}

/// Handler registry; the dispatcher resolves the tool's category here.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ToolCategory, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production wiring: asset queries and health checks go to the
    /// resolver, service control and command runs to the automation worker.
    pub fn standard(resolver: Arc<AssetResolver>, automation: Arc<dyn AutomationClient>) -> Self {
        let mut r = Self::new();
        r.register(
            ToolCategory::AssetQuery,
            Arc::new(AssetQueryHandler {
                resolver: resolver.clone(),
            }),
        );
        r.register(
            ToolCategory::HealthCheck,
            Arc::new(HealthCheckHandler { resolver }),
        );
        r.register(
            ToolCategory::ServiceControl,
            Arc::new(ServiceControlHandler {
                automation: automation.clone(),
            }),
        );
        r.register(
            ToolCategory::CommandRun,
            Arc::new(CommandRunHandler {
                automation: automation.clone(),
            }),
        );
        r.register(
            ToolCategory::DataRemoval,
            Arc::new(CommandRunHandler { automation }),
        );
        r
    }

    pub fn register(&mut self, category: ToolCategory, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(category, handler);
    }

    pub fn get(&self, category: ToolCategory) -> Result<Arc<dyn StepHandler>, OvsError> {
        self.handlers.get(&category).cloned().ok_or_else(|| {
            OvsError::internal(format!("no step handler registered for '{category}'"))
        })
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Inventory search. Inputs: `search` / filter fields; falls back to the
/// execution target when no explicit filter is present.
struct AssetQueryHandler {
    resolver: Arc<AssetResolver>,
}

#[async_trait]
impl StepHandler for AssetQueryHandler {
    async fn run(&self, cx: &StepRunContext<'_>) -> Result<Value, OvsError> {
        let mut query: AssetQuery = serde_json::from_value(cx.inputs.clone())
            .map_err(|e| OvsError::validation(format!("asset query inputs malformed: {e}")))?;

        if query.search.is_none() && query.asset_id.is_none() {
            query.asset_id = cx.target.asset_id.clone();
            query.search = cx.target.hostname.clone();
        }

        let projection = Projection::default();
        let records = tokio::select! {
            r = self.resolver.search(cx.tenant_id, &query, &projection) => r?,
            _ = cx.token.cancelled() => {
                return Err(OvsError::conflict("asset query cancelled"));
            }
        };

        let answer = disambiguate(records, &projection);
        serde_json::to_value(&answer)
            .map_err(|e| OvsError::internal(format!("asset answer does not serialize: {e}")))
    }
}

/// Connection-profile probe for the target host.
struct HealthCheckHandler {
    resolver: Arc<AssetResolver>,
}

#[async_trait]
impl StepHandler for HealthCheckHandler {
    async fn run(&self, cx: &StepRunContext<'_>) -> Result<Value, OvsError> {
        let host = host_of(cx)?;
        let profile = tokio::select! {
            r = self.resolver.connection_profile(cx.tenant_id, &host) => r?,
            _ = cx.token.cancelled() => {
                return Err(OvsError::conflict("health check cancelled"));
            }
        };

        Ok(match profile {
            Some(p) => json!({"host": host, "reachable": true, "profile": p}),
            None => json!({"host": host, "reachable": false}),
        })
    }
}

/// Service control via the automation worker. Inputs: `service`, `action`.
struct ServiceControlHandler {
    automation: Arc<dyn AutomationClient>,
}

#[async_trait]
impl StepHandler for ServiceControlHandler {
    async fn run(&self, cx: &StepRunContext<'_>) -> Result<Value, OvsError> {
        let host = host_of(cx)?;
        let service = require_str(cx.inputs, "service")?;
        let action = cx
            .inputs
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("restart");

        tokio::select! {
            r = self.automation.control_service(&host, &service, action, cx.inputs, cx.deadline) => r,
            _ = cx.token.cancelled() => {
                Err(OvsError::conflict("service control cancelled"))
            }
        }
    }
}

/// Arbitrary command run via the automation worker.
struct CommandRunHandler {
    automation: Arc<dyn AutomationClient>,
}

#[async_trait]
impl StepHandler for CommandRunHandler {
    async fn run(&self, cx: &StepRunContext<'_>) -> Result<Value, OvsError> {
        let host = host_of(cx)?;
        tokio::select! {
            r = self.automation.run_command(&host, cx.inputs, cx.deadline) => r,
            _ = cx.token.cancelled() => {
                Err(OvsError::conflict("command run cancelled"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn host_of(cx: &StepRunContext<'_>) -> Result<String, OvsError> {
    cx.inputs
        .get("host")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| cx.target.hostname.clone())
        .or_else(|| cx.target.asset_id.clone())
        .ok_or_else(|| OvsError::validation("step has no target host"))
}

fn require_str(inputs: &Value, key: &str) -> Result<String, OvsError> {
    inputs
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| OvsError::validation(format!("step input '{key}' is required")))
}

/// Truncate a step result to the policy's output budget. Applied before
/// persistence; oversized payloads are replaced by a marker that keeps the
/// leading bytes.
pub fn truncate_output(value: Value, max_bytes: usize) -> Value {
    let raw = value.to_string();
    if raw.len() <= max_bytes {
        return value;
    }
    let keep: String = raw.chars().take(max_bytes / 2).collect();
    json!({
        "truncated": true,
        "original_bytes": raw.len(),
        "head": keep,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_outputs_pass_untouched() {
        let v = json!({"ok": true});
        assert_eq!(truncate_output(v.clone(), 1024), v);
    }

    #[test]
    fn oversized_outputs_are_marked_truncated() {
        let big = json!({"blob": "x".repeat(10_000)});
        let out = truncate_output(big, 256);
        assert_eq!(out["truncated"], true);
        assert!(out["original_bytes"].as_u64().unwrap() > 256);
        assert!(out["head"].as_str().unwrap().len() <= 128);
    }

    #[test]
    fn host_falls_back_to_the_target() {
        let target = Target {
            hostname: Some("web-01".into()),
            ..Default::default()
        };
        let inputs = json!({});
        let cx = StepRunContext {
            tenant_id: "t1",
            inputs: &inputs,
            target: &target,
            deadline: Duration::from_secs(1),
            token: CancellationToken::new(),
        };
        assert_eq!(host_of(&cx).unwrap(), "web-01");
    }
}
