//! Shared test fixtures: domain-object builders and in-memory fakes for the
//! external collaborators (inventory, automation).
//!
//! Everything here is test support; nothing is compiled into production
//! binaries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use ovs_assets::client::{AssetQuery, InventoryClient};
use ovs_engine::AutomationClient;
use ovs_schemas::{
    AssetRecord, ConnectionProfile, FailurePolicy, OvsError, ParamSpec, PatternPerf, Plan,
    PlanStep, Platform, Target, ToolCategory, ToolPolicy, ToolSpec,
};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// One-step plan invoking `tool` with `inputs`.
pub fn plan_of(tool: &str, inputs: Value) -> Plan {
    Plan {
        steps: vec![step_of("step-1", tool, inputs)],
    }
}

pub fn step_of(name: &str, tool: &str, inputs: Value) -> PlanStep {
    PlanStep {
        name: name.to_string(),
        tool_name: tool.to_string(),
        pattern: None,
        inputs,
        on_failure: FailurePolicy::Halt,
    }
}

pub fn target_host(hostname: &str) -> Target {
    Target {
        asset_id: None,
        hostname: Some(hostname.to_string()),
        environment: None,
    }
}

/// A minimal enabled tool spec with a single pattern.
pub fn tool_spec(name: &str, category: ToolCategory, production_safe: bool) -> ToolSpec {
    ToolSpec {
        tool_name: name.to_string(),
        version: 1,
        platform: Platform::Cross,
        category,
        capabilities: vec![format!("{}.run", category)],
        patterns: BTreeMap::from([("default".to_string(), json!({"page_size": 50}))]),
        inputs: vec![ParamSpec {
            name: "search".to_string(),
            param_type: "string".to_string(),
            required: false,
            description: None,
        }],
        expected_outputs: vec!["result".to_string()],
        policy: ToolPolicy {
            production_safe,
            ..Default::default()
        },
        performance_profile: BTreeMap::from([(
            "default".to_string(),
            PatternPerf {
                time_ms_formula: "100 + p95_latency".to_string(),
                cost_formula: "0".to_string(),
                complexity: "0.2".to_string(),
                accuracy: 0.9,
                completeness: 0.9,
            },
        )]),
        enabled: true,
    }
}

/// An asset record with sane defaults.
pub fn asset(hostname: &str, environment: &str) -> AssetRecord {
    AssetRecord {
        asset_id: format!("asset-{hostname}"),
        name: hostname.to_string(),
        hostname: hostname.to_string(),
        ip_address: "10.20.0.11".to_string(),
        os_type: "linux".to_string(),
        os_version: Some("6.1".to_string()),
        environment: environment.to_string(),
        service_type: Some("nginx".to_string()),
        port: Some(22),
        is_secure: true,
        credential_type: Some("password".to_string()),
        is_active: true,
        connection_status: Some("reachable".to_string()),
        updated_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    }
}

// ---------------------------------------------------------------------------
// Fake inventory
// ---------------------------------------------------------------------------

/// In-memory inventory: substring search over hostnames, optional scripted
/// failure for breaker tests.
pub struct FakeInventory {
    records: Mutex<Vec<AssetRecord>>,
    pub fail_next: Mutex<u32>,
}

impl FakeInventory {
    pub fn with_assets(records: Vec<AssetRecord>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(records),
            fail_next: Mutex::new(0),
        })
    }

    pub async fn fail_next_calls(&self, n: u32) {
        *self.fail_next.lock().await = n;
    }

    async fn maybe_fail(&self) -> Result<(), OvsError> {
        let mut remaining = self.fail_next.lock().await;
        if *remaining > 0 {
            *remaining -= 1;
            return Err(OvsError::transient("scripted inventory failure"));
        }
        Ok(())
    }

    fn matches(record: &AssetRecord, query: &AssetQuery) -> bool {
        if let Some(id) = &query.asset_id {
            if &record.asset_id != id {
                return false;
            }
        }
        if let Some(s) = &query.search {
            let s = s.to_ascii_lowercase();
            if !record.hostname.to_ascii_lowercase().contains(&s)
                && !record.name.to_ascii_lowercase().contains(&s)
                && !record.ip_address.contains(&s)
            {
                return false;
            }
        }
        if let Some(env) = &query.environment {
            if !record.environment.eq_ignore_ascii_case(env) {
                return false;
            }
        }
        if let Some(os) = &query.os_type {
            if !record.os_type.eq_ignore_ascii_case(os) {
                return false;
            }
        }
        if let Some(active) = query.is_active {
            if record.is_active != active {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl InventoryClient for FakeInventory {
    async fn search(
        &self,
        _tenant_id: &str,
        query: &AssetQuery,
    ) -> Result<Vec<AssetRecord>, OvsError> {
        self.maybe_fail().await?;
        let records = self.records.lock().await;
        let limit = query.limit.unwrap_or(50) as usize;
        Ok(records
            .iter()
            .filter(|r| Self::matches(r, query))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, tenant_id: &str, query: &AssetQuery) -> Result<i64, OvsError> {
        Ok(self.search(tenant_id, query).await?.len() as i64)
    }

    async fn connection_profile(
        &self,
        _tenant_id: &str,
        host: &str,
    ) -> Result<Option<ConnectionProfile>, OvsError> {
        self.maybe_fail().await?;
        let records = self.records.lock().await;
        Ok(records.iter().find(|r| r.hostname == host).map(|r| {
            ConnectionProfile {
                host: r.hostname.clone(),
                port: r.port.unwrap_or(22),
                protocol: "ssh".to_string(),
                is_secure: r.is_secure,
                credential_type: r.credential_type.clone(),
                updated_at: r.updated_at,
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// Fake automation
// ---------------------------------------------------------------------------

/// Records every call; optionally fails or stalls to exercise retries,
/// timeouts, and cancellation.
pub struct FakeAutomation {
    pub calls: Mutex<Vec<Value>>,
    pub fail_next: Mutex<u32>,
    pub stall: Mutex<Option<Duration>>,
}

impl FakeAutomation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(vec![]),
            fail_next: Mutex::new(0),
            stall: Mutex::new(None),
        })
    }

    pub async fn fail_next_calls(&self, n: u32) {
        *self.fail_next.lock().await = n;
    }

    pub async fn stall_for(&self, d: Duration) {
        *self.stall.lock().await = Some(d);
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    async fn observe(&self, call: Value) -> Result<(), OvsError> {
        self.calls.lock().await.push(call);
        if let Some(d) = *self.stall.lock().await {
            tokio::time::sleep(d).await;
        }
        let mut remaining = self.fail_next.lock().await;
        if *remaining > 0 {
            *remaining -= 1;
            return Err(OvsError::transient("scripted automation failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl AutomationClient for FakeAutomation {
    async fn run_command(
        &self,
        host: &str,
        inputs: &Value,
        _deadline: Duration,
    ) -> Result<Value, OvsError> {
        self.observe(json!({"op": "run_command", "host": host, "inputs": inputs}))
            .await?;
        Ok(json!({"host": host, "exit_code": 0, "stdout": "ok"}))
    }

    async fn control_service(
        &self,
        host: &str,
        service: &str,
        action: &str,
        inputs: &Value,
        _deadline: Duration,
    ) -> Result<Value, OvsError> {
        self.observe(json!({
            "op": "control_service", "host": host,
            "service": service, "action": action, "inputs": inputs,
        }))
        .await?;
        Ok(json!({"host": host, "service": service, "action": action, "status": "done"}))
    }
}
