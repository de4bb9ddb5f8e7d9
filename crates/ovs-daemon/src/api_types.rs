//! Wire DTOs for the daemon's HTTP surface. Field names here are the
//! stable contract.

use chrono::{DateTime, Utc};
use ovs_schemas::{
    ExecutionMode, ExecutionStatus, Plan, StepStatus, Target, ToolSpec, WireError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use ovs_engine::Preferences;

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateExecutionRequest {
    pub plan: Plan,
    pub target: Target,
    #[serde(default)]
    pub preferences: Option<Preferences>,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionCreatedResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub mode: ExecutionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub ordinal: i32,
    pub tool_name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub attempt: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionView {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub mode: ExecutionMode,
    pub sla_class: ovs_schemas::SlaClass,
    pub action_class: ovs_schemas::ActionClass,
    pub attempt_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub steps: Vec<StepView>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecideRequest {
    /// APPROVED | REJECTED
    pub decision: String,
    #[serde(default)]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct EventView {
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventsPage {
    pub events: Vec<EventView>,
    /// Pass back as `since` to continue.
    pub cursor: i64,
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ExplainRequest {
    pub intent: String,
    /// Capability the candidates must carry.
    pub capability: String,
    #[serde(default)]
    pub mode: Option<ovs_schemas::SelectionMode>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub platform: Option<ovs_schemas::Platform>,
    #[serde(default)]
    pub entity_count: Option<f64>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolPutResponse {
    pub tool_name: String,
    pub version: i32,
}

// ---------------------------------------------------------------------------
// Secrets broker (internal only)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CredentialUpsertRequest {
    pub host: String,
    pub purpose: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialLookupRequest {
    pub host: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialLookupResponse {
    pub handle: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

// ---------------------------------------------------------------------------
// Shared error envelope re-export
// ---------------------------------------------------------------------------

pub type ErrorEnvelope = WireError;
