//! Shared domain types and wire contracts for the Overseer execution core.
//!
//! Everything that crosses a crate or HTTP boundary lives here: execution
//! statuses and classification enums, plan/step payloads, the typed error
//! taxonomy, tool catalog records, asset records, and the canonical-JSON
//! helpers used for idempotency fingerprints.

pub mod asset;
pub mod canonical;
pub mod error;
pub mod event;
pub mod execution;
pub mod plan;
pub mod tool;

pub use asset::{AssetRecord, ConnectionProfile};
pub use canonical::{canonical_json, idempotency_key};
pub use error::{ErrorKind, OvsError, WireError, WireErrorBody};
pub use event::{CancelReason, EventKind};
pub use execution::{
    ActionClass, ApprovalState, ExecutionMode, ExecutionStatus, SelectionMode, SlaClass,
    StepStatus,
};
pub use plan::{FailurePolicy, Plan, PlanStep, Target};
pub use tool::{ParamSpec, PatternPerf, Platform, ToolCategory, ToolPolicy, ToolSpec};
