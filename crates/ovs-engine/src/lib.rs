//! Stage E — the execution engine.
//!
//! Turns a validated plan into a safely executed run against real
//! infrastructure: classification, idempotency, approval routing, the
//! guard pipeline, step dispatch with retries, and terminal bookkeeping.

pub mod automation;
pub mod classify;
pub mod engine;
pub mod fsm;
pub mod handlers;

pub use automation::{AutomationClient, HttpAutomationClient};
pub use classify::{classify, Classification, Preferences};
pub use engine::{
    queue_backoff, EngineDeps, ExecutionEngine, ExecutionResponse, RunOutcome, SubmitRequest,
};
pub use fsm::{ExecutionFsm, TransitionError};
pub use handlers::{HandlerRegistry, StepHandler, StepRunContext};
