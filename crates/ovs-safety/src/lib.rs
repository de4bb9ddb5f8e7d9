//! The safety layer: seven cross-cutting guards wrapping every execution.
//!
//! Guard order is fixed: idempotency → approval → mutex → secrets → RBAC →
//! timeout → cancellation, with log masking applied at every sink (see
//! `ovs-audit`). Idempotency and approval act at the execution boundary and
//! are consulted by the engine at submit/claim time; the remaining five form
//! the per-step [`pipeline::GuardPipeline`].
//!
//! Guards are values, not annotations: composition is an explicit ordered
//! list conforming to a common before/after contract.

pub mod approval;
pub mod cancel;
pub mod idempotency;
pub mod mutex;
pub mod pipeline;
pub mod rbac;
pub mod secrets_scope;
pub mod timeout;

pub use approval::ApprovalGate;
pub use cancel::{CancellationManager, CleanupHandler, CleanupRegistry};
pub use idempotency::{IdempotencyDecision, IdempotencyGuard};
pub use mutex::{acquire_locks, spawn_lock_reaper, HeldLocks};
pub use pipeline::{GuardPipeline, StepContext, StepGuard};
pub use rbac::{AccessRequest, PolicyProvider, RbacValidator, StaticPolicyProvider};
pub use secrets_scope::{SecretHandle, SecretResolver, SecretsManager};
pub use timeout::{timeout_policy, TimeoutPolicy, TimeoutTable};
