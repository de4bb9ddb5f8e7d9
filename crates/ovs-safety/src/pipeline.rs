//! The ordered guard pipeline the step dispatcher drives.
//!
//! `before` hooks run in pipeline order; `after` hooks run in reverse, and
//! run for every guard whose `before` completed — including when a later
//! guard or the handler itself failed. Guards hold their own dependencies;
//! composition is an explicit ordered list, never inheritance.
//!
//! [`GuardPipeline::standard`] pins the contract order for the step-level
//! guards: mutex → secrets → RBAC → timeout → cancellation. (Idempotency
//! and approval act earlier, at the execution boundary.)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ovs_schemas::{ActionClass, ErrorKind, OvsError, ToolCategory};
use serde_json::Value;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::mutex::{acquire_locks, HeldLocks};
use crate::rbac::{AccessRequest, RbacValidator};
use crate::secrets_scope::{SecretResolver, SecretsManager};
use crate::timeout::ExecutionBudget;
use ovs_audit::EventWriter;

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Mutable state threaded through one step's guard pass and handler call.
pub struct StepContext {
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub actor_id: String,
    pub worker_id: String,

    pub step_ordinal: i32,
    pub tool_name: String,
    pub category: ToolCategory,
    pub action_class: ActionClass,
    pub environment: String,
    pub required_permissions: Vec<String>,
    pub approval_id: Option<Uuid>,

    /// Step inputs; the secrets guard swaps refs for handles in place.
    pub inputs: Value,
    /// Mutex keys this step must hold (empty for pure reads).
    pub lock_keys: Vec<String>,
    /// Wall-clock budget for the attempt; the timeout guard reads it.
    pub budget: ExecutionBudget,
    /// Deadline handed to the handler, set by the timeout guard.
    pub step_deadline: Duration,
    /// Cooperative cancellation for this execution.
    pub token: CancellationToken,

    // Guard-held state, released in `after`. Callers initialize these
    // empty; only the guards themselves write them.
    pub held_locks: Option<HeldLocks>,
    pub issued_handles: Vec<String>,
}

impl StepContext {
    /// True once the execution has been cancelled; the step loop checks this
    /// at every I/O boundary.
    pub fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// StepGuard
// ---------------------------------------------------------------------------

/// The common before/after contract every step-level guard conforms to.
#[async_trait]
pub trait StepGuard: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before(&self, cx: &mut StepContext) -> Result<(), OvsError>;

    /// Best-effort teardown; must not fail the step.
    async fn after(&self, _cx: &mut StepContext) {}
}

// ---------------------------------------------------------------------------
// GuardPipeline
// ---------------------------------------------------------------------------

pub struct GuardPipeline {
    guards: Vec<Arc<dyn StepGuard>>,
}

impl GuardPipeline {
    /// The fixed-order standard pipeline.
    pub fn standard(
        pool: PgPool,
        lock_ttl: chrono::Duration,
        resolver: Arc<dyn SecretResolver>,
        validator: Arc<RbacValidator>,
        events: EventWriter,
    ) -> Self {
        Self {
            guards: vec![
                Arc::new(MutexGuard { pool, lock_ttl }),
                Arc::new(SecretsGuard { resolver }),
                Arc::new(RbacGuard { validator, events }),
                Arc::new(TimeoutGuard),
                Arc::new(CancellationGuard),
            ],
        }
    }

    /// Custom composition for tests.
    pub fn from_guards(guards: Vec<Arc<dyn StepGuard>>) -> Self {
        Self { guards }
    }

    /// Run every `before` in order. On failure, `after` hooks of the guards
    /// already entered run in reverse before the error returns.
    pub async fn enter(&self, cx: &mut StepContext) -> Result<(), OvsError> {
        let mut entered = 0usize;
        for guard in &self.guards {
            match guard.before(cx).await {
                Ok(()) => entered += 1,
                Err(e) => {
                    for g in self.guards[..entered].iter().rev() {
                        g.after(cx).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Run every `after` in reverse order.
    pub async fn exit(&self, cx: &mut StepContext) {
        for guard in self.guards.iter().rev() {
            guard.after(cx).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Guard implementations
// ---------------------------------------------------------------------------

/// Per-asset lease locks for writing steps.
struct MutexGuard {
    pool: PgPool,
    lock_ttl: chrono::Duration,
}

#[async_trait]
impl StepGuard for MutexGuard {
    fn name(&self) -> &'static str {
        "mutex"
    }

    async fn before(&self, cx: &mut StepContext) -> Result<(), OvsError> {
        if !cx.action_class.is_write() || cx.lock_keys.is_empty() {
            return Ok(());
        }

        let held = acquire_locks(
            &self.pool,
            cx.lock_keys.clone(),
            &cx.worker_id,
            self.lock_ttl,
            cx.budget.step_deadline(),
        )
        .await?;
        cx.held_locks = Some(held);
        Ok(())
    }

    async fn after(&self, cx: &mut StepContext) {
        if let Some(held) = cx.held_locks.take() {
            held.release().await;
        }
    }
}

/// Secret-reference resolution; handles are released on exit.
struct SecretsGuard {
    resolver: Arc<dyn SecretResolver>,
}

#[async_trait]
impl StepGuard for SecretsGuard {
    fn name(&self) -> &'static str {
        "secrets"
    }

    async fn before(&self, cx: &mut StepContext) -> Result<(), OvsError> {
        let mgr = SecretsManager::new(self.resolver.as_ref());
        let resolved = mgr.resolve_inputs(&cx.tenant_id, &cx.inputs).await?;
        cx.inputs = resolved.inputs;
        cx.issued_handles = resolved.issued;
        Ok(())
    }

    async fn after(&self, cx: &mut StepContext) {
        if cx.issued_handles.is_empty() {
            return;
        }
        let mgr = SecretsManager::new(self.resolver.as_ref());
        let issued = std::mem::take(&mut cx.issued_handles);
        mgr.release_all(&issued).await;
    }
}

/// Deny-by-default authorization with audited decisions.
struct RbacGuard {
    validator: Arc<RbacValidator>,
    events: EventWriter,
}

#[async_trait]
impl StepGuard for RbacGuard {
    fn name(&self) -> &'static str {
        "rbac"
    }

    async fn before(&self, cx: &mut StepContext) -> Result<(), OvsError> {
        let req = AccessRequest {
            tenant_id: cx.tenant_id.clone(),
            actor_id: cx.actor_id.clone(),
            resource: cx
                .lock_keys
                .first()
                .cloned()
                .unwrap_or_else(|| "unscoped".to_string()),
            action: cx.tool_name.clone(),
            environment: cx.environment.clone(),
            action_class: cx.action_class,
            required_permissions: cx.required_permissions.clone(),
            approval_id: cx.approval_id,
        };
        self.validator
            .authorize(&req, cx.execution_id, &self.events)
            .await
    }
}

/// Budget check; stamps the handler deadline.
struct TimeoutGuard;

#[async_trait]
impl StepGuard for TimeoutGuard {
    fn name(&self) -> &'static str {
        "timeout"
    }

    async fn before(&self, cx: &mut StepContext) -> Result<(), OvsError> {
        if cx.budget.expired() {
            return Err(OvsError::timeout(format!(
                "execution budget exhausted before step {}",
                cx.step_ordinal
            )));
        }
        cx.step_deadline = cx.budget.step_deadline();
        Ok(())
    }
}

/// Last gate before the handler: do not start a cancelled step.
struct CancellationGuard;

#[async_trait]
impl StepGuard for CancellationGuard {
    fn name(&self) -> &'static str {
        "cancellation"
    }

    async fn before(&self, cx: &mut StepContext) -> Result<(), OvsError> {
        if cx.cancelled() {
            return Err(OvsError::new(
                ErrorKind::Conflict,
                format!("execution cancelled before step {} started", cx.step_ordinal),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeout::{timeout_policy, ExecutionBudget};
    use ovs_schemas::SlaClass;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn cx() -> StepContext {
        StepContext {
            execution_id: Uuid::new_v4(),
            tenant_id: "t1".into(),
            actor_id: "u1".into(),
            worker_id: "w1".into(),
            step_ordinal: 0,
            tool_name: "asset_search".into(),
            category: ToolCategory::AssetQuery,
            action_class: ActionClass::Read,
            environment: "staging".into(),
            required_permissions: vec![],
            approval_id: None,
            inputs: serde_json::json!({}),
            lock_keys: vec![],
            budget: ExecutionBudget::start(timeout_policy(SlaClass::Fast, ActionClass::Read)),
            step_deadline: Duration::ZERO,
            token: CancellationToken::new(),
            held_locks: None,
            issued_handles: vec![],
        }
    }

    struct Recorder {
        label: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
        fail: bool,
        entered: AtomicUsize,
    }

    #[async_trait]
    impl StepGuard for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn before(&self, _cx: &mut StepContext) -> Result<(), OvsError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("before:{}", self.label));
            if self.fail {
                return Err(OvsError::policy("denied"));
            }
            Ok(())
        }

        async fn after(&self, _cx: &mut StepContext) {
            self.log.lock().unwrap().push(format!("after:{}", self.label));
        }
    }

    fn recorder(
        label: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
        fail: bool,
    ) -> Arc<dyn StepGuard> {
        Arc::new(Recorder {
            label,
            log,
            fail,
            entered: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn after_runs_in_reverse_order() {
        let log = Arc::new(StdMutex::new(vec![]));
        let p = GuardPipeline::from_guards(vec![
            recorder("a", log.clone(), false),
            recorder("b", log.clone(), false),
        ]);

        let mut cx = cx();
        p.enter(&mut cx).await.unwrap();
        p.exit(&mut cx).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a", "before:b", "after:b", "after:a"]
        );
    }

    #[tokio::test]
    async fn failed_before_unwinds_entered_guards_only() {
        let log = Arc::new(StdMutex::new(vec![]));
        let p = GuardPipeline::from_guards(vec![
            recorder("a", log.clone(), false),
            recorder("b", log.clone(), true),
            recorder("c", log.clone(), false),
        ]);

        let mut cx = cx();
        let err = p.enter(&mut cx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Policy);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:a", "before:b", "after:a"],
            "guard c never entered; only a unwinds"
        );
    }

    #[tokio::test]
    async fn timeout_guard_rejects_an_exhausted_budget() {
        let guard = TimeoutGuard;
        let mut c = cx();
        c.budget = ExecutionBudget::start(crate::timeout::TimeoutPolicy {
            step_timeout_ms: 0,
            total_timeout_ms: 0,
            heartbeat_ms: 1,
            max_output_bytes: 1,
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = guard.before(&mut c).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn cancellation_guard_blocks_cancelled_steps() {
        let guard = CancellationGuard;
        let mut c = cx();
        c.token.cancel();
        let err = guard.before(&mut c).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }
}
