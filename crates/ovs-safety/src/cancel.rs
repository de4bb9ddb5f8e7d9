//! Cancellation manager.
//!
//! One `CancellationToken` per execution; child tokens per step. Any
//! component may observe a token and cooperatively exit at its next I/O
//! boundary or retry. Cancellation sources: explicit user request, timeout
//! expiry, parent cancellation, worker shutdown. Cleanup handlers are
//! registered per tool category and must finish within the drain window —
//! overruns are force-closed and the event log records FORCED_CANCEL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ovs_schemas::{CancelReason, OvsError, ToolCategory};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CancellationManager
// ---------------------------------------------------------------------------

struct Entry {
    token: CancellationToken,
    reason: Option<CancelReason>,
}

/// Registry of live execution tokens. Shared via `Arc`; all methods take
/// `&self`.
#[derive(Default)]
pub struct CancellationManager {
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl CancellationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an execution and hand back its root token. Re-registering
    /// an id returns the existing token (a re-claimed execution keeps its
    /// cancellation state).
    pub async fn register(&self, execution_id: Uuid) -> CancellationToken {
        let mut map = self.entries.lock().await;
        map.entry(execution_id)
            .or_insert_with(|| Entry {
                token: CancellationToken::new(),
                reason: None,
            })
            .token
            .clone()
    }

    /// Fire the execution's token with `reason`. The first reason wins;
    /// later calls are no-ops. Returns `false` for unknown executions.
    pub async fn cancel(&self, execution_id: Uuid, reason: CancelReason) -> bool {
        let mut map = self.entries.lock().await;
        match map.get_mut(&execution_id) {
            Some(entry) => {
                if entry.reason.is_none() {
                    entry.reason = Some(reason);
                    entry.token.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Why the token fired, if it has.
    pub async fn reason(&self, execution_id: Uuid) -> Option<CancelReason> {
        self.entries
            .lock()
            .await
            .get(&execution_id)
            .and_then(|e| e.reason)
    }

    /// Drop the registry entry once the execution reaches a terminal state.
    pub async fn deregister(&self, execution_id: Uuid) {
        self.entries.lock().await.remove(&execution_id);
    }

    /// Cancel every live execution (worker shutdown path).
    pub async fn cancel_all(&self, reason: CancelReason) {
        let mut map = self.entries.lock().await;
        for entry in map.values_mut() {
            if entry.reason.is_none() {
                entry.reason = Some(reason);
                entry.token.cancel();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cleanup handlers
// ---------------------------------------------------------------------------

/// Per-step-kind cleanup run when a step is cancelled mid-flight (kill the
/// spawned process, close the SSH channel, …).
#[async_trait]
pub trait CleanupHandler: Send + Sync {
    async fn cleanup(&self, execution_id: Uuid, step_inputs: &Value) -> Result<(), OvsError>;
}

/// Cleanup registry keyed by tool category.
#[derive(Default, Clone)]
pub struct CleanupRegistry {
    handlers: HashMap<ToolCategory, Arc<dyn CleanupHandler>>,
}

/// Outcome of a bounded cleanup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// No handler registered, or the handler finished inside the window.
    Drained,
    /// The handler exceeded the drain window — caller must record
    /// FORCED_CANCEL.
    ForcedClose,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, category: ToolCategory, handler: Arc<dyn CleanupHandler>) {
        self.handlers.insert(category, handler);
    }

    /// Run the category's handler, bounded by `drain_window`.
    pub async fn run(
        &self,
        category: ToolCategory,
        execution_id: Uuid,
        step_inputs: &Value,
        drain_window: Duration,
    ) -> CleanupOutcome {
        let Some(handler) = self.handlers.get(&category) else {
            return CleanupOutcome::Drained;
        };

        match tokio::time::timeout(drain_window, handler.cleanup(execution_id, step_inputs)).await
        {
            Ok(_) => CleanupOutcome::Drained,
            Err(_) => CleanupOutcome::ForcedClose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_cancel_reason_wins() {
        let mgr = CancellationManager::new();
        let id = Uuid::new_v4();
        let token = mgr.register(id).await;

        assert!(mgr.cancel(id, CancelReason::User).await);
        assert!(mgr.cancel(id, CancelReason::WorkerShutdown).await);

        assert!(token.is_cancelled());
        assert_eq!(mgr.reason(id).await, Some(CancelReason::User));
    }

    #[tokio::test]
    async fn register_is_idempotent_per_execution() {
        let mgr = CancellationManager::new();
        let id = Uuid::new_v4();
        let a = mgr.register(id).await;
        let b = mgr.register(id).await;
        a.cancel();
        assert!(b.is_cancelled(), "same underlying token");
    }

    #[tokio::test]
    async fn cancel_unknown_execution_reports_false() {
        let mgr = CancellationManager::new();
        assert!(!mgr.cancel(Uuid::new_v4(), CancelReason::User).await);
    }

    #[tokio::test]
    async fn cancel_all_fires_every_token() {
        let mgr = CancellationManager::new();
        let a = mgr.register(Uuid::new_v4()).await;
        let b = mgr.register(Uuid::new_v4()).await;
        mgr.cancel_all(CancelReason::WorkerShutdown).await;
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    struct SlowCleanup;

    #[async_trait]
    impl CleanupHandler for SlowCleanup {
        async fn cleanup(&self, _id: Uuid, _inputs: &Value) -> Result<(), OvsError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_overrun_is_force_closed() {
        let mut reg = CleanupRegistry::new();
        reg.register(ToolCategory::CommandRun, Arc::new(SlowCleanup));

        let out = reg
            .run(
                ToolCategory::CommandRun,
                Uuid::new_v4(),
                &serde_json::json!({}),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(out, CleanupOutcome::ForcedClose);
    }

    #[tokio::test]
    async fn missing_handler_drains_immediately() {
        let reg = CleanupRegistry::new();
        let out = reg
            .run(
                ToolCategory::AssetQuery,
                Uuid::new_v4(),
                &serde_json::json!({}),
                Duration::from_millis(10),
            )
            .await;
        assert_eq!(out, CleanupOutcome::Drained);
    }
}
