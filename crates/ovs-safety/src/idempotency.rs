//! Idempotency guard.
//!
//! Submit computes a deterministic fingerprint (SHA-256 over tenant, actor,
//! canonical plan, canonical target) and looks for a prior execution with
//! the same key inside the dedup window. A prior that did not end FAILED is
//! replayed — the caller gets the original row and no new work happens. A
//! FAILED prior permits a fresh attempt under the same key.

use chrono::{Duration, Utc};
use ovs_schemas::{idempotency_key, ExecutionStatus, OvsError};
use serde_json::Value;
use sqlx::PgPool;

use ovs_db::executions::{find_by_idempotency_key, ExecutionRow};

/// Outcome of the dedup-window check.
#[derive(Debug)]
pub enum IdempotencyDecision {
    /// No prior inside the window — create a new execution.
    New,
    /// A prior exists that did not end FAILED — return it, run nothing.
    Replay(ExecutionRow),
    /// The prior ended FAILED — a fresh attempt is allowed under the same key.
    RetryAllowed(ExecutionRow),
}

#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    window: Duration,
}

impl IdempotencyGuard {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// Fingerprint of one request; stable under JSON key ordering.
    pub fn fingerprint(
        &self,
        tenant_id: &str,
        actor_id: &str,
        plan: &Value,
        target: &Value,
    ) -> String {
        idempotency_key(tenant_id, actor_id, plan, target)
    }

    /// Look up the newest prior for `key` inside the dedup window and
    /// classify it.
    pub async fn check(
        &self,
        pool: &PgPool,
        tenant_id: &str,
        key: &str,
    ) -> Result<IdempotencyDecision, OvsError> {
        let window_start = Utc::now() - self.window;
        let prior = find_by_idempotency_key(pool, tenant_id, key, window_start).await?;

        Ok(match prior {
            None => IdempotencyDecision::New,
            Some(row) if row.status == ExecutionStatus::Failed => {
                IdempotencyDecision::RetryAllowed(row)
            }
            Some(row) => IdempotencyDecision::Replay(row),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_ignores_key_order() {
        let g = IdempotencyGuard::new(Duration::hours(24));
        let a = g.fingerprint(
            "t1",
            "u1",
            &json!({"steps": [{"b": 2, "a": 1}]}),
            &json!({"hostname": "h"}),
        );
        let b = g.fingerprint(
            "t1",
            "u1",
            &json!({"steps": [{"a": 1, "b": 2}]}),
            &json!({"hostname": "h"}),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_changes_with_actor() {
        let g = IdempotencyGuard::new(Duration::hours(24));
        let plan = json!({"steps": []});
        let target = json!({"hostname": "h"});
        assert_ne!(
            g.fingerprint("t1", "u1", &plan, &target),
            g.fingerprint("t1", "u2", &plan, &target)
        );
    }
}
