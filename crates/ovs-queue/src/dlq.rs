//! Dead-letter queue handler: paginated listing, requeue, archive with
//! retention, and failure-reason stats.

use chrono::{Duration, Utc};
use ovs_schemas::OvsError;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use ovs_db::queue::DlqRow;

#[derive(Clone)]
pub struct DlqHandler {
    pool: PgPool,
}

/// Aggregate view of why items died.
#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub total: i64,
    pub by_reason: Vec<ReasonCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReasonCount {
    pub reason: String,
    pub count: i64,
}

impl DlqHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Unarchived dead items, newest first.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<DlqRow>, OvsError> {
        ovs_db::queue::dlq_list(&self.pool, limit.clamp(1, 500), offset.max(0)).await
    }

    /// Put a dead item back on the queue. `reset_attempt` restarts the
    /// retry budget; without it the item gets exactly one more claim before
    /// it dead-letters again.
    pub async fn requeue(&self, item_id: Uuid, reset_attempt: bool) -> Result<(), OvsError> {
        let moved = ovs_db::queue::dlq_requeue(&self.pool, item_id, reset_attempt).await?;
        if !moved {
            return Err(OvsError::not_found(format!(
                "no unarchived dead-letter item {item_id}"
            )));
        }
        Ok(())
    }

    /// Archive items dead for longer than `retention_days`.
    pub async fn archive_with_retention(&self, retention_days: i64) -> Result<u64, OvsError> {
        let cutoff = Utc::now() - Duration::days(retention_days.max(0));
        ovs_db::queue::dlq_archive_older_than(&self.pool, cutoff).await
    }

    /// Failure-reason aggregate over unarchived items.
    pub async fn stats(&self) -> Result<DlqStats, OvsError> {
        let by_reason: Vec<ReasonCount> = ovs_db::queue::dlq_reason_stats(&self.pool)
            .await?
            .into_iter()
            .map(|(reason, count)| ReasonCount { reason, count })
            .collect();
        let total = by_reason.iter().map(|r| r.count).sum();
        Ok(DlqStats { total, by_reason })
    }
}
