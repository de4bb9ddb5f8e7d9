//! Queue manager: the typed facade workers and the engine talk to.
//!
//! All persistence lives in `ovs-db::queue`; this layer adds metrics, the
//! backoff computation on failure, and the periodic lease reaper.

use std::time::Duration as StdDuration;

use chrono::Duration;
use ovs_schemas::OvsError;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use ovs_db::queue::{FailOutcome, QueueItemRow};
use ovs_metrics::Metrics;

#[derive(Clone)]
pub struct QueueManager {
    pool: PgPool,
    lease: Duration,
    metrics: &'static Metrics,
}

impl QueueManager {
    pub fn new(pool: PgPool, lease: StdDuration) -> Self {
        Self {
            pool,
            lease: Duration::milliseconds(lease.as_millis() as i64),
            metrics: Metrics::global(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent per execution.
    pub async fn enqueue(
        &self,
        execution_id: Uuid,
        tenant_id: &str,
        priority: i32,
        max_attempts: i32,
    ) -> Result<bool, OvsError> {
        let created =
            ovs_db::queue::enqueue(&self.pool, execution_id, tenant_id, priority, max_attempts, None)
                .await?;
        self.refresh_depth_gauge().await;
        Ok(created)
    }

    /// Zero or one item, leased for this worker.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<QueueItemRow>, OvsError> {
        ovs_db::queue::dequeue_one(&self.pool, worker_id, self.lease).await
    }

    /// Holder-checked lease extension.
    pub async fn renew_lease(&self, item_id: Uuid, worker_id: &str) -> Result<bool, OvsError> {
        ovs_db::queue::renew_lease(&self.pool, item_id, worker_id, self.lease).await
    }

    pub async fn complete(&self, item_id: Uuid, worker_id: &str) -> Result<bool, OvsError> {
        let done = ovs_db::queue::complete(&self.pool, item_id, worker_id).await?;
        self.refresh_depth_gauge().await;
        Ok(done)
    }

    /// Record a failed attempt: exponential backoff while under budget,
    /// dead-letter beyond it.
    pub async fn fail(
        &self,
        item: &QueueItemRow,
        worker_id: &str,
        reason: &str,
    ) -> Result<FailOutcome, OvsError> {
        let backoff = ovs_engine::queue_backoff(item.attempt);
        let outcome =
            ovs_db::queue::fail(&self.pool, item.item_id, worker_id, reason, backoff).await?;
        self.refresh_depth_gauge().await;
        Ok(outcome)
    }

    /// One reaper sweep; returns the number of leases reset.
    pub async fn reap_stale_leases(&self) -> Result<u64, OvsError> {
        ovs_db::queue::reap_stale_leases(&self.pool).await
    }

    pub async fn total_depth(&self) -> Result<i64, OvsError> {
        ovs_db::queue::total_depth(&self.pool).await
    }

    /// Update `queue_depth{sla}` and `lease_holders` from the tables.
    pub async fn refresh_depth_gauge(&self) {
        match ovs_db::queue::depth_by_sla(&self.pool).await {
            Ok(depths) => {
                for sla in ["FAST", "MEDIUM", "LONG"] {
                    let depth = depths
                        .iter()
                        .find(|(s, _)| s == sla)
                        .map(|(_, d)| *d)
                        .unwrap_or(0);
                    self.metrics.queue_depth.with_label_values(&[sla]).set(depth);
                }
            }
            Err(e) => warn!(error = %e, "queue depth gauge refresh failed"),
        }
        if let Ok(n) = ovs_db::locks::live_lease_count(&self.pool).await {
            self.metrics.lease_holders.set(n);
        }
    }
}

/// Periodic lease reaper. Expired queue leases are already invisible to
/// renewal and visible to dequeue; the sweep keeps the columns tidy and the
/// gauges honest.
pub fn spawn_queue_reaper(
    manager: QueueManager,
    interval: StdDuration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match manager.reap_stale_leases().await {
                        Ok(0) => {}
                        Ok(n) => debug!(reaped = n, "stale queue leases reset"),
                        Err(e) => warn!(error = %e, "queue reaper sweep failed"),
                    }
                    manager.refresh_depth_gauge().await;
                }
            }
        }
    })
}
