//! The worker pool.
//!
//! Each worker owns a dequeue loop, a heartbeat loop for the item it is
//! processing, and a cancellation-aware run through the engine. The
//! supervisor keeps the pool between its min and max bounds, scaling on
//! queue depth and respawning workers that die.
//!
//! Graceful shutdown: stop dequeuing, cancel in-flight executions with
//! WORKER_SHUTDOWN, give them the drain window, then let lease expiry hand
//! unfinished items to other workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::manager::QueueManager;
use ovs_db::queue::{FailOutcome, QueueItemRow};
use ovs_engine::{ExecutionEngine, RunOutcome};
use ovs_schemas::CancelReason;
use ovs_safety::CancellationManager;

/// Idle poll period when the queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(750);
/// How long shutdown waits for in-flight steps to drain.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);
/// Supervisor cadence.
const SUPERVISE_EVERY: Duration = Duration::from_secs(5);
/// Queue depth per worker that triggers scale-up.
const DEPTH_PER_WORKER: i64 = 4;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub heartbeat_interval: Duration,
}

pub struct WorkerPool {
    supervisor: JoinHandle<()>,
    shutdown: CancellationToken,
    cancellations: Arc<CancellationManager>,
}

impl WorkerPool {
    /// Start the pool. Returns once the supervisor and the initial workers
    /// are running.
    pub fn start(
        manager: QueueManager,
        engine: Arc<ExecutionEngine>,
        cancellations: Arc<CancellationManager>,
        cfg: WorkerPoolConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(
            manager,
            engine,
            cfg,
            shutdown.clone(),
        ));
        Self {
            supervisor,
            shutdown,
            cancellations,
        }
    }

    /// Graceful shutdown: no new items, cancel in-flight work, bounded
    /// drain, then stop.
    pub async fn shutdown(self) {
        info!("worker pool shutting down");
        self.shutdown.cancel();
        self.cancellations
            .cancel_all(CancelReason::WorkerShutdown)
            .await;

        if tokio::time::timeout(SHUTDOWN_DRAIN, self.supervisor)
            .await
            .is_err()
        {
            warn!("worker pool did not drain inside the window; leases will expire");
        }
    }
}

/// Supervisor: keep worker count within bounds, respawn the dead, scale on
/// depth.
async fn supervise(
    manager: QueueManager,
    engine: Arc<ExecutionEngine>,
    cfg: WorkerPoolConfig,
    shutdown: CancellationToken,
) {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    let spawn_worker = |workers: &mut Vec<JoinHandle<()>>| {
        let id = format!(
            "{}:{}:{}",
            hostname(),
            std::process::id(),
            Uuid::new_v4().simple()
        );
        workers.push(tokio::spawn(worker_loop(
            id,
            manager.clone(),
            engine.clone(),
            cfg.heartbeat_interval,
            shutdown.clone(),
        )));
    };

    for _ in 0..cfg.min_workers {
        spawn_worker(&mut workers);
    }
    info!(workers = workers.len(), "worker pool started");

    let mut ticker = tokio::time::interval(SUPERVISE_EVERY);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                // Respawn anything that died (panicked or aborted).
                let before = workers.len();
                workers.retain(|h| !h.is_finished());
                let died = before - workers.len();
                if died > 0 {
                    warn!(died, "workers restarted by supervisor");
                    for _ in 0..died.min(cfg.min_workers) {
                        spawn_worker(&mut workers);
                    }
                }

                // Depth-based scaling within [min, max].
                let depth = manager.total_depth().await.unwrap_or(0);
                let target = ((depth / DEPTH_PER_WORKER) as usize + cfg.min_workers)
                    .clamp(cfg.min_workers, cfg.max_workers);
                while workers.len() < target {
                    spawn_worker(&mut workers);
                    debug!(workers = workers.len(), depth, "scaled up");
                }
                // Scale-down is passive: surplus workers exit on idle.
            }
        }
    }

    // Drain: workers observe the same token and exit their loops.
    for h in workers {
        let _ = h.await;
    }
    info!("worker pool stopped");
}

/// One worker: dequeue → heartbeat → drive the engine → settle the item.
async fn worker_loop(
    worker_id: String,
    manager: QueueManager,
    engine: Arc<ExecutionEngine>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
) {
    debug!(worker = %worker_id, "worker online");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let item = match manager.dequeue(&worker_id).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL) => continue,
                }
            }
            Err(e) => {
                warn!(worker = %worker_id, error = %e, "dequeue failed");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
        };

        process_item(&worker_id, &manager, &engine, heartbeat_interval, item).await;
    }

    debug!(worker = %worker_id, "worker offline");
}

async fn process_item(
    worker_id: &str,
    manager: &QueueManager,
    engine: &Arc<ExecutionEngine>,
    heartbeat_interval: Duration,
    item: QueueItemRow,
) {
    // Heartbeat: renew the lease at the configured cadence (≤ half the
    // lease TTL by configuration) while the engine runs.
    let hb = {
        let manager = manager.clone();
        let worker_id = worker_id.to_string();
        let item_id = item.item_id;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await; // skip the immediate tick
            loop {
                ticker.tick().await;
                match manager.renew_lease(item_id, &worker_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(worker = %worker_id, "lease lost mid-run; another worker may take over");
                        break;
                    }
                    Err(e) => warn!(error = %e, "lease renewal failed"),
                }
            }
        })
    };

    let outcome = engine.run_claimed(item.execution_id, worker_id).await;
    hb.abort();

    match outcome {
        Ok(RunOutcome::Completed) => {
            if let Err(e) = manager.complete(item.item_id, worker_id).await {
                warn!(error = %e, "queue complete failed; reaper will recover the item");
            }
        }
        Ok(RunOutcome::Retry { reason }) => {
            match manager.fail(&item, worker_id, &reason).await {
                Ok(FailOutcome::Rescheduled(at)) => {
                    debug!(execution = %item.execution_id, available_at = %at, "attempt rescheduled");
                }
                Ok(FailOutcome::DeadLettered) => {
                    warn!(execution = %item.execution_id, "retry budget exhausted; dead-lettered");
                    if let Err(e) = engine
                        .finalize_dead_lettered(item.execution_id, &reason)
                        .await
                    {
                        warn!(error = %e, "dead-letter finalization failed");
                    }
                }
                Ok(FailOutcome::NotHolder) => {
                    debug!(execution = %item.execution_id, "lease changed hands; nothing to settle");
                }
                Err(e) => warn!(error = %e, "queue fail() failed"),
            }
        }
        Err(e) => {
            // Engine-internal error: treat like a transient attempt failure.
            warn!(execution = %item.execution_id, error = %e, "claimed run errored");
            match manager.fail(&item, worker_id, &e.message).await {
                Ok(FailOutcome::DeadLettered) => {
                    let _ = engine
                        .finalize_dead_lettered(item.execution_id, &e.message)
                        .await;
                }
                Ok(_) => {}
                Err(e2) => warn!(error = %e2, "queue fail() failed after engine error"),
            }
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string())
}
