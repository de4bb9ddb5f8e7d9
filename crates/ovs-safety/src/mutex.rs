//! Mutex guard: per-asset lease locks.
//!
//! Acquisition is insert-if-absent with exponential backoff and jitter up to
//! a caller-supplied deadline. Multiple keys are always taken in
//! lexicographic order — two executions that need overlapping key sets can
//! never deadlock. Holders heartbeat at half the TTL; a background reaper
//! clears rows whose expiry has passed.

use std::time::Duration as StdDuration;

use chrono::Duration;
use ovs_schemas::OvsError;
use rand::Rng;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BACKOFF_BASE_MS: u64 = 50;
const BACKOFF_CAP_MS: u64 = 2_000;

/// Locks held by one step. Release explicitly via [`HeldLocks::release`];
/// the lease TTL plus the reaper bound the damage if a worker dies first.
pub struct HeldLocks {
    pool: PgPool,
    holder_id: String,
    keys: Vec<String>,
    heartbeat: JoinHandle<()>,
}

impl HeldLocks {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Stop heartbeating and drop all rows. Failures are logged, not
    /// surfaced — the reaper cleans up whatever remains.
    pub async fn release(self) {
        self.heartbeat.abort();
        for key in &self.keys {
            if let Err(e) = ovs_db::locks::release(&self.pool, key, &self.holder_id).await {
                warn!(lock_key = %key, error = %e, "lock release failed; reaper will collect");
            }
        }
    }
}

/// Acquire every key in `keys` for `holder_id`, retrying with exponential
/// backoff until `deadline` elapses.
///
/// Keys are deduplicated and sorted before acquisition. On failure, locks
/// already taken in this call are released before the error returns.
///
/// # Errors
/// `CONFLICT` when the deadline passes while some key is held elsewhere.
pub async fn acquire_locks(
    pool: &PgPool,
    mut keys: Vec<String>,
    holder_id: &str,
    ttl: Duration,
    deadline: StdDuration,
) -> Result<HeldLocks, OvsError> {
    keys.sort();
    keys.dedup();

    let started = tokio::time::Instant::now();
    let mut taken: Vec<String> = Vec::with_capacity(keys.len());

    for key in &keys {
        let mut attempt: u32 = 0;
        loop {
            if ovs_db::locks::try_acquire(pool, key, holder_id, ttl).await? {
                debug!(lock_key = %key, holder = holder_id, "lock acquired");
                taken.push(key.clone());
                break;
            }

            if started.elapsed() >= deadline {
                // Give back what we already hold — partial hold would block
                // other executions for the whole lease TTL.
                for k in &taken {
                    let _ = ovs_db::locks::release(pool, k, holder_id).await;
                }
                return Err(OvsError::conflict(format!(
                    "could not acquire lock '{key}' within {deadline:?}"
                )));
            }

            let backoff = backoff_with_jitter(attempt);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(backoff).await;
        }
    }

    let heartbeat = spawn_heartbeat(pool.clone(), keys.clone(), holder_id.to_string(), ttl);

    Ok(HeldLocks {
        pool: pool.clone(),
        holder_id: holder_id.to_string(),
        keys,
        heartbeat,
    })
}

/// `min(2^attempt × base, cap)` plus up to 50% jitter.
fn backoff_with_jitter(attempt: u32) -> StdDuration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=capped / 2);
    StdDuration::from_millis(capped + jitter)
}

/// Renew every held key at half the TTL until aborted.
fn spawn_heartbeat(
    pool: PgPool,
    keys: Vec<String>,
    holder_id: String,
    ttl: Duration,
) -> JoinHandle<()> {
    let period = StdDuration::from_millis((ttl.num_milliseconds().max(2) / 2) as u64);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            for key in &keys {
                match ovs_db::locks::heartbeat(&pool, key, &holder_id, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(lock_key = %key, "lock lease lost during heartbeat");
                    }
                    Err(e) => {
                        warn!(lock_key = %key, error = %e, "lock heartbeat failed");
                    }
                }
            }
        }
    })
}

/// Background reaper loop: delete expired lock rows every `interval` until
/// the shutdown token fires.
pub fn spawn_lock_reaper(
    pool: PgPool,
    interval: StdDuration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match ovs_db::locks::reap_expired(&pool).await {
                        Ok(0) => {}
                        Ok(n) => debug!(reaped = n, "expired mutex leases removed"),
                        Err(e) => warn!(error = %e, "lock reaper sweep failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_by_cap_plus_jitter() {
        for attempt in 0..20 {
            let d = backoff_with_jitter(attempt);
            assert!(d.as_millis() as u64 <= BACKOFF_CAP_MS + BACKOFF_CAP_MS / 2);
        }
    }

    #[test]
    fn backoff_grows_before_the_cap() {
        // Deterministic lower bound: jitter only adds.
        assert!(backoff_with_jitter(3).as_millis() >= 8 * BACKOFF_BASE_MS as u128 / 2);
    }
}
