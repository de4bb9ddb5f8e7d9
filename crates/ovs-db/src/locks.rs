//! Cross-process mutex leases.
//!
//! At most one unexpired row per `lock_key`. Acquisition is a single upsert
//! that only steals the row when the previous lease has expired; holders
//! extend via heartbeat at ≤ half the TTL.

use chrono::{DateTime, Duration, Utc};
use ovs_schemas::OvsError;
use sqlx::{PgPool, Row};

use crate::db_err;

#[derive(Debug, Clone)]
pub struct LockRow {
    pub lock_key: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One acquisition attempt. Returns `true` on success (fresh or re-entrant
/// for the same holder), `false` while another holder's lease is live.
pub async fn try_acquire(
    pool: &PgPool,
    lock_key: &str,
    holder_id: &str,
    ttl: Duration,
) -> Result<bool, OvsError> {
    let expires_at = Utc::now() + ttl;

    let row: Option<(String,)> = sqlx::query_as(
        r#"
        insert into execution_locks (lock_key, holder_id, expires_at)
        values ($1, $2, $3)
        on conflict (lock_key) do update
           set holder_id    = excluded.holder_id,
               acquired_at  = now(),
               heartbeat_at = now(),
               expires_at   = excluded.expires_at
         where execution_locks.expires_at < now()
            or execution_locks.holder_id = excluded.holder_id
        returning lock_key
        "#,
    )
    .bind(lock_key)
    .bind(holder_id)
    .bind(expires_at)
    .fetch_optional(pool)
    .await
    .map_err(db_err("try_acquire failed"))?;

    Ok(row.is_some())
}

/// Holder heartbeat: refresh `heartbeat_at` and push out the expiry.
/// Returns `false` if the lease was lost (expired and stolen, or released).
pub async fn heartbeat(
    pool: &PgPool,
    lock_key: &str,
    holder_id: &str,
    ttl: Duration,
) -> Result<bool, OvsError> {
    let expires_at = Utc::now() + ttl;

    let row: Option<(String,)> = sqlx::query_as(
        r#"
        update execution_locks
           set heartbeat_at = now(),
               expires_at   = $3
         where lock_key = $1
           and holder_id = $2
           and expires_at > now()
        returning lock_key
        "#,
    )
    .bind(lock_key)
    .bind(holder_id)
    .bind(expires_at)
    .fetch_optional(pool)
    .await
    .map_err(db_err("heartbeat failed"))?;

    Ok(row.is_some())
}

/// Release a held lock. Holder-checked; releasing a lost lock is a no-op.
pub async fn release(pool: &PgPool, lock_key: &str, holder_id: &str) -> Result<bool, OvsError> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        delete from execution_locks
         where lock_key = $1 and holder_id = $2
        returning lock_key
        "#,
    )
    .bind(lock_key)
    .bind(holder_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err("release failed"))?;

    Ok(row.is_some())
}

/// Background reaper: drop rows whose expiry is in the past.
pub async fn reap_expired(pool: &PgPool) -> Result<u64, OvsError> {
    let res = sqlx::query("delete from execution_locks where expires_at < now()")
        .execute(pool)
        .await
        .map_err(db_err("reap_expired failed"))?;
    Ok(res.rows_affected())
}

/// Count of live leases (gauge input).
pub async fn live_lease_count(pool: &PgPool) -> Result<i64, OvsError> {
    let (n,): (i64,) =
        sqlx::query_as("select count(*)::bigint from execution_locks where expires_at > now()")
            .fetch_one(pool)
            .await
            .map_err(db_err("live_lease_count failed"))?;
    Ok(n)
}

/// Fetch one lock row (diagnostics / tests).
pub async fn fetch_lock(pool: &PgPool, lock_key: &str) -> Result<Option<LockRow>, OvsError> {
    let row = sqlx::query(
        r#"
        select lock_key, holder_id, acquired_at, heartbeat_at, expires_at
        from execution_locks
        where lock_key = $1
        "#,
    )
    .bind(lock_key)
    .fetch_optional(pool)
    .await
    .map_err(db_err("fetch_lock failed"))?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(LockRow {
        lock_key: row.try_get("lock_key").map_err(db_err("read lock_key"))?,
        holder_id: row.try_get("holder_id").map_err(db_err("read holder_id"))?,
        acquired_at: row
            .try_get("acquired_at")
            .map_err(db_err("read acquired_at"))?,
        heartbeat_at: row
            .try_get("heartbeat_at")
            .map_err(db_err("read heartbeat_at"))?,
        expires_at: row
            .try_get("expires_at")
            .map_err(db_err("read expires_at"))?,
    }))
}
