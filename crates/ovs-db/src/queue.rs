//! Persistent priority queue with visibility leases, plus the dead-letter
//! table.
//!
//! Dequeue atomically picks the lowest-priority, not-leased, available row
//! with `FOR UPDATE SKIP LOCKED` and marks it leased — concurrent workers
//! never claim the same item. A row with an unexpired lease is invisible to
//! other dequeuers; expired leases are visible again immediately (the reaper
//! only tidies the columns).

use chrono::{DateTime, Duration, Utc};
use ovs_schemas::OvsError;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueItemRow {
    pub item_id: Uuid,
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub priority: i32,
    pub available_at: DateTime<Utc>,
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt: i32,
    pub max_attempts: i32,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DlqRow {
    pub item_id: Uuid,
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub priority: i32,
    pub attempt: i32,
    pub max_attempts: i32,
    pub enqueued_at: DateTime<Utc>,
    pub failure_reason: String,
    pub dead_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

const QUEUE_COLUMNS: &str = "item_id, execution_id, tenant_id, priority, available_at, \
                             lease_holder, lease_expires_at, attempt, max_attempts, enqueued_at";

fn row_to_item(row: sqlx::postgres::PgRow) -> Result<QueueItemRow, OvsError> {
    Ok(QueueItemRow {
        item_id: row.try_get("item_id").map_err(db_err("read item_id"))?,
        execution_id: row
            .try_get("execution_id")
            .map_err(db_err("read execution_id"))?,
        tenant_id: row.try_get("tenant_id").map_err(db_err("read tenant_id"))?,
        priority: row.try_get("priority").map_err(db_err("read priority"))?,
        available_at: row
            .try_get("available_at")
            .map_err(db_err("read available_at"))?,
        lease_holder: row
            .try_get("lease_holder")
            .map_err(db_err("read lease_holder"))?,
        lease_expires_at: row
            .try_get("lease_expires_at")
            .map_err(db_err("read lease_expires_at"))?,
        attempt: row.try_get("attempt").map_err(db_err("read attempt"))?,
        max_attempts: row
            .try_get("max_attempts")
            .map_err(db_err("read max_attempts"))?,
        enqueued_at: row
            .try_get("enqueued_at")
            .map_err(db_err("read enqueued_at"))?,
    })
}

fn row_to_dlq(row: sqlx::postgres::PgRow) -> Result<DlqRow, OvsError> {
    Ok(DlqRow {
        item_id: row.try_get("item_id").map_err(db_err("read item_id"))?,
        execution_id: row
            .try_get("execution_id")
            .map_err(db_err("read execution_id"))?,
        tenant_id: row.try_get("tenant_id").map_err(db_err("read tenant_id"))?,
        priority: row.try_get("priority").map_err(db_err("read priority"))?,
        attempt: row.try_get("attempt").map_err(db_err("read attempt"))?,
        max_attempts: row
            .try_get("max_attempts")
            .map_err(db_err("read max_attempts"))?,
        enqueued_at: row
            .try_get("enqueued_at")
            .map_err(db_err("read enqueued_at"))?,
        failure_reason: row
            .try_get("failure_reason")
            .map_err(db_err("read failure_reason"))?,
        dead_at: row.try_get("dead_at").map_err(db_err("read dead_at"))?,
        archived_at: row
            .try_get("archived_at")
            .map_err(db_err("read archived_at"))?,
    })
}

// ---------------------------------------------------------------------------
// Enqueue / dequeue
// ---------------------------------------------------------------------------

/// Idempotent enqueue: one live queue row per execution. Returns `true` if a
/// new row was created, `false` when the execution was already queued.
pub async fn enqueue(
    pool: &PgPool,
    execution_id: Uuid,
    tenant_id: &str,
    priority: i32,
    max_attempts: i32,
    available_at: Option<DateTime<Utc>>,
) -> Result<bool, OvsError> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        insert into execution_queue (
          item_id, execution_id, tenant_id, priority, max_attempts, available_at
        ) values ($1, $2, $3, $4, $5, coalesce($6, now()))
        on conflict (execution_id) do nothing
        returning item_id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(execution_id)
    .bind(tenant_id)
    .bind(priority)
    .bind(max_attempts)
    .bind(available_at)
    .fetch_optional(pool)
    .await
    .map_err(db_err("enqueue failed"))?;

    Ok(row.is_some())
}

/// Atomically claim the best visible item for `worker_id`, or none.
///
/// Visibility: available, and either never leased or the lease has expired.
/// Order: priority ascending, then enqueue time. The claim bumps `attempt`
/// — one claim is one worker attempt.
pub async fn dequeue_one(
    pool: &PgPool,
    worker_id: &str,
    lease_duration: Duration,
) -> Result<Option<QueueItemRow>, OvsError> {
    let lease_expires_at = Utc::now() + lease_duration;

    let row = sqlx::query(&format!(
        r#"
        with claimable as (
            select item_id
            from execution_queue
            where available_at <= now()
              and (lease_holder is null or lease_expires_at < now())
            order by priority asc, enqueued_at asc
            limit 1
            for update skip locked
        )
        update execution_queue q
           set lease_holder     = $1,
               lease_expires_at = $2,
               attempt          = attempt + 1
         where q.item_id in (select item_id from claimable)
        returning {QUEUE_COLUMNS}
        "#
    ))
    .bind(worker_id)
    .bind(lease_expires_at)
    .fetch_optional(pool)
    .await
    .map_err(db_err("dequeue_one failed"))?;

    row.map(row_to_item).transpose()
}

/// Extend the lease. Succeeds only while `worker_id` still holds it.
pub async fn renew_lease(
    pool: &PgPool,
    item_id: Uuid,
    worker_id: &str,
    new_duration: Duration,
) -> Result<bool, OvsError> {
    let new_expiry = Utc::now() + new_duration;

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update execution_queue
           set lease_expires_at = $3
         where item_id = $1
           and lease_holder = $2
           and lease_expires_at > now()
        returning item_id
        "#,
    )
    .bind(item_id)
    .bind(worker_id)
    .bind(new_expiry)
    .fetch_optional(pool)
    .await
    .map_err(db_err("renew_lease failed"))?;

    Ok(row.is_some())
}

/// Remove a completed item. Holder-checked.
pub async fn complete(pool: &PgPool, item_id: Uuid, worker_id: &str) -> Result<bool, OvsError> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        delete from execution_queue
         where item_id = $1 and lease_holder = $2
        returning item_id
        "#,
    )
    .bind(item_id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err("complete failed"))?;

    Ok(row.is_some())
}

/// Outcome of a `fail` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled; visible again at the returned time.
    Rescheduled(DateTime<Utc>),
    /// Retry budget exhausted; moved to the DLQ.
    DeadLettered,
    /// Holder mismatch — another worker owns the item now.
    NotHolder,
}

/// Record a failed attempt. Under budget the item is released back with the
/// caller-computed backoff; over budget it moves to the DLQ in the same
/// transaction.
pub async fn fail(
    pool: &PgPool,
    item_id: Uuid,
    worker_id: &str,
    reason: &str,
    backoff: Duration,
) -> Result<FailOutcome, OvsError> {
    let mut tx = pool.begin().await.map_err(db_err("begin fail"))?;

    let row = sqlx::query(&format!(
        "select {QUEUE_COLUMNS} from execution_queue where item_id = $1 for update"
    ))
    .bind(item_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(db_err("fail: fetch item"))?;

    let Some(row) = row else {
        return Ok(FailOutcome::NotHolder);
    };
    let item = row_to_item(row)?;
    if item.lease_holder.as_deref() != Some(worker_id) {
        return Ok(FailOutcome::NotHolder);
    }

    if item.attempt < item.max_attempts {
        let available_at = Utc::now() + backoff;
        sqlx::query(
            r#"
            update execution_queue
               set lease_holder     = null,
                   lease_expires_at = null,
                   available_at     = $2
             where item_id = $1
            "#,
        )
        .bind(item_id)
        .bind(available_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("fail: reschedule"))?;

        tx.commit().await.map_err(db_err("commit fail"))?;
        return Ok(FailOutcome::Rescheduled(available_at));
    }

    sqlx::query(
        r#"
        insert into execution_dlq (
          item_id, execution_id, tenant_id, priority, attempt, max_attempts,
          enqueued_at, failure_reason
        ) values ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(item.item_id)
    .bind(item.execution_id)
    .bind(&item.tenant_id)
    .bind(item.priority)
    .bind(item.attempt)
    .bind(item.max_attempts)
    .bind(item.enqueued_at)
    .bind(reason)
    .execute(&mut *tx)
    .await
    .map_err(db_err("fail: insert dlq"))?;

    sqlx::query("delete from execution_queue where item_id = $1")
        .bind(item_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err("fail: delete queue row"))?;

    tx.commit().await.map_err(db_err("commit fail"))?;
    Ok(FailOutcome::DeadLettered)
}

/// Reset lease columns on expired leases so dequeue order stays clean.
/// Expired leases are already claimable; this is bookkeeping, not recovery.
pub async fn reap_stale_leases(pool: &PgPool) -> Result<u64, OvsError> {
    let res = sqlx::query(
        r#"
        update execution_queue
           set lease_holder     = null,
               lease_expires_at = null
         where lease_holder is not null
           and lease_expires_at < now()
        "#,
    )
    .execute(pool)
    .await
    .map_err(db_err("reap_stale_leases failed"))?;

    Ok(res.rows_affected())
}

/// Depth of the visible queue per SLA class (joins executions for the label).
pub async fn depth_by_sla(pool: &PgPool) -> Result<Vec<(String, i64)>, OvsError> {
    let rows = sqlx::query(
        r#"
        select e.sla_class as sla, count(*)::bigint as depth
        from execution_queue q
        join executions e on e.execution_id = q.execution_id
        group by e.sla_class
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(db_err("depth_by_sla failed"))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push((
            row.try_get("sla").map_err(db_err("read sla"))?,
            row.try_get("depth").map_err(db_err("read depth"))?,
        ));
    }
    Ok(out)
}

/// Total visible queue depth; the backpressure check reads this.
pub async fn total_depth(pool: &PgPool) -> Result<i64, OvsError> {
    let (n,): (i64,) = sqlx::query_as("select count(*)::bigint from execution_queue")
        .fetch_one(pool)
        .await
        .map_err(db_err("total_depth failed"))?;
    Ok(n)
}

// ---------------------------------------------------------------------------
// DLQ
// ---------------------------------------------------------------------------

/// Page of unarchived dead-letter items, newest death first.
pub async fn dlq_list(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<DlqRow>, OvsError> {
    let rows = sqlx::query(
        r#"
        select item_id, execution_id, tenant_id, priority, attempt, max_attempts,
               enqueued_at, failure_reason, dead_at, archived_at
        from execution_dlq
        where archived_at is null
        order by dead_at desc
        limit $1 offset $2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(db_err("dlq_list failed"))?;

    rows.into_iter().map(row_to_dlq).collect()
}

/// Move a dead-letter item back onto the queue. `reset_attempt` restarts the
/// retry budget; otherwise the prior count is preserved.
pub async fn dlq_requeue(
    pool: &PgPool,
    item_id: Uuid,
    reset_attempt: bool,
) -> Result<bool, OvsError> {
    let mut tx = pool.begin().await.map_err(db_err("begin dlq_requeue"))?;

    let row = sqlx::query(
        r#"
        select item_id, execution_id, tenant_id, priority, attempt, max_attempts,
               enqueued_at, failure_reason, dead_at, archived_at
        from execution_dlq
        where item_id = $1 and archived_at is null
        for update
        "#,
    )
    .bind(item_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(db_err("dlq_requeue: fetch"))?;

    let Some(row) = row else { return Ok(false) };
    let dead = row_to_dlq(row)?;

    let attempt = if reset_attempt { 0 } else { dead.attempt };
    sqlx::query(
        r#"
        insert into execution_queue (
          item_id, execution_id, tenant_id, priority, attempt, max_attempts
        ) values ($1, $2, $3, $4, $5, $6)
        on conflict (execution_id) do nothing
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(dead.execution_id)
    .bind(&dead.tenant_id)
    .bind(dead.priority)
    .bind(attempt)
    .bind(dead.max_attempts)
    .execute(&mut *tx)
    .await
    .map_err(db_err("dlq_requeue: insert queue row"))?;

    sqlx::query("delete from execution_dlq where item_id = $1")
        .bind(item_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err("dlq_requeue: delete"))?;

    tx.commit().await.map_err(db_err("commit dlq_requeue"))?;
    Ok(true)
}

/// Stamp `archived_at` on dead items older than the cutoff.
pub async fn dlq_archive_older_than(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, OvsError> {
    let res = sqlx::query(
        r#"
        update execution_dlq
           set archived_at = now()
         where archived_at is null
           and dead_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .map_err(db_err("dlq_archive_older_than failed"))?;

    Ok(res.rows_affected())
}

/// Aggregate failure reasons over unarchived items.
pub async fn dlq_reason_stats(pool: &PgPool) -> Result<Vec<(String, i64)>, OvsError> {
    let rows = sqlx::query(
        r#"
        select failure_reason, count(*)::bigint as n
        from execution_dlq
        where archived_at is null
        group by failure_reason
        order by n desc
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(db_err("dlq_reason_stats failed"))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push((
            row.try_get("failure_reason")
                .map_err(db_err("read failure_reason"))?,
            row.try_get("n").map_err(db_err("read n"))?,
        ));
    }
    Ok(out)
}
