//! Append-only execution event stream.
//!
//! `seq` is dense per execution and assigned inside the insert statement.
//! The queue lease guarantees a single step-loop writer per execution, but
//! the cancellation path may append concurrently — a lost race trips the
//! `(execution_id, seq)` unique constraint and is retried here. Payloads
//! must be masked by the caller; nothing here re-checks.

use chrono::{DateTime, Utc};
use ovs_schemas::{ErrorKind, EventKind, OvsError};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

#[derive(Debug, Clone)]
pub struct EventRow {
    pub event_id: Uuid,
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub payload: Value,
}

/// Append one event; returns the assigned sequence number.
pub async fn append_event(
    pool: &PgPool,
    execution_id: Uuid,
    tenant_id: &str,
    kind: EventKind,
    payload: &Value,
) -> Result<i64, OvsError> {
    let mut last_err = None;
    for _ in 0..3 {
        let res: Result<(i64,), OvsError> = sqlx::query_as(
            r#"
            insert into execution_events (event_id, execution_id, tenant_id, seq, kind, payload)
            select $1, $2, $3,
                   coalesce(max(seq) + 1, 0),
                   $4, $5
            from execution_events
            where execution_id = $2
            returning seq
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(execution_id)
        .bind(tenant_id)
        .bind(kind.as_str())
        .bind(payload)
        .fetch_one(pool)
        .await
        .map_err(db_err("append_event failed"));

        match res {
            Ok((seq,)) => return Ok(seq),
            // Concurrent appender won this seq; recompute and try again.
            Err(e) if e.kind == ErrorKind::Conflict => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| OvsError::internal("append_event retry exhausted")))
}

/// Cursor page of events with `seq > since`, oldest first.
pub async fn list_events(
    pool: &PgPool,
    tenant_id: &str,
    execution_id: Uuid,
    since: i64,
    limit: i64,
) -> Result<Vec<EventRow>, OvsError> {
    let rows = sqlx::query(
        r#"
        select event_id, execution_id, tenant_id, seq, ts, kind, payload
        from execution_events
        where tenant_id = $1
          and execution_id = $2
          and seq > $3
        order by seq asc
        limit $4
        "#,
    )
    .bind(tenant_id)
    .bind(execution_id)
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(db_err("list_events failed"))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(EventRow {
            event_id: row.try_get("event_id").map_err(db_err("read event_id"))?,
            execution_id: row
                .try_get("execution_id")
                .map_err(db_err("read execution_id"))?,
            tenant_id: row.try_get("tenant_id").map_err(db_err("read tenant_id"))?,
            seq: row.try_get("seq").map_err(db_err("read seq"))?,
            ts: row.try_get("ts").map_err(db_err("read ts"))?,
            kind: row.try_get("kind").map_err(db_err("read kind"))?,
            payload: row.try_get("payload").map_err(db_err("read payload"))?,
        });
    }
    Ok(out)
}
