//! Execution row repo.
//!
//! Status writes use compare-and-set on the current status so only the
//! worker holding the queue lease (or the cancellation path) can move a row;
//! a CAS miss surfaces as CONFLICT and the engine treats it as an FSM race.

use chrono::{DateTime, Utc};
use ovs_schemas::{
    ActionClass, ErrorKind, ExecutionMode, ExecutionStatus, OvsError, SlaClass,
};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionRow {
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub actor_id: String,
    pub idempotency_key: String,
    pub sla_class: SlaClass,
    pub mode: ExecutionMode,
    pub action_class: ActionClass,
    pub priority: i32,
    pub status: ExecutionStatus,
    pub plan: Value,
    pub target: Value,
    pub results: Option<Value>,
    pub attempt_count: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewExecution {
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub actor_id: String,
    pub idempotency_key: String,
    pub sla_class: SlaClass,
    pub mode: ExecutionMode,
    pub action_class: ActionClass,
    pub priority: i32,
    pub status: ExecutionStatus,
    pub plan: Value,
    pub target: Value,
}

const COLUMNS: &str = "execution_id, tenant_id, actor_id, idempotency_key, sla_class, mode, \
                       action_class, priority, status, plan, target, results, attempt_count, \
                       started_at, ended_at, created_at";

fn row_to_execution(row: sqlx::postgres::PgRow) -> Result<ExecutionRow, OvsError> {
    let parse = |field: &str, raw: String| {
        OvsError::internal(format!("executions.{field} holds unknown value '{raw}'"))
    };

    let sla_raw: String = row.try_get("sla_class").map_err(db_err("read sla_class"))?;
    let mode_raw: String = row.try_get("mode").map_err(db_err("read mode"))?;
    let action_raw: String = row
        .try_get("action_class")
        .map_err(db_err("read action_class"))?;
    let status_raw: String = row.try_get("status").map_err(db_err("read status"))?;

    Ok(ExecutionRow {
        execution_id: row
            .try_get("execution_id")
            .map_err(db_err("read execution_id"))?,
        tenant_id: row.try_get("tenant_id").map_err(db_err("read tenant_id"))?,
        actor_id: row.try_get("actor_id").map_err(db_err("read actor_id"))?,
        idempotency_key: row
            .try_get("idempotency_key")
            .map_err(db_err("read idempotency_key"))?,
        sla_class: sla_raw
            .parse()
            .map_err(|_| parse("sla_class", sla_raw.clone()))?,
        mode: mode_raw.parse().map_err(|_| parse("mode", mode_raw.clone()))?,
        action_class: action_raw
            .parse()
            .map_err(|_| parse("action_class", action_raw.clone()))?,
        priority: row.try_get("priority").map_err(db_err("read priority"))?,
        status: status_raw
            .parse()
            .map_err(|_| parse("status", status_raw.clone()))?,
        plan: row.try_get("plan").map_err(db_err("read plan"))?,
        target: row.try_get("target").map_err(db_err("read target"))?,
        results: row.try_get("results").map_err(db_err("read results"))?,
        attempt_count: row
            .try_get("attempt_count")
            .map_err(db_err("read attempt_count"))?,
        started_at: row
            .try_get("started_at")
            .map_err(db_err("read started_at"))?,
        ended_at: row.try_get("ended_at").map_err(db_err("read ended_at"))?,
        created_at: row
            .try_get("created_at")
            .map_err(db_err("read created_at"))?,
    })
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Insert a new execution row.
///
/// The partial unique index on live `(tenant_id, idempotency_key)` turns a
/// concurrent duplicate submit into CONFLICT; the engine retries the dedup
/// lookup when it sees that.
pub async fn insert_execution(pool: &PgPool, new: &NewExecution) -> Result<(), OvsError> {
    sqlx::query(
        r#"
        insert into executions (
          execution_id, tenant_id, actor_id, idempotency_key,
          sla_class, mode, action_class, priority, status, plan, target
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(new.execution_id)
    .bind(&new.tenant_id)
    .bind(&new.actor_id)
    .bind(&new.idempotency_key)
    .bind(new.sla_class.as_str())
    .bind(new.mode.as_str())
    .bind(new.action_class.as_str())
    .bind(new.priority)
    .bind(new.status.as_str())
    .bind(&new.plan)
    .bind(&new.target)
    .execute(pool)
    .await
    .map_err(db_err("insert_execution failed"))?;

    Ok(())
}

/// Compare-and-set status transition. Returns `true` if the row moved.
///
/// `started_at` is stamped on the first transition into RUNNING; `ended_at`
/// is stamped when `to` is terminal (the check constraint requires it).
pub async fn cas_status(
    pool: &PgPool,
    execution_id: Uuid,
    from: ExecutionStatus,
    to: ExecutionStatus,
) -> Result<bool, OvsError> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update executions
           set status     = $3,
               started_at = case when $3 = 'RUNNING' then coalesce(started_at, now())
                                 else started_at end,
               ended_at   = case when $4 then coalesce(ended_at, now()) else ended_at end
         where execution_id = $1
           and status = $2
        returning execution_id
        "#,
    )
    .bind(execution_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(to.is_terminal())
    .fetch_optional(pool)
    .await
    .map_err(db_err("cas_status failed"))?;

    Ok(row.is_some())
}

/// Persist the aggregated per-step results payload.
pub async fn set_results(
    pool: &PgPool,
    execution_id: Uuid,
    results: &Value,
) -> Result<(), OvsError> {
    sqlx::query("update executions set results = $2 where execution_id = $1")
        .bind(execution_id)
        .bind(results)
        .execute(pool)
        .await
        .map_err(db_err("set_results failed"))?;
    Ok(())
}

/// Bump the worker attempt counter. Returns the new count.
pub async fn increment_attempt(pool: &PgPool, execution_id: Uuid) -> Result<i32, OvsError> {
    let (n,): (i32,) = sqlx::query_as(
        r#"
        update executions
           set attempt_count = attempt_count + 1
         where execution_id = $1
        returning attempt_count
        "#,
    )
    .bind(execution_id)
    .fetch_one(pool)
    .await
    .map_err(db_err("increment_attempt failed"))?;
    Ok(n)
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Fetch one execution, tenant-scoped.
pub async fn fetch_execution(
    pool: &PgPool,
    tenant_id: &str,
    execution_id: Uuid,
) -> Result<Option<ExecutionRow>, OvsError> {
    let row = sqlx::query(&format!(
        "select {COLUMNS} from executions where tenant_id = $1 and execution_id = $2"
    ))
    .bind(tenant_id)
    .bind(execution_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err("fetch_execution failed"))?;

    row.map(row_to_execution).transpose()
}

/// Fetch an execution without tenant scoping — worker-internal path only;
/// the queue item already carries the tenant.
pub async fn fetch_execution_any_tenant(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Option<ExecutionRow>, OvsError> {
    let row = sqlx::query(&format!(
        "select {COLUMNS} from executions where execution_id = $1"
    ))
    .bind(execution_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err("fetch_execution_any_tenant failed"))?;

    row.map(row_to_execution).transpose()
}

/// Newest execution matching the idempotency key inside the dedup window.
pub async fn find_by_idempotency_key(
    pool: &PgPool,
    tenant_id: &str,
    idempotency_key: &str,
    window_start: DateTime<Utc>,
) -> Result<Option<ExecutionRow>, OvsError> {
    let row = sqlx::query(&format!(
        r#"
        select {COLUMNS}
        from executions
        where tenant_id = $1
          and idempotency_key = $2
          and created_at >= $3
        order by created_at desc
        limit 1
        "#
    ))
    .bind(tenant_id)
    .bind(idempotency_key)
    .bind(window_start)
    .fetch_optional(pool)
    .await
    .map_err(db_err("find_by_idempotency_key failed"))?;

    row.map(row_to_execution).transpose()
}

/// Guard against double-mapping: surfaces CONFLICT if the status read back
/// is not the expected one (used by tests and the cancellation path).
pub async fn expect_status(
    pool: &PgPool,
    execution_id: Uuid,
    expected: ExecutionStatus,
) -> Result<(), OvsError> {
    let (status,): (String,) =
        sqlx::query_as("select status from executions where execution_id = $1")
            .bind(execution_id)
            .fetch_one(pool)
            .await
            .map_err(db_err("expect_status failed"))?;

    if status != expected.as_str() {
        return Err(OvsError::new(
            ErrorKind::Conflict,
            format!("execution {execution_id} is {status}, expected {expected}"),
        ));
    }
    Ok(())
}
