//! Execution step rows.
//!
//! Steps are inserted as a batch when the worker first claims the execution,
//! then advanced one at a time by the step loop. `(execution_id, ordinal)`
//! is unique; re-running after a worker crash upserts nothing — the loop
//! resumes at the first non-terminal ordinal.

use chrono::{DateTime, Utc};
use ovs_schemas::{OvsError, StepStatus};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

#[derive(Debug, Clone)]
pub struct StepRow {
    pub step_id: Uuid,
    pub execution_id: Uuid,
    pub ordinal: i32,
    pub tool_name: String,
    pub inputs: Value,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub attempt: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewStep {
    pub step_id: Uuid,
    pub ordinal: i32,
    pub tool_name: String,
    pub inputs: Value,
}

fn row_to_step(row: sqlx::postgres::PgRow) -> Result<StepRow, OvsError> {
    let status_raw: String = row.try_get("status").map_err(db_err("read step status"))?;
    Ok(StepRow {
        step_id: row.try_get("step_id").map_err(db_err("read step_id"))?,
        execution_id: row
            .try_get("execution_id")
            .map_err(db_err("read execution_id"))?,
        ordinal: row.try_get("ordinal").map_err(db_err("read ordinal"))?,
        tool_name: row.try_get("tool_name").map_err(db_err("read tool_name"))?,
        inputs: row.try_get("inputs").map_err(db_err("read inputs"))?,
        status: status_raw
            .parse()
            .map_err(|_| OvsError::internal(format!("unknown step status '{status_raw}'")))?,
        result: row.try_get("result").map_err(db_err("read result"))?,
        error: row.try_get("error").map_err(db_err("read error"))?,
        attempt: row.try_get("attempt").map_err(db_err("read attempt"))?,
        started_at: row
            .try_get("started_at")
            .map_err(db_err("read started_at"))?,
        ended_at: row.try_get("ended_at").map_err(db_err("read ended_at"))?,
    })
}

/// Insert the plan's steps if they are not present yet. Idempotent per
/// ordinal so a re-claimed execution does not duplicate rows.
pub async fn insert_steps_if_absent(
    pool: &PgPool,
    execution_id: Uuid,
    steps: &[NewStep],
) -> Result<(), OvsError> {
    let mut tx = pool.begin().await.map_err(db_err("begin insert_steps"))?;

    for s in steps {
        sqlx::query(
            r#"
            insert into execution_steps (step_id, execution_id, ordinal, tool_name, inputs)
            values ($1, $2, $3, $4, $5)
            on conflict (execution_id, ordinal) do nothing
            "#,
        )
        .bind(s.step_id)
        .bind(execution_id)
        .bind(s.ordinal)
        .bind(&s.tool_name)
        .bind(&s.inputs)
        .execute(&mut *tx)
        .await
        .map_err(db_err("insert_steps_if_absent failed"))?;
    }

    tx.commit().await.map_err(db_err("commit insert_steps"))?;
    Ok(())
}

/// All steps of an execution in plan order.
pub async fn fetch_steps(pool: &PgPool, execution_id: Uuid) -> Result<Vec<StepRow>, OvsError> {
    let rows = sqlx::query(
        r#"
        select step_id, execution_id, ordinal, tool_name, inputs, status,
               result, error, attempt, started_at, ended_at
        from execution_steps
        where execution_id = $1
        order by ordinal asc
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .map_err(db_err("fetch_steps failed"))?;

    rows.into_iter().map(row_to_step).collect()
}

/// Move a step into RUNNING and bump its attempt. Only legal from a
/// non-terminal state — the returning clause is empty otherwise.
pub async fn mark_step_running(pool: &PgPool, step_id: Uuid) -> Result<bool, OvsError> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update execution_steps
           set status     = 'RUNNING',
               attempt    = attempt + 1,
               started_at = coalesce(started_at, now())
         where step_id = $1
           and status in ('PENDING','RUNNING')
        returning step_id
        "#,
    )
    .bind(step_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err("mark_step_running failed"))?;

    Ok(row.is_some())
}

/// Record a transient failure without closing the step. The step stays
/// RUNNING (non-terminal) so a later worker attempt re-runs it; only the
/// masked error is captured.
pub async fn record_step_error(
    pool: &PgPool,
    step_id: Uuid,
    error: &Value,
) -> Result<(), OvsError> {
    sqlx::query(
        r#"
        update execution_steps
           set error = $2
         where step_id = $1
           and status = 'RUNNING'
        "#,
    )
    .bind(step_id)
    .bind(error)
    .execute(pool)
    .await
    .map_err(db_err("record_step_error failed"))?;
    Ok(())
}

/// Close every non-terminal step of an execution as FAILED. Used when the
/// queue gives up on the execution (dead-letter) so no step dangles open.
pub async fn fail_open_steps(pool: &PgPool, execution_id: Uuid) -> Result<u64, OvsError> {
    let res = sqlx::query(
        r#"
        update execution_steps
           set status   = 'FAILED',
               ended_at = now()
         where execution_id = $1
           and status in ('PENDING','RUNNING')
        "#,
    )
    .bind(execution_id)
    .execute(pool)
    .await
    .map_err(db_err("fail_open_steps failed"))?;
    Ok(res.rows_affected())
}

/// Terminal step write: status, masked result or error, end timestamp.
pub async fn finish_step(
    pool: &PgPool,
    step_id: Uuid,
    status: StepStatus,
    result: Option<&Value>,
    error: Option<&Value>,
) -> Result<(), OvsError> {
    debug_assert!(status.is_terminal(), "finish_step requires a terminal status");

    sqlx::query(
        r#"
        update execution_steps
           set status   = $2,
               result   = $3,
               error    = $4,
               ended_at = now()
         where step_id = $1
        "#,
    )
    .bind(step_id)
    .bind(status.as_str())
    .bind(result)
    .bind(error)
    .execute(pool)
    .await
    .map_err(db_err("finish_step failed"))?;

    Ok(())
}
