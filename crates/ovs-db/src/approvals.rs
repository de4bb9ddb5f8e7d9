//! Approval rows gating APPROVAL_REQUIRED executions.

use chrono::{DateTime, Utc};
use ovs_schemas::{ApprovalState, OvsError};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

#[derive(Debug, Clone)]
pub struct ApprovalRow {
    pub approval_id: Uuid,
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub requested_by: String,
    pub required_permission: String,
    pub state: ApprovalState,
    pub reason: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub runbook_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewApproval {
    pub approval_id: Uuid,
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub requested_by: String,
    pub required_permission: String,
    pub runbook_url: Option<String>,
}

fn row_to_approval(row: sqlx::postgres::PgRow) -> Result<ApprovalRow, OvsError> {
    let state_raw: String = row.try_get("state").map_err(db_err("read approval state"))?;
    Ok(ApprovalRow {
        approval_id: row
            .try_get("approval_id")
            .map_err(db_err("read approval_id"))?,
        execution_id: row
            .try_get("execution_id")
            .map_err(db_err("read execution_id"))?,
        tenant_id: row.try_get("tenant_id").map_err(db_err("read tenant_id"))?,
        requested_by: row
            .try_get("requested_by")
            .map_err(db_err("read requested_by"))?,
        required_permission: row
            .try_get("required_permission")
            .map_err(db_err("read required_permission"))?,
        state: state_raw
            .parse()
            .map_err(|_| OvsError::internal(format!("unknown approval state '{state_raw}'")))?,
        reason: row.try_get("reason").map_err(db_err("read reason"))?,
        decided_by: row
            .try_get("decided_by")
            .map_err(db_err("read decided_by"))?,
        decided_at: row
            .try_get("decided_at")
            .map_err(db_err("read decided_at"))?,
        runbook_url: row
            .try_get("runbook_url")
            .map_err(db_err("read runbook_url"))?,
        created_at: row
            .try_get("created_at")
            .map_err(db_err("read created_at"))?,
    })
}

pub async fn insert_approval(pool: &PgPool, new: &NewApproval) -> Result<(), OvsError> {
    sqlx::query(
        r#"
        insert into approvals (
          approval_id, execution_id, tenant_id, requested_by, required_permission, runbook_url
        ) values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(new.approval_id)
    .bind(new.execution_id)
    .bind(&new.tenant_id)
    .bind(&new.requested_by)
    .bind(&new.required_permission)
    .bind(&new.runbook_url)
    .execute(pool)
    .await
    .map_err(db_err("insert_approval failed"))?;
    Ok(())
}

pub async fn fetch_approval(
    pool: &PgPool,
    tenant_id: &str,
    approval_id: Uuid,
) -> Result<Option<ApprovalRow>, OvsError> {
    let row = sqlx::query(
        r#"
        select approval_id, execution_id, tenant_id, requested_by, required_permission,
               state, reason, decided_by, decided_at, runbook_url, created_at
        from approvals
        where tenant_id = $1 and approval_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(approval_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err("fetch_approval failed"))?;

    row.map(row_to_approval).transpose()
}

/// Decide a PENDING approval. Returns `false` if it was already decided —
/// the caller maps that to CONFLICT.
pub async fn decide_approval(
    pool: &PgPool,
    approval_id: Uuid,
    decision: ApprovalState,
    decided_by: &str,
    reason: Option<&str>,
) -> Result<bool, OvsError> {
    debug_assert!(
        matches!(decision, ApprovalState::Approved | ApprovalState::Rejected),
        "decision must be APPROVED or REJECTED"
    );

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update approvals
           set state      = $2,
               decided_by = $3,
               reason     = coalesce($4, reason),
               decided_at = now()
         where approval_id = $1
           and state = 'PENDING'
        returning approval_id
        "#,
    )
    .bind(approval_id)
    .bind(decision.as_str())
    .bind(decided_by)
    .bind(reason)
    .fetch_optional(pool)
    .await
    .map_err(db_err("decide_approval failed"))?;

    Ok(row.is_some())
}

/// The APPROVED approval id for an execution, if one exists.
pub async fn approved_approval_id(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Option<Uuid>, OvsError> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        select approval_id from approvals
        where execution_id = $1 and state = 'APPROVED'
        order by decided_at desc
        limit 1
        "#,
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err("approved_approval_id failed"))?;
    Ok(row.map(|(id,)| id))
}

/// Does the execution carry an APPROVED row? RUNNING is forbidden without.
pub async fn has_approved_row(pool: &PgPool, execution_id: Uuid) -> Result<bool, OvsError> {
    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from approvals
            where execution_id = $1 and state = 'APPROVED'
        )
        "#,
    )
    .bind(execution_id)
    .fetch_one(pool)
    .await
    .map_err(db_err("has_approved_row failed"))?;
    Ok(exists)
}

/// The pending approval of an execution, if any.
pub async fn pending_approval_for_execution(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Option<ApprovalRow>, OvsError> {
    let row = sqlx::query(
        r#"
        select approval_id, execution_id, tenant_id, requested_by, required_permission,
               state, reason, decided_by, decided_at, runbook_url, created_at
        from approvals
        where execution_id = $1 and state = 'PENDING'
        order by created_at desc
        limit 1
        "#,
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err("pending_approval_for_execution failed"))?;

    row.map(row_to_approval).transpose()
}
