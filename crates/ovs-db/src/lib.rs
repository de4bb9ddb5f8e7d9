//! Typed PostgreSQL access for the Overseer execution core.
//!
//! Business tables (`executions`, `execution_steps`, `approvals`,
//! `execution_events`) live apart from the coordination tables
//! (`execution_queue`, `execution_locks`) so long-running lease operations
//! never contend with business reads.
//!
//! Every repo function returns `Result<_, OvsError>`: sqlx failures map to
//! `INTERNAL` unless a more specific kind applies (unique violation →
//! `CONFLICT`, missing row → `NOT_FOUND`).

use ovs_schemas::{ErrorKind, OvsError};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub mod approvals;
pub mod catalog;
pub mod credentials;
pub mod events;
pub mod executions;
pub mod locks;
pub mod queue;
pub mod steps;

pub use approvals::{ApprovalRow, NewApproval};
pub use catalog::ToolRow;
pub use credentials::{CredentialRow, NewCredential, SecretsAuditEntry};
pub use events::EventRow;
pub use executions::{ExecutionRow, NewExecution};
pub use locks::LockRow;
pub use queue::{DlqRow, QueueItemRow};
pub use steps::{NewStep, StepRow};

pub const ENV_DB_URL: &str = "OVS_DATABASE_URL";

/// Connect to Postgres using OVS_DATABASE_URL. Pool bounds follow the shared
/// resource policy: min 5 / max 20 connections.
pub async fn connect_from_env() -> Result<PgPool, OvsError> {
    let url = std::env::var(ENV_DB_URL)
        .map_err(|_| OvsError::internal(format!("missing env var {ENV_DB_URL}")))?;

    let pool = PgPoolOptions::new()
        .min_connections(5)
        .max_connections(20)
        .connect(&url)
        .await
        .map_err(db_err("failed to connect to Postgres"))?;

    Ok(pool)
}

/// Test helper used by integration tests:
/// - Connect using OVS_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool, OvsError> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), OvsError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| OvsError::internal(format!("db migrate failed: {e}")))?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus, OvsError> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .map_err(db_err("status connectivity query failed"))?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='executions'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(db_err("status table-exists query failed"))?;

    Ok(DbStatus {
        ok,
        has_executions_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_executions_table: bool,
}

/// Count executions that are operationally live: QUEUED or RUNNING.
/// Used by CLI guardrails to prevent migration of a busy database.
pub async fn count_live_executions(pool: &PgPool) -> Result<i64, OvsError> {
    let st = status(pool).await?;
    if !st.has_executions_table {
        return Ok(0);
    }

    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
        r#"
        select count(*)::bigint
        from executions
        where status in ('QUEUED','RUNNING')
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(db_err("count_live_executions failed"))?;

    Ok(n)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Map a sqlx error to an `OvsError`, attaching repo context.
/// Unique violations become CONFLICT so callers can branch on them.
pub(crate) fn db_err(ctx: &'static str) -> impl FnOnce(sqlx::Error) -> OvsError {
    move |e| {
        let kind = match &e {
            sqlx::Error::RowNotFound => ErrorKind::NotFound,
            sqlx::Error::Database(dbe) if dbe.is_unique_violation() => ErrorKind::Conflict,
            _ => ErrorKind::Internal,
        };
        OvsError::new(kind, format!("{ctx}: {e}"))
    }
}
