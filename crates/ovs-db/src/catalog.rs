//! Versioned tool registry rows.
//!
//! `(tool_name, version)` is unique; the partial unique index guarantees at
//! most one `is_latest` row per tool. Version assignment and the latest-flag
//! flip happen in one transaction.

use chrono::{DateTime, Utc};
use ovs_schemas::{OvsError, ToolSpec};
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::db_err;

#[derive(Debug, Clone)]
pub struct ToolRow {
    pub tool_name: String,
    pub version: i32,
    pub spec: Value,
    pub enabled: bool,
    pub is_latest: bool,
    pub created_at: DateTime<Utc>,
}

impl ToolRow {
    /// Decode the stored spec JSON into the typed form.
    pub fn decode(&self) -> Result<ToolSpec, OvsError> {
        serde_json::from_value(self.spec.clone()).map_err(|e| {
            OvsError::internal(format!(
                "tool_specs row {}@{} does not decode: {e}",
                self.tool_name, self.version
            ))
        })
    }
}

fn row_to_tool(row: sqlx::postgres::PgRow) -> Result<ToolRow, OvsError> {
    Ok(ToolRow {
        tool_name: row.try_get("tool_name").map_err(db_err("read tool_name"))?,
        version: row.try_get("version").map_err(db_err("read version"))?,
        spec: row.try_get("spec").map_err(db_err("read spec"))?,
        enabled: row.try_get("enabled").map_err(db_err("read enabled"))?,
        is_latest: row.try_get("is_latest").map_err(db_err("read is_latest"))?,
        created_at: row
            .try_get("created_at")
            .map_err(db_err("read created_at"))?,
    })
}

/// Insert a new version of a tool and flip `is_latest` to it.
/// Returns the assigned version number.
pub async fn put_tool(pool: &PgPool, tool_name: &str, spec: &Value) -> Result<i32, OvsError> {
    let mut tx = pool.begin().await.map_err(db_err("begin put_tool"))?;

    let (next,): (i32,) = sqlx::query_as(
        r#"
        select coalesce(max(version), 0) + 1
        from tool_specs
        where tool_name = $1
        "#,
    )
    .bind(tool_name)
    .fetch_one(&mut *tx)
    .await
    .map_err(db_err("put_tool: next version"))?;

    sqlx::query("update tool_specs set is_latest = false where tool_name = $1 and is_latest")
        .bind(tool_name)
        .execute(&mut *tx)
        .await
        .map_err(db_err("put_tool: clear latest"))?;

    sqlx::query(
        r#"
        insert into tool_specs (tool_name, version, spec, enabled, is_latest)
        values ($1, $2, $3, coalesce(($3->>'enabled')::boolean, true), true)
        "#,
    )
    .bind(tool_name)
    .bind(next)
    .bind(spec)
    .execute(&mut *tx)
    .await
    .map_err(db_err("put_tool: insert"))?;

    tx.commit().await.map_err(db_err("commit put_tool"))?;
    Ok(next)
}

/// Latest version of a tool, if any.
pub async fn get_latest(pool: &PgPool, tool_name: &str) -> Result<Option<ToolRow>, OvsError> {
    let row = sqlx::query(
        r#"
        select tool_name, version, spec, enabled, is_latest, created_at
        from tool_specs
        where tool_name = $1 and is_latest
        "#,
    )
    .bind(tool_name)
    .fetch_optional(pool)
    .await
    .map_err(db_err("get_latest failed"))?;

    row.map(row_to_tool).transpose()
}

/// A specific pinned version.
pub async fn get_version(
    pool: &PgPool,
    tool_name: &str,
    version: i32,
) -> Result<Option<ToolRow>, OvsError> {
    let row = sqlx::query(
        r#"
        select tool_name, version, spec, enabled, is_latest, created_at
        from tool_specs
        where tool_name = $1 and version = $2
        "#,
    )
    .bind(tool_name)
    .bind(version)
    .fetch_optional(pool)
    .await
    .map_err(db_err("get_version failed"))?;

    row.map(row_to_tool).transpose()
}

/// The latest-version view — the default read path. `enabled_only` hides
/// disabled tools (selection must never see them).
pub async fn list_latest(pool: &PgPool, enabled_only: bool) -> Result<Vec<ToolRow>, OvsError> {
    let rows = sqlx::query(
        r#"
        select tool_name, version, spec, enabled, is_latest, created_at
        from tool_specs
        where is_latest
          and (enabled or not $1)
        order by tool_name asc
        "#,
    )
    .bind(enabled_only)
    .fetch_all(pool)
    .await
    .map_err(db_err("list_latest failed"))?;

    rows.into_iter().map(row_to_tool).collect()
}

/// Point `is_latest` at an existing earlier version.
/// Returns `false` if that version does not exist.
pub async fn rollback_to_version(
    pool: &PgPool,
    tool_name: &str,
    version: i32,
) -> Result<bool, OvsError> {
    let mut tx = pool.begin().await.map_err(db_err("begin rollback"))?;

    let exists: Option<(i32,)> =
        sqlx::query_as("select version from tool_specs where tool_name = $1 and version = $2")
            .bind(tool_name)
            .bind(version)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("rollback: check version"))?;

    if exists.is_none() {
        return Ok(false);
    }

    sqlx::query("update tool_specs set is_latest = false where tool_name = $1 and is_latest")
        .bind(tool_name)
        .execute(&mut *tx)
        .await
        .map_err(db_err("rollback: clear latest"))?;

    sqlx::query("update tool_specs set is_latest = true where tool_name = $1 and version = $2")
        .bind(tool_name)
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(db_err("rollback: set latest"))?;

    tx.commit().await.map_err(db_err("commit rollback"))?;
    Ok(true)
}

/// Enable or disable every version of a tool.
pub async fn set_enabled(pool: &PgPool, tool_name: &str, enabled: bool) -> Result<u64, OvsError> {
    let res = sqlx::query("update tool_specs set enabled = $2 where tool_name = $1")
        .bind(tool_name)
        .bind(enabled)
        .execute(pool)
        .await
        .map_err(db_err("set_enabled failed"))?;
    Ok(res.rows_affected())
}
