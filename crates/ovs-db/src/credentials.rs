//! Credential broker storage and its append-only audit trail.
//!
//! Only ciphertext enters this module; encryption and decryption live in
//! the broker crate. Nothing here ever logs a row's contents.

use chrono::{DateTime, Utc};
use ovs_schemas::OvsError;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub host: String,
    pub purpose: String,
    pub username: String,
    pub ciphertext: String,
    pub domain: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCredential {
    pub host: String,
    pub purpose: String,
    pub username: String,
    pub ciphertext: String,
    pub domain: Option<String>,
}

/// One broker audit entry. Append-only; passwords never appear here.
#[derive(Debug, Clone)]
pub struct SecretsAuditEntry {
    pub actor: String,
    pub host: String,
    pub purpose: String,
    /// UPSERT | LOOKUP | DELETE
    pub operation: String,
    /// OK | NOT_FOUND | DENIED | ERROR
    pub outcome: String,
}

/// Insert or replace the credential for `(host, purpose)`.
pub async fn upsert_credential(pool: &PgPool, new: &NewCredential) -> Result<(), OvsError> {
    sqlx::query(
        r#"
        insert into credentials (host, purpose, username, ciphertext, domain)
        values ($1, $2, $3, $4, $5)
        on conflict (host, purpose) do update
           set username   = excluded.username,
               ciphertext = excluded.ciphertext,
               domain     = excluded.domain,
               updated_at = now()
        "#,
    )
    .bind(&new.host)
    .bind(&new.purpose)
    .bind(&new.username)
    .bind(&new.ciphertext)
    .bind(&new.domain)
    .execute(pool)
    .await
    .map_err(db_err("upsert_credential failed"))?;

    Ok(())
}

pub async fn fetch_credential(
    pool: &PgPool,
    host: &str,
    purpose: &str,
) -> Result<Option<CredentialRow>, OvsError> {
    let row = sqlx::query(
        r#"
        select host, purpose, username, ciphertext, domain, created_at, updated_at
        from credentials
        where host = $1 and purpose = $2
        "#,
    )
    .bind(host)
    .bind(purpose)
    .fetch_optional(pool)
    .await
    .map_err(db_err("fetch_credential failed"))?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(CredentialRow {
        host: row.try_get("host").map_err(db_err("read host"))?,
        purpose: row.try_get("purpose").map_err(db_err("read purpose"))?,
        username: row.try_get("username").map_err(db_err("read username"))?,
        ciphertext: row
            .try_get("ciphertext")
            .map_err(db_err("read ciphertext"))?,
        domain: row.try_get("domain").map_err(db_err("read domain"))?,
        created_at: row
            .try_get("created_at")
            .map_err(db_err("read created_at"))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(db_err("read updated_at"))?,
    }))
}

pub async fn delete_credential(pool: &PgPool, host: &str, purpose: &str) -> Result<bool, OvsError> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        delete from credentials
         where host = $1 and purpose = $2
        returning host
        "#,
    )
    .bind(host)
    .bind(purpose)
    .fetch_optional(pool)
    .await
    .map_err(db_err("delete_credential failed"))?;

    Ok(row.is_some())
}

/// Append one audit entry. Failures here are surfaced — a broker operation
/// whose audit write fails is treated as failed.
pub async fn append_secrets_audit(
    pool: &PgPool,
    entry: &SecretsAuditEntry,
) -> Result<(), OvsError> {
    sqlx::query(
        r#"
        insert into secrets_audit (audit_id, actor, host, purpose, operation, outcome)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&entry.actor)
    .bind(&entry.host)
    .bind(&entry.purpose)
    .bind(&entry.operation)
    .bind(&entry.outcome)
    .execute(pool)
    .await
    .map_err(db_err("append_secrets_audit failed"))?;

    Ok(())
}
