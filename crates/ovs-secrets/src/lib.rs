//! Credential broker: at-rest encrypted credential store fronted by an
//! internal-only API.
//!
//! Callers never receive a password over the wire — `lookup` returns a
//! short-lived opaque handle plus the username; the automation client
//! resolves the handle just in time at the boundary to the target host.
//! Every operation lands in the append-only `secrets_audit` table.

use std::time::Duration;

use async_trait::async_trait;
use ovs_schemas::OvsError;
use sqlx::PgPool;
use tracing::info;

pub mod crypto;
pub mod handles;

use handles::{HandleStore, PlainCredential, DEFAULT_HANDLE_TTL};
use ovs_db::credentials::{NewCredential, SecretsAuditEntry};
use ovs_metrics::Metrics;
use ovs_safety::{SecretHandle, SecretResolver};

/// Actor recorded for broker calls made by the execution layer itself.
pub const ENGINE_ACTOR: &str = "execution-engine";

/// Result of a lookup: what the wire is allowed to carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialLease {
    pub handle: String,
    pub username: String,
    pub domain: Option<String>,
}

pub struct SecretsBroker {
    pool: PgPool,
    master_key: String,
    internal_key: String,
    handles: HandleStore,
    metrics: &'static Metrics,
}

impl SecretsBroker {
    pub fn new(pool: PgPool, master_key: String, internal_key: String) -> Self {
        Self::with_handle_ttl(pool, master_key, internal_key, DEFAULT_HANDLE_TTL)
    }

    pub fn with_handle_ttl(
        pool: PgPool,
        master_key: String,
        internal_key: String,
        handle_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            master_key,
            internal_key,
            handles: HandleStore::new(handle_ttl),
            metrics: Metrics::global(),
        }
    }

    /// Internal-key check for the HTTP layer. A mismatch must render as 404
    /// — indistinguishable from a missing credential — so this returns a
    /// plain bool and the caller picks the response shape.
    pub fn internal_key_matches(&self, provided: Option<&str>) -> bool {
        keys_match(&self.internal_key, provided)
    }

    /// Store or replace the credential for `(host, purpose)`.
    pub async fn upsert(
        &self,
        actor: &str,
        host: &str,
        purpose: &str,
        username: &str,
        password: &str,
        domain: Option<String>,
    ) -> Result<(), OvsError> {
        let ciphertext = crypto::encrypt(&self.master_key, password)?;
        let result = ovs_db::credentials::upsert_credential(
            &self.pool,
            &NewCredential {
                host: host.to_string(),
                purpose: purpose.to_string(),
                username: username.to_string(),
                ciphertext,
                domain,
            },
        )
        .await;

        self.audit(actor, host, purpose, "UPSERT", outcome_of(&result))
            .await?;
        result?;

        info!(host, purpose, "credential upserted");
        Ok(())
    }

    /// Decrypt the credential and issue a handle.
    ///
    /// # Errors
    /// `NOT_FOUND` when no credential exists for `(host, purpose)`.
    pub async fn lookup(
        &self,
        actor: &str,
        host: &str,
        purpose: &str,
    ) -> Result<CredentialLease, OvsError> {
        self.handles.purge_expired().await;

        let row = ovs_db::credentials::fetch_credential(&self.pool, host, purpose).await?;
        let Some(row) = row else {
            self.audit(actor, host, purpose, "LOOKUP", "NOT_FOUND").await?;
            self.metrics
                .secrets_lookups_total
                .with_label_values(&["not_found"])
                .inc();
            return Err(OvsError::not_found(format!(
                "no credential for {host}/{purpose}"
            )));
        };

        let password = crypto::decrypt(&self.master_key, &row.ciphertext)?;
        let handle = self
            .handles
            .issue(host, purpose, &row.username, password, row.domain.clone())
            .await;

        self.audit(actor, host, purpose, "LOOKUP", "OK").await?;
        self.metrics
            .secrets_lookups_total
            .with_label_values(&["ok"])
            .inc();

        Ok(CredentialLease {
            handle,
            username: row.username,
            domain: row.domain,
        })
    }

    /// Remove a credential.
    pub async fn delete(&self, actor: &str, host: &str, purpose: &str) -> Result<(), OvsError> {
        let removed = ovs_db::credentials::delete_credential(&self.pool, host, purpose).await?;
        let outcome = if removed { "OK" } else { "NOT_FOUND" };
        self.audit(actor, host, purpose, "DELETE", outcome).await?;

        if !removed {
            return Err(OvsError::not_found(format!(
                "no credential for {host}/{purpose}"
            )));
        }
        Ok(())
    }

    /// Just-in-time handle resolution for the automation boundary. Single
    /// use; unknown, expired, and consumed handles are indistinguishable.
    pub async fn resolve_handle(&self, handle: &str) -> Option<PlainCredential> {
        self.handles.resolve(handle).await
    }

    /// Retire a handle without resolving it.
    pub async fn release_handle(&self, handle: &str) {
        self.handles.release(handle).await;
    }

    async fn audit(
        &self,
        actor: &str,
        host: &str,
        purpose: &str,
        operation: &str,
        outcome: &str,
    ) -> Result<(), OvsError> {
        ovs_db::credentials::append_secrets_audit(
            &self.pool,
            &SecretsAuditEntry {
                actor: actor.to_string(),
                host: host.to_string(),
                purpose: purpose.to_string(),
                operation: operation.to_string(),
                outcome: outcome.to_string(),
            },
        )
        .await
    }
}

fn outcome_of<T>(result: &Result<T, OvsError>) -> &'static str {
    if result.is_ok() {
        "OK"
    } else {
        "ERROR"
    }
}

/// Byte-wise comparison without early exit once lengths match.
fn keys_match(expected: &str, provided: Option<&str>) -> bool {
    match provided {
        Some(p) if p.len() == expected.len() => p
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// SecretResolver — the safety layer's view of the broker
// ---------------------------------------------------------------------------

/// Secret references in step inputs use the path form `<host>/<purpose>`.
fn split_secret_path(path: &str) -> Result<(&str, &str), OvsError> {
    match path.split_once('/') {
        Some((host, purpose)) if !host.is_empty() && !purpose.is_empty() => Ok((host, purpose)),
        _ => Err(OvsError::validation(format!(
            "secret path '{path}' is not of the form host/purpose"
        ))),
    }
}

#[async_trait]
impl SecretResolver for SecretsBroker {
    async fn resolve(&self, _tenant_id: &str, path: &str) -> Result<SecretHandle, OvsError> {
        let (host, purpose) = split_secret_path(path)?;
        let lease = self.lookup(ENGINE_ACTOR, host, purpose).await?;
        Ok(SecretHandle {
            handle: lease.handle,
            username: lease.username,
            domain: lease.domain,
        })
    }

    async fn release(&self, handle: &str) -> Result<(), OvsError> {
        self.release_handle(handle).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_path_splits_on_the_first_slash() {
        assert_eq!(
            split_secret_path("db-01/admin").unwrap(),
            ("db-01", "admin")
        );
        assert_eq!(
            split_secret_path("db-01/backup/daily").unwrap(),
            ("db-01", "backup/daily")
        );
        assert!(split_secret_path("no-slash").is_err());
        assert!(split_secret_path("/purpose").is_err());
        assert!(split_secret_path("host/").is_err());
    }

    #[test]
    fn internal_key_comparison_requires_exact_match() {
        assert!(keys_match("internal-key-123", Some("internal-key-123")));
        assert!(!keys_match("internal-key-123", Some("internal-key-124")));
        assert!(!keys_match("internal-key-123", Some("short")));
        assert!(!keys_match("internal-key-123", None));
    }
}
