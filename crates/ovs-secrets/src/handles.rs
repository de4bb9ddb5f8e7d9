//! Short-lived opaque credential handles.
//!
//! The execution layer never sees plaintext: a lookup issues a handle, the
//! automation client carries it to the boundary and resolves it just in
//! time. Handles are single-use and expire after the TTL; release and
//! expiry both zero the stored password bytes before dropping them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_HANDLE_TTL: Duration = Duration::from_secs(300);

/// Plaintext credential as handed to the automation boundary. Not `Clone`
/// and never `Debug`-printed with its password.
pub struct PlainCredential {
    pub host: String,
    pub purpose: String,
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
}

impl std::fmt::Debug for PlainCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainCredential")
            .field("host", &self.host)
            .field("purpose", &self.purpose)
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .field("domain", &self.domain)
            .finish()
    }
}

struct HandleEntry {
    host: String,
    purpose: String,
    username: String,
    password: Vec<u8>,
    domain: Option<String>,
    issued_at: Instant,
}

impl HandleEntry {
    fn zeroize(&mut self) {
        for b in self.password.iter_mut() {
            *b = 0;
        }
        self.password.clear();
    }
}

/// In-memory handle store. One per process; handles are meaningless across
/// instances by design.
pub struct HandleStore {
    entries: Mutex<HashMap<String, HandleEntry>>,
    ttl: Duration,
}

impl HandleStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Issue a handle for a decrypted credential.
    pub async fn issue(
        &self,
        host: &str,
        purpose: &str,
        username: &str,
        password: String,
        domain: Option<String>,
    ) -> String {
        let handle = format!("ovsh-{}", Uuid::new_v4().simple());
        let mut entries = self.entries.lock().await;
        entries.insert(
            handle.clone(),
            HandleEntry {
                host: host.to_string(),
                purpose: purpose.to_string(),
                username: username.to_string(),
                password: password.into_bytes(),
                domain,
                issued_at: Instant::now(),
            },
        );
        handle
    }

    /// Resolve and consume a handle. `None` for unknown, expired, or
    /// already-consumed handles — indistinguishable on purpose.
    pub async fn resolve(&self, handle: &str) -> Option<PlainCredential> {
        let mut entries = self.entries.lock().await;
        let mut entry = entries.remove(handle)?;

        if entry.issued_at.elapsed() > self.ttl {
            entry.zeroize();
            return None;
        }

        let password = String::from_utf8(std::mem::take(&mut entry.password)).ok()?;
        Some(PlainCredential {
            host: entry.host.clone(),
            purpose: entry.purpose.clone(),
            username: entry.username.clone(),
            password,
            domain: entry.domain.clone(),
        })
    }

    /// Retire a handle without resolving it (step teardown).
    pub async fn release(&self, handle: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(mut entry) = entries.remove(handle) {
            entry.zeroize();
        }
    }

    /// Drop every expired entry. Called opportunistically by the broker.
    pub async fn purge_expired(&self) {
        let mut entries = self.entries.lock().await;
        let ttl = self.ttl;
        entries.retain(|_, e| {
            if e.issued_at.elapsed() > ttl {
                e.zeroize();
                false
            } else {
                true
            }
        });
    }

    pub async fn live_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handles_are_single_use() {
        let store = HandleStore::new(DEFAULT_HANDLE_TTL);
        let h = store
            .issue("db-01", "admin", "svc", "pw".into(), None)
            .await;

        let cred = store.resolve(&h).await.expect("first resolve succeeds");
        assert_eq!(cred.username, "svc");
        assert_eq!(cred.password, "pw");

        assert!(store.resolve(&h).await.is_none(), "second resolve fails");
    }

    #[tokio::test]
    async fn expired_handles_do_not_resolve() {
        let store = HandleStore::new(Duration::ZERO);
        let h = store
            .issue("db-01", "admin", "svc", "pw".into(), None)
            .await;
        assert!(store.resolve(&h).await.is_none());
    }

    #[tokio::test]
    async fn release_retires_a_handle() {
        let store = HandleStore::new(DEFAULT_HANDLE_TTL);
        let h = store
            .issue("db-01", "admin", "svc", "pw".into(), None)
            .await;
        store.release(&h).await;
        assert!(store.resolve(&h).await.is_none());
        assert_eq!(store.live_count().await, 0);
    }

    #[tokio::test]
    async fn debug_never_prints_the_password() {
        let cred = PlainCredential {
            host: "h".into(),
            purpose: "p".into(),
            username: "u".into(),
            password: "hunter2".into(),
            domain: None,
        };
        let dbg = format!("{cred:?}");
        assert!(!dbg.contains("hunter2"));
    }
}
