//! Secrets manager: per-step secret-reference resolution.
//!
//! Step inputs are walked recursively; any value of the shape
//! `{"type": "secret", "path": "<host>/<purpose>"}` is exchanged for a
//! short-lived opaque handle at step start. The plaintext never enters the
//! inputs — downstream clients carry the handle to the automation boundary,
//! which resolves it just in time. At step end every handle issued for the
//! step is released (best-effort; the broker's TTL bounds stragglers).

use async_trait::async_trait;
use ovs_schemas::{plan::is_secret_ref, OvsError};
use serde_json::{json, Value};
use tracing::warn;

// ---------------------------------------------------------------------------
// SecretResolver
// ---------------------------------------------------------------------------

/// A resolved secret handle. Carries no plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretHandle {
    pub handle: String,
    pub username: String,
    pub domain: Option<String>,
}

/// Boundary to the credential broker. `resolve` exchanges a secret path for
/// a handle; `release` retires the handle (zeroizing broker-side state).
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, tenant_id: &str, path: &str) -> Result<SecretHandle, OvsError>;
    async fn release(&self, handle: &str) -> Result<(), OvsError>;
}

// ---------------------------------------------------------------------------
// SecretsManager
// ---------------------------------------------------------------------------

pub struct SecretsManager<'a> {
    resolver: &'a dyn SecretResolver,
}

/// Inputs with refs swapped for handles, plus the handles to release at
/// step end.
#[derive(Debug)]
pub struct ResolvedInputs {
    pub inputs: Value,
    pub issued: Vec<String>,
}

impl<'a> SecretsManager<'a> {
    pub fn new(resolver: &'a dyn SecretResolver) -> Self {
        Self { resolver }
    }

    /// Walk `inputs` and replace every secret reference with a handle
    /// object: `{"type": "secret_handle", "handle", "username", "domain"}`.
    ///
    /// On any resolution failure, handles already issued in this call are
    /// released before the error propagates — a half-resolved step never
    /// leaks live handles.
    pub async fn resolve_inputs(
        &self,
        tenant_id: &str,
        inputs: &Value,
    ) -> Result<ResolvedInputs, OvsError> {
        let mut issued = Vec::new();
        match self.walk(tenant_id, inputs, &mut issued).await {
            Ok(resolved) => Ok(ResolvedInputs {
                inputs: resolved,
                issued,
            }),
            Err(e) => {
                self.release_all(&issued).await;
                Err(e)
            }
        }
    }

    /// Release every handle issued for a step. Failures are logged only —
    /// the broker TTL retires anything we miss.
    pub async fn release_all(&self, issued: &[String]) {
        for handle in issued {
            if let Err(e) = self.resolver.release(handle).await {
                warn!(error = %e, "secret handle release failed; TTL will retire it");
            }
        }
    }

    /// Recursion is depth-first so arrays/objects of refs all resolve.
    /// Not `async fn` recursion directly — boxed to keep the future sized.
    fn walk<'b>(
        &'b self,
        tenant_id: &'b str,
        v: &'b Value,
        issued: &'b mut Vec<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, OvsError>> + Send + 'b>>
    {
        Box::pin(async move {
            if is_secret_ref(v) {
                let path = v
                    .get("path")
                    .and_then(Value::as_str)
                    .expect("is_secret_ref guarantees path");
                let h = self.resolver.resolve(tenant_id, path).await?;
                issued.push(h.handle.clone());
                return Ok(json!({
                    "type": "secret_handle",
                    "handle": h.handle,
                    "username": h.username,
                    "domain": h.domain,
                }));
            }

            Ok(match v {
                Value::Object(map) => {
                    let mut out = serde_json::Map::with_capacity(map.len());
                    for (k, val) in map {
                        out.insert(k.clone(), self.walk(tenant_id, val, issued).await?);
                    }
                    Value::Object(out)
                }
                Value::Array(arr) => {
                    let mut out = Vec::with_capacity(arr.len());
                    for item in arr {
                        out.push(self.walk(tenant_id, item, issued).await?);
                    }
                    Value::Array(out)
                }
                other => other.clone(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeResolver {
        released: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl FakeResolver {
        fn new() -> Self {
            Self {
                released: Mutex::new(vec![]),
                fail_on: None,
            }
        }

        fn failing_on(path: &str) -> Self {
            Self {
                released: Mutex::new(vec![]),
                fail_on: Some(path.to_string()),
            }
        }
    }

    #[async_trait]
    impl SecretResolver for FakeResolver {
        async fn resolve(&self, _tenant: &str, path: &str) -> Result<SecretHandle, OvsError> {
            if self.fail_on.as_deref() == Some(path) {
                return Err(OvsError::not_found(format!("no credential at '{path}'")));
            }
            Ok(SecretHandle {
                handle: format!("h-{path}"),
                username: "svc".into(),
                domain: None,
            })
        }

        async fn release(&self, handle: &str) -> Result<(), OvsError> {
            self.released.lock().unwrap().push(handle.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn refs_become_handles_and_plaintext_never_appears() {
        let r = FakeResolver::new();
        let m = SecretsManager::new(&r);
        let inputs = json!({
            "host": "db-01",
            "auth": {"type": "secret", "path": "db-01/admin"},
            "extra": [{"type": "secret", "path": "db-01/backup"}],
        });

        let resolved = m.resolve_inputs("t1", &inputs).await.unwrap();
        assert_eq!(resolved.inputs["auth"]["type"], "secret_handle");
        assert_eq!(resolved.inputs["auth"]["handle"], "h-db-01/admin");
        assert_eq!(resolved.inputs["extra"][0]["handle"], "h-db-01/backup");
        assert_eq!(resolved.issued.len(), 2);
    }

    #[tokio::test]
    async fn failure_releases_already_issued_handles() {
        let r = FakeResolver::failing_on("db-01/second");
        let m = SecretsManager::new(&r);
        let inputs = json!({
            "first": {"type": "secret", "path": "db-01/first"},
            "second": {"type": "secret", "path": "db-01/second"},
        });

        let err = m.resolve_inputs("t1", &inputs).await.unwrap_err();
        assert_eq!(err.kind, ovs_schemas::ErrorKind::NotFound);
        assert_eq!(
            *r.released.lock().unwrap(),
            vec!["h-db-01/first".to_string()]
        );
    }

    #[tokio::test]
    async fn non_secret_values_pass_through_untouched() {
        let r = FakeResolver::new();
        let m = SecretsManager::new(&r);
        let inputs = json!({"n": 3, "flag": true, "s": "plain"});
        let resolved = m.resolve_inputs("t1", &inputs).await.unwrap();
        assert_eq!(resolved.inputs, inputs);
        assert!(resolved.issued.is_empty());
    }
}
