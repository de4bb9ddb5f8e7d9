//! Required key material resolved once at startup.
//!
//! - `SECRETS_KMS_KEY` — master key the credential broker derives row keys
//!   from (PBKDF2). Required.
//! - `INTERNAL_KEY` — shared key for the internal-only broker API. Required.
//!
//! Values are redacted in `Debug` output; error messages name the env var,
//! never the value.

use anyhow::{bail, Result};

pub const ENV_SECRETS_KMS_KEY: &str = "SECRETS_KMS_KEY";
pub const ENV_INTERNAL_KEY: &str = "INTERNAL_KEY";

/// Key material for one process instantiation. Built once; pass to
/// constructors. Do not scatter `std::env::var` calls elsewhere.
#[derive(Clone)]
pub struct ResolvedKeys {
    pub kms_master_key: String,
    pub internal_key: String,
}

impl std::fmt::Debug for ResolvedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedKeys")
            .field("kms_master_key", &"<REDACTED>")
            .field("internal_key", &"<REDACTED>")
            .finish()
    }
}

impl ResolvedKeys {
    /// Resolve both required keys from the environment.
    ///
    /// # Errors
    /// Returns `Err` naming the first missing env var. The value is never
    /// mentioned.
    pub fn from_env() -> Result<Self> {
        let kms_master_key = match std::env::var(ENV_SECRETS_KMS_KEY) {
            Ok(v) if !v.trim().is_empty() => v,
            _ => bail!(
                "SECRETS_MISSING: required env var '{}' is not set or empty",
                ENV_SECRETS_KMS_KEY
            ),
        };
        let internal_key = match std::env::var(ENV_INTERNAL_KEY) {
            Ok(v) if !v.trim().is_empty() => v,
            _ => bail!(
                "SECRETS_MISSING: required env var '{}' is not set or empty",
                ENV_INTERNAL_KEY
            ),
        };
        Ok(Self {
            kms_master_key,
            internal_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_never_contains_key_material() {
        let keys = ResolvedKeys {
            kms_master_key: "super-secret-master".to_string(),
            internal_key: "internal-0123".to_string(),
        };
        let dbg = format!("{keys:?}");
        assert!(!dbg.contains("super-secret-master"));
        assert!(!dbg.contains("internal-0123"));
        assert!(dbg.contains("<REDACTED>"));
    }
}
