//! Asset inventory records as consumed from the external inventory service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One asset as returned by the inventory service. The resolver validates
/// required fields on every response before this struct reaches callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetRecord {
    pub asset_id: String,
    pub name: String,
    pub hostname: String,
    pub ip_address: String,
    pub os_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub is_secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_status: Option<String>,
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl AssetRecord {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

/// Derived record describing how to reach an asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionProfile {
    pub host: String,
    pub port: u16,
    /// "ssh" | "winrm" | "http" | "https"
    pub protocol: String,
    pub is_secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,
    pub updated_at: DateTime<Utc>,
}
