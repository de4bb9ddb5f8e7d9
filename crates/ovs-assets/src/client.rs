//! Inventory service client.
//!
//! Tenant isolation is enforced here: every outbound call carries the
//! `X-Tenant-Id` header. Responses are schema-validated before they become
//! typed records — a missing required field fails fast and bumps the
//! `inventory_schema` error class.

use async_trait::async_trait;
use ovs_schemas::{AssetRecord, ConnectionProfile, OvsError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ovs_metrics::Metrics;

/// Filters accepted by the inventory search endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AssetQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    /// Substring match over hostname / name / ip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl AssetQuery {
    /// Stable cache-key fragment for this query.
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).expect("query serializes")
    }
}

#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn search(&self, tenant_id: &str, query: &AssetQuery)
        -> Result<Vec<AssetRecord>, OvsError>;
    async fn count(&self, tenant_id: &str, query: &AssetQuery) -> Result<i64, OvsError>;
    async fn connection_profile(
        &self,
        tenant_id: &str,
        host: &str,
    ) -> Result<Option<ConnectionProfile>, OvsError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Fields every asset payload must carry; anything less is a contract breach.
const REQUIRED_ASSET_FIELDS: &[&str] = &[
    "asset_id",
    "name",
    "hostname",
    "ip_address",
    "os_type",
    "environment",
    "updated_at",
];

pub struct HttpInventoryClient {
    client: reqwest::Client,
    base_url: String,
    metrics: &'static Metrics,
}

impl HttpInventoryClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            metrics: Metrics::global(),
        }
    }

    fn schema_error(&self, what: &str) -> OvsError {
        self.metrics
            .errors_total
            .with_label_values(&["inventory_schema", "asset_search"])
            .inc();
        OvsError::internal(format!("inventory response missing required field: {what}"))
    }

    fn validate_and_decode(&self, raw: &Value) -> Result<AssetRecord, OvsError> {
        for field in REQUIRED_ASSET_FIELDS {
            if raw.get(field).map_or(true, Value::is_null) {
                return Err(self.schema_error(field));
            }
        }
        serde_json::from_value(raw.clone())
            .map_err(|e| self.schema_error(&format!("decode failed: {e}")))
    }

    async fn get_json(&self, tenant_id: &str, path_and_query: &str) -> Result<Value, OvsError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let resp = self
            .client
            .get(&url)
            .header("X-Tenant-Id", tenant_id)
            .send()
            .await
            .map_err(|e| OvsError::transient(format!("inventory call failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(OvsError::transient(format!(
                "inventory returned {} for {path_and_query}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| OvsError::transient(format!("inventory body unreadable: {e}")))
    }
}

fn query_string(query: &AssetQuery) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut push = |k: &str, v: &str| {
        parts.push(format!(
            "{k}={}",
            // minimal escaping for the characters that matter in a query
            v.replace('%', "%25").replace('&', "%26").replace(' ', "%20")
        ));
    };
    if let Some(v) = &query.asset_id {
        push("asset_id", v);
    }
    if let Some(v) = &query.search {
        push("search", v);
    }
    if let Some(v) = &query.os_type {
        push("os_type", v);
    }
    if let Some(v) = &query.service_type {
        push("service_type", v);
    }
    if let Some(v) = &query.environment {
        push("environment", v);
    }
    if let Some(v) = query.is_active {
        push("is_active", if v { "true" } else { "false" });
    }
    if let Some(v) = query.limit {
        push("limit", &v.to_string());
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("?{}", parts.join("&"))
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn search(
        &self,
        tenant_id: &str,
        query: &AssetQuery,
    ) -> Result<Vec<AssetRecord>, OvsError> {
        let body = self
            .get_json(tenant_id, &format!("/assets/search{}", query_string(query)))
            .await?;

        let items = body
            .get("assets")
            .and_then(Value::as_array)
            .ok_or_else(|| self.schema_error("assets"))?;

        items.iter().map(|raw| self.validate_and_decode(raw)).collect()
    }

    async fn count(&self, tenant_id: &str, query: &AssetQuery) -> Result<i64, OvsError> {
        let body = self
            .get_json(tenant_id, &format!("/assets/count{}", query_string(query)))
            .await?;
        body.get("count")
            .and_then(Value::as_i64)
            .ok_or_else(|| self.schema_error("count"))
    }

    async fn connection_profile(
        &self,
        tenant_id: &str,
        host: &str,
    ) -> Result<Option<ConnectionProfile>, OvsError> {
        let body = self
            .get_json(
                tenant_id,
                &format!("/assets/connection-profile?host={host}"),
            )
            .await?;

        if body.get("profile").map_or(true, Value::is_null) {
            return Ok(None);
        }
        serde_json::from_value(body["profile"].clone())
            .map(Some)
            .map_err(|e| self.schema_error(&format!("profile decode failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_includes_only_set_filters() {
        let q = AssetQuery {
            search: Some("web prod".into()),
            environment: Some("production".into()),
            limit: Some(5),
            ..Default::default()
        };
        let qs = query_string(&q);
        assert_eq!(qs, "?search=web%20prod&environment=production&limit=5");
        assert_eq!(query_string(&AssetQuery::default()), "");
    }

    #[test]
    fn cache_key_is_stable_per_query() {
        let q1 = AssetQuery {
            search: Some("x".into()),
            ..Default::default()
        };
        let q2 = q1.clone();
        assert_eq!(q1.cache_key(), q2.cache_key());
    }
}
