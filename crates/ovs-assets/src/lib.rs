//! Asset-context resolution: enrich a request with typed asset metadata and
//! connection profiles from the external inventory service.
//!
//! Reads are cached (LRU 128, TTL 120s, key = tenant + projection + query)
//! and transport calls are guarded by a circuit breaker — three consecutive
//! failures open it; while open, callers receive `CIRCUIT_OPEN` without the
//! transport being touched and must degrade gracefully.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ovs_schemas::{AssetRecord, ConnectionProfile, OvsError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

pub mod breaker;
pub mod cache;
pub mod client;

use breaker::CircuitBreaker;
use cache::AssetCache;
use client::{AssetQuery, InventoryClient};
use ovs_metrics::Metrics;

const CACHE_LABEL: &str = "assets";

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Client-requested field subset. The default set matches the façade
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection(pub Vec<String>);

impl Default for Projection {
    fn default() -> Self {
        Self(
            [
                "id",
                "name",
                "hostname",
                "ip_address",
                "environment",
                "status",
                "updated_at",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }
}

impl Projection {
    fn cache_fragment(&self) -> String {
        self.0.join(",")
    }

    /// Project one record into the requested field subset.
    pub fn apply(&self, record: &AssetRecord) -> Value {
        let mut out = serde_json::Map::new();
        for field in &self.0 {
            let v = match field.as_str() {
                "id" => json!(record.asset_id),
                "name" => json!(record.name),
                "hostname" => json!(record.hostname),
                "ip_address" => json!(record.ip_address),
                "os_type" => json!(record.os_type),
                "os_version" => json!(record.os_version),
                "environment" => json!(record.environment),
                "service_type" => json!(record.service_type),
                "port" => json!(record.port),
                "is_secure" => json!(record.is_secure),
                "credential_type" => json!(record.credential_type),
                "is_active" => json!(record.is_active),
                "status" => json!(record.connection_status),
                "updated_at" => json!(record.updated_at),
                _ => continue,
            };
            out.insert(field.clone(), v);
        }
        Value::Object(out)
    }
}

// ---------------------------------------------------------------------------
// Disambiguation contract
// ---------------------------------------------------------------------------

/// Shape consumed by the answer formatter, keyed on how many assets matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetAnswer {
    /// 0 results: guidance plus narrowing suggestions.
    NoMatch {
        guidance: String,
        suggestions: Vec<String>,
    },
    /// Exactly 1 result.
    Single { asset: Value },
    /// 2–5 results, ranked by (−updated_at, environment asc, hostname asc).
    Ranked { assets: Vec<Value> },
    /// More than 5: aggregate by environment with a narrowing hint.
    Aggregated {
        total: usize,
        by_environment: BTreeMap<String, usize>,
        hint: String,
    },
}

/// Apply the disambiguation contract to a result set.
pub fn disambiguate(mut records: Vec<AssetRecord>, projection: &Projection) -> AssetAnswer {
    match records.len() {
        0 => AssetAnswer::NoMatch {
            guidance: "No assets matched the query.".to_string(),
            suggestions: vec![
                "Check the hostname spelling".to_string(),
                "Broaden the search term".to_string(),
                "Drop the environment filter".to_string(),
            ],
        },
        1 => AssetAnswer::Single {
            asset: projection.apply(&records[0]),
        },
        2..=5 => {
            records.sort_by(|a, b| {
                b.updated_at
                    .cmp(&a.updated_at)
                    .then_with(|| a.environment.cmp(&b.environment))
                    .then_with(|| a.hostname.cmp(&b.hostname))
            });
            AssetAnswer::Ranked {
                assets: records.iter().map(|r| projection.apply(r)).collect(),
            }
        }
        n => {
            let mut by_environment: BTreeMap<String, usize> = BTreeMap::new();
            for r in &records {
                *by_environment.entry(r.environment.clone()).or_default() += 1;
            }
            AssetAnswer::Aggregated {
                total: n,
                by_environment,
                hint: "Narrow by environment or service type to get a ranked list.".to_string(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AssetResolver
// ---------------------------------------------------------------------------

pub struct AssetResolver {
    client: Arc<dyn InventoryClient>,
    breaker: CircuitBreaker,
    cache: Mutex<AssetCache>,
    metrics: &'static Metrics,
}

impl AssetResolver {
    pub fn new(
        client: Arc<dyn InventoryClient>,
        cache_capacity: usize,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            client,
            breaker: CircuitBreaker::default(),
            cache: Mutex::new(AssetCache::new(cache_capacity, cache_ttl)),
            metrics: Metrics::global(),
        }
    }

    /// Search with caching, tenant isolation, and breaker protection.
    pub async fn search(
        &self,
        tenant_id: &str,
        query: &AssetQuery,
        projection: &Projection,
    ) -> Result<Vec<AssetRecord>, OvsError> {
        let key = format!(
            "{tenant_id}|{}|{}",
            projection.cache_fragment(),
            query.cache_key()
        );

        {
            let mut cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&key) {
                self.metrics.cache_hits.with_label_values(&[CACHE_LABEL]).inc();
                return Ok(hit);
            }
        }
        self.metrics
            .cache_misses
            .with_label_values(&[CACHE_LABEL])
            .inc();

        let records = self
            .guarded(self.client.search(tenant_id, query))
            .await?;

        let mut cache = self.cache.lock().await;
        cache.put(key, records.clone());
        self.metrics
            .cache_entries
            .with_label_values(&[CACHE_LABEL])
            .set(cache.len() as i64);

        Ok(records)
    }

    /// Search and collapse into the disambiguation shape.
    pub async fn search_and_disambiguate(
        &self,
        tenant_id: &str,
        query: &AssetQuery,
        projection: &Projection,
    ) -> Result<AssetAnswer, OvsError> {
        let records = self.search(tenant_id, query, projection).await?;
        Ok(disambiguate(records, projection))
    }

    /// Count matching assets. Uncached — counts are cheap server-side.
    pub async fn count(&self, tenant_id: &str, query: &AssetQuery) -> Result<i64, OvsError> {
        self.guarded(self.client.count(tenant_id, query)).await
    }

    /// Connection profile by host.
    pub async fn connection_profile(
        &self,
        tenant_id: &str,
        host: &str,
    ) -> Result<Option<ConnectionProfile>, OvsError> {
        self.guarded(self.client.connection_profile(tenant_id, host))
            .await
    }

    /// Exactly-one lookup used by the engine to resolve an execution target.
    ///
    /// # Errors
    /// `NOT_FOUND` for zero matches; `CONFLICT` when the locator is
    /// ambiguous (the caller should surface the disambiguation table).
    pub async fn resolve_target(
        &self,
        tenant_id: &str,
        query: &AssetQuery,
    ) -> Result<AssetRecord, OvsError> {
        let records = self
            .search(tenant_id, query, &Projection::default())
            .await?;
        match records.len() {
            0 => Err(OvsError::not_found("no asset matched the execution target")),
            1 => Ok(records.into_iter().next().expect("len checked")),
            n => Err(OvsError::conflict(format!(
                "execution target is ambiguous: {n} assets matched"
            ))),
        }
    }

    /// Wrap a transport future with the circuit breaker.
    async fn guarded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, OvsError>>,
    ) -> Result<T, OvsError> {
        if !self.breaker.allow().await {
            return Err(OvsError::circuit_open(
                "inventory service is unavailable; try again shortly",
            )
            .with_details(json!({"retry_after_secs": breaker::OPEN_COOLDOWN.as_secs()})));
        }

        match fut.await {
            Ok(v) => {
                self.breaker.record_success().await;
                Ok(v)
            }
            Err(e) if matches!(e.kind, ovs_schemas::ErrorKind::Transient | ovs_schemas::ErrorKind::Internal) =>
            {
                self.breaker.record_failure().await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(host: &str, env: &str, updated_secs: i64) -> AssetRecord {
        AssetRecord {
            asset_id: format!("a-{host}"),
            name: host.to_string(),
            hostname: host.to_string(),
            ip_address: "10.0.0.9".into(),
            os_type: "linux".into(),
            os_version: Some("6.1".into()),
            environment: env.to_string(),
            service_type: Some("nginx".into()),
            port: Some(443),
            is_secure: true,
            credential_type: Some("ssh_key".into()),
            is_active: true,
            connection_status: Some("reachable".into()),
            updated_at: Utc.timestamp_opt(updated_secs, 0).unwrap(),
        }
    }

    struct FakeInventory {
        records: Vec<AssetRecord>,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl InventoryClient for FakeInventory {
        async fn search(
            &self,
            _tenant: &str,
            _query: &AssetQuery,
        ) -> Result<Vec<AssetRecord>, OvsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OvsError::transient("inventory down"));
            }
            Ok(self.records.clone())
        }

        async fn count(&self, _tenant: &str, _query: &AssetQuery) -> Result<i64, OvsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OvsError::transient("inventory down"));
            }
            Ok(self.records.len() as i64)
        }

        async fn connection_profile(
            &self,
            _tenant: &str,
            _host: &str,
        ) -> Result<Option<ConnectionProfile>, OvsError> {
            Ok(None)
        }
    }

    #[test]
    fn default_projection_matches_the_contract() {
        let p = Projection::default();
        let v = p.apply(&record("web-prod-01", "production", 1_700_000_000));
        let obj = v.as_object().unwrap();
        assert_eq!(obj.len(), 7);
        assert_eq!(obj["id"], "a-web-prod-01");
        assert_eq!(obj["status"], "reachable");
        assert!(obj.contains_key("updated_at"));
        assert!(!obj.contains_key("os_type"));
    }

    #[test]
    fn disambiguation_shapes_follow_result_count() {
        let p = Projection::default();

        assert!(matches!(
            disambiguate(vec![], &p),
            AssetAnswer::NoMatch { .. }
        ));
        assert!(matches!(
            disambiguate(vec![record("a", "production", 1)], &p),
            AssetAnswer::Single { .. }
        ));

        let three = vec![
            record("web-prod-02", "production", 100),
            record("web-prod-01", "production", 300),
            record("web-stage-01", "staging", 300),
        ];
        match disambiguate(three, &p) {
            AssetAnswer::Ranked { assets } => {
                // newest first; equal timestamps rank production before staging
                assert_eq!(assets[0]["hostname"], "web-prod-01");
                assert_eq!(assets[1]["hostname"], "web-stage-01");
                assert_eq!(assets[2]["hostname"], "web-prod-02");
            }
            other => panic!("expected ranked, got {other:?}"),
        }

        let many: Vec<_> = (0..7)
            .map(|i| record(&format!("h{i}"), if i % 2 == 0 { "production" } else { "dev" }, i))
            .collect();
        match disambiguate(many, &p) {
            AssetAnswer::Aggregated {
                total,
                by_environment,
                ..
            } => {
                assert_eq!(total, 7);
                assert_eq!(by_environment["production"], 4);
                assert_eq!(by_environment["dev"], 3);
            }
            other => panic!("expected aggregated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cache_serves_the_second_read() {
        let inv = Arc::new(FakeInventory {
            records: vec![record("h1", "staging", 5)],
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let r = AssetResolver::new(inv.clone(), 16, Duration::from_secs(60));
        let q = AssetQuery {
            search: Some("h1".into()),
            ..Default::default()
        };

        r.search("t1", &q, &Projection::default()).await.unwrap();
        r.search("t1", &q, &Projection::default()).await.unwrap();
        assert_eq!(inv.calls.load(Ordering::SeqCst), 1, "second read was cached");

        // different tenant → isolated entry → second transport call
        r.search("t2", &q, &Projection::default()).await.unwrap();
        assert_eq!(inv.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn breaker_opens_and_stops_invoking_the_transport() {
        let inv = Arc::new(FakeInventory {
            records: vec![],
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let r = AssetResolver::new(inv.clone(), 16, Duration::from_secs(60));
        let q = AssetQuery::default();

        for _ in 0..3 {
            let _ = r.count("t1", &q).await;
        }
        assert_eq!(inv.calls.load(Ordering::SeqCst), 3);

        let err = r.count("t1", &q).await.unwrap_err();
        assert_eq!(err.kind, ovs_schemas::ErrorKind::CircuitOpen);
        assert_eq!(
            inv.calls.load(Ordering::SeqCst),
            3,
            "open circuit must not touch the transport"
        );
    }

    #[tokio::test]
    async fn resolve_target_demands_exactly_one_match() {
        let inv = Arc::new(FakeInventory {
            records: vec![record("a", "staging", 1), record("b", "staging", 2)],
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let r = AssetResolver::new(inv, 16, Duration::from_secs(60));
        let err = r
            .resolve_target("t1", &AssetQuery::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ovs_schemas::ErrorKind::Conflict);
    }
}
