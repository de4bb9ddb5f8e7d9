//! Tool catalog service: the versioned registry behind Stage B and the step
//! dispatcher.
//!
//! Reads go through an in-process LRU cache (latest-version view only;
//! pinned-version reads bypass it). Writes and `reload` invalidate. The
//! cache is single-process by design — cross-process invalidation happens
//! via the explicit `POST /tools/reload` endpoint on each instance.

use std::time::Duration;

use ovs_schemas::{OvsError, Platform, ToolCategory, ToolSpec};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::info;

pub mod cache;

use cache::LruTtlCache;
use ovs_metrics::Metrics;

const CACHE_LABEL: &str = "catalog";

pub struct CatalogService {
    pool: PgPool,
    cache: Mutex<LruTtlCache<ToolSpec>>,
    metrics: &'static Metrics,
}

impl CatalogService {
    pub fn new(pool: PgPool, capacity: usize, ttl: Duration) -> Self {
        Self {
            pool,
            cache: Mutex::new(LruTtlCache::new(capacity, ttl)),
            metrics: Metrics::global(),
        }
    }

    /// Latest enabled version of a tool — the default read path, cached.
    ///
    /// # Errors
    /// `NOT_FOUND` when the tool does not exist or is disabled.
    pub async fn get_tool_by_name(&self, tool_name: &str) -> Result<ToolSpec, OvsError> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(spec) = cache.get(tool_name) {
                self.metrics.cache_hits.with_label_values(&[CACHE_LABEL]).inc();
                return Ok(spec);
            }
        }
        self.metrics
            .cache_misses
            .with_label_values(&[CACHE_LABEL])
            .inc();

        let row = ovs_db::catalog::get_latest(&self.pool, tool_name)
            .await?
            .filter(|r| r.enabled)
            .ok_or_else(|| OvsError::not_found(format!("no enabled tool named '{tool_name}'")))?;
        let spec = row.decode()?;

        let mut cache = self.cache.lock().await;
        cache.put(tool_name.to_string(), spec.clone());
        self.metrics
            .cache_entries
            .with_label_values(&[CACHE_LABEL])
            .set(cache.len() as i64);

        Ok(spec)
    }

    /// A pinned version; bypasses the cache.
    pub async fn get_tool_version(
        &self,
        tool_name: &str,
        version: i32,
    ) -> Result<ToolSpec, OvsError> {
        let row = ovs_db::catalog::get_version(&self.pool, tool_name, version)
            .await?
            .ok_or_else(|| {
                OvsError::not_found(format!("no tool '{tool_name}' at version {version}"))
            })?;
        row.decode()
    }

    /// Enabled latest-version tools whose capability set contains
    /// `capability` and whose platform serves `platform` (`None` = any),
    /// optionally narrowed by category.
    pub async fn get_tools_by_capability(
        &self,
        capability: &str,
        platform: Option<Platform>,
        category: Option<ToolCategory>,
    ) -> Result<Vec<ToolSpec>, OvsError> {
        let rows = ovs_db::catalog::list_latest(&self.pool, true).await?;
        let mut out = Vec::new();
        for row in rows {
            let spec = row.decode()?;
            if !spec.has_capability(capability) {
                continue;
            }
            if let Some(wanted) = platform {
                if !spec.platform.serves(wanted) {
                    continue;
                }
            }
            if let Some(cat) = category {
                if spec.category != cat {
                    continue;
                }
            }
            out.push(spec);
        }
        Ok(out)
    }

    /// Every latest-version tool, including disabled ones (admin view).
    pub async fn list_tools(&self) -> Result<Vec<ToolSpec>, OvsError> {
        let rows = ovs_db::catalog::list_latest(&self.pool, false).await?;
        rows.into_iter().map(|r| r.decode()).collect()
    }

    /// Store a new version and make it latest. The submitted spec's
    /// `version` field is ignored — versions are assigned monotonically here.
    ///
    /// # Errors
    /// `VALIDATION` when the spec names a pattern with no performance row.
    pub async fn put_tool(&self, spec: &ToolSpec) -> Result<i32, OvsError> {
        for pattern in spec.patterns.keys() {
            if !spec.performance_profile.contains_key(pattern) {
                return Err(OvsError::validation(format!(
                    "pattern '{pattern}' has no performance profile"
                )));
            }
        }

        let value = serde_json::to_value(spec)
            .map_err(|e| OvsError::internal(format!("tool spec does not serialize: {e}")))?;
        let version = ovs_db::catalog::put_tool(&self.pool, &spec.tool_name, &value).await?;

        self.cache.lock().await.invalidate(&spec.tool_name);
        info!(tool = %spec.tool_name, version, "tool spec stored");
        Ok(version)
    }

    /// Point latest back at an earlier version.
    pub async fn rollback(&self, tool_name: &str, version: i32) -> Result<(), OvsError> {
        let moved = ovs_db::catalog::rollback_to_version(&self.pool, tool_name, version).await?;
        if !moved {
            return Err(OvsError::not_found(format!(
                "no tool '{tool_name}' at version {version}"
            )));
        }
        self.cache.lock().await.invalidate(tool_name);
        info!(tool = tool_name, version, "tool spec rolled back");
        Ok(())
    }

    /// Hot reload: drop the whole cache so the next reads hit Postgres.
    pub async fn reload(&self) {
        let mut cache = self.cache.lock().await;
        cache.clear();
        self.metrics
            .cache_entries
            .with_label_values(&[CACHE_LABEL])
            .set(0);
        info!("catalog cache invalidated");
    }

    /// Enable or disable a tool across all versions.
    pub async fn set_enabled(&self, tool_name: &str, enabled: bool) -> Result<(), OvsError> {
        let n = ovs_db::catalog::set_enabled(&self.pool, tool_name, enabled).await?;
        if n == 0 {
            return Err(OvsError::not_found(format!("no tool named '{tool_name}'")));
        }
        self.cache.lock().await.invalidate(tool_name);
        Ok(())
    }
}
