//! Runtime configuration for the Overseer daemon and workers.
//!
//! This module is the single source of truth for environment resolution.
//!
//! # Contract
//! - All recognized options are environment variables; there is no config
//!   file layer.
//! - Callers invoke [`RuntimeConfig::from_env`] once at startup and pass the
//!   struct into constructors; never scatter `std::env::var` calls across
//!   the codebase.
//! - `Debug` impls on secret-carrying structs redact values.
//! - Error messages reference the env var NAME, never the value.

use std::time::Duration;

use anyhow::{bail, Context, Result};

pub mod keys;

pub use keys::ResolvedKeys;

pub const ENV_DB_URL: &str = "OVS_DATABASE_URL";
pub const ENV_DAEMON_ADDR: &str = "OVS_DAEMON_ADDR";

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// All recognized runtime options with their defaults applied.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Idempotency scope in hours.
    pub dedup_window_hours: u64,

    /// Per-step timeout by SLA class, milliseconds.
    pub sla_fast_step_timeout_ms: u64,
    pub sla_medium_step_timeout_ms: u64,
    pub sla_long_step_timeout_ms: u64,
    /// Whole-execution timeout by SLA class, milliseconds.
    pub sla_fast_total_timeout_ms: u64,
    pub sla_medium_total_timeout_ms: u64,
    pub sla_long_total_timeout_ms: u64,

    pub queue_lease_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub reaper_interval_seconds: u64,

    pub workers_min: usize,
    pub workers_max: usize,

    pub catalog_cache_size: usize,
    pub catalog_cache_ttl_seconds: u64,
    pub asset_cache_size: usize,
    pub asset_cache_ttl_seconds: u64,

    pub selector_ambiguity_epsilon: f64,
    pub selector_llm_timeout_ms: u64,

    /// Queue depth above which IMMEDIATE submits are shed or downgraded.
    pub backpressure_queue_depth: i64,

    /// External collaborators (interface-only).
    pub inventory_base_url: String,
    pub automation_base_url: String,
    pub selector_llm_url: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dedup_window_hours: 24,
            sla_fast_step_timeout_ms: 15_000,
            sla_medium_step_timeout_ms: 60_000,
            sla_long_step_timeout_ms: 300_000,
            sla_fast_total_timeout_ms: 30_000,
            sla_medium_total_timeout_ms: 300_000,
            sla_long_total_timeout_ms: 1_800_000,
            queue_lease_seconds: 30,
            heartbeat_interval_seconds: 10,
            reaper_interval_seconds: 15,
            workers_min: 2,
            workers_max: 16,
            catalog_cache_size: 1000,
            catalog_cache_ttl_seconds: 300,
            asset_cache_size: 128,
            asset_cache_ttl_seconds: 120,
            selector_ambiguity_epsilon: 0.08,
            selector_llm_timeout_ms: 800,
            backpressure_queue_depth: 500,
            inventory_base_url: "http://127.0.0.1:8710".to_string(),
            automation_base_url: "http://127.0.0.1:8720".to_string(),
            selector_llm_url: None,
        }
    }
}

impl RuntimeConfig {
    /// Resolve all options from the environment, applying defaults for
    /// anything unset.
    ///
    /// # Errors
    /// Fails on unparseable values (the env var name is reported) and on
    /// inconsistent bounds (`WORKERS_MIN` > `WORKERS_MAX`).
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let cfg = Self {
            dedup_window_hours: env_u64("DEDUP_WINDOW_HOURS", d.dedup_window_hours)?,
            sla_fast_step_timeout_ms: env_u64(
                "SLA_FAST_STEP_TIMEOUT_MS",
                d.sla_fast_step_timeout_ms,
            )?,
            sla_medium_step_timeout_ms: env_u64(
                "SLA_MEDIUM_STEP_TIMEOUT_MS",
                d.sla_medium_step_timeout_ms,
            )?,
            sla_long_step_timeout_ms: env_u64(
                "SLA_LONG_STEP_TIMEOUT_MS",
                d.sla_long_step_timeout_ms,
            )?,
            sla_fast_total_timeout_ms: env_u64(
                "SLA_FAST_TOTAL_TIMEOUT_MS",
                d.sla_fast_total_timeout_ms,
            )?,
            sla_medium_total_timeout_ms: env_u64(
                "SLA_MEDIUM_TOTAL_TIMEOUT_MS",
                d.sla_medium_total_timeout_ms,
            )?,
            sla_long_total_timeout_ms: env_u64(
                "SLA_LONG_TOTAL_TIMEOUT_MS",
                d.sla_long_total_timeout_ms,
            )?,
            queue_lease_seconds: env_u64("QUEUE_LEASE_SECONDS", d.queue_lease_seconds)?,
            heartbeat_interval_seconds: env_u64(
                "HEARTBEAT_INTERVAL_SECONDS",
                d.heartbeat_interval_seconds,
            )?,
            reaper_interval_seconds: env_u64("REAPER_INTERVAL_SECONDS", d.reaper_interval_seconds)?,
            workers_min: env_usize("WORKERS_MIN", d.workers_min)?,
            workers_max: env_usize("WORKERS_MAX", d.workers_max)?,
            catalog_cache_size: env_usize("CATALOG_CACHE_SIZE", d.catalog_cache_size)?,
            catalog_cache_ttl_seconds: env_u64(
                "CATALOG_CACHE_TTL_SECONDS",
                d.catalog_cache_ttl_seconds,
            )?,
            asset_cache_size: env_usize("ASSET_CACHE_SIZE", d.asset_cache_size)?,
            asset_cache_ttl_seconds: env_u64("ASSET_CACHE_TTL_SECONDS", d.asset_cache_ttl_seconds)?,
            selector_ambiguity_epsilon: env_f64(
                "SELECTOR_AMBIGUITY_EPSILON",
                d.selector_ambiguity_epsilon,
            )?,
            selector_llm_timeout_ms: env_u64("SELECTOR_LLM_TIMEOUT_MS", d.selector_llm_timeout_ms)?,
            backpressure_queue_depth: env_u64(
                "BACKPRESSURE_QUEUE_DEPTH",
                d.backpressure_queue_depth as u64,
            )? as i64,
            inventory_base_url: env_str("INVENTORY_BASE_URL", &d.inventory_base_url),
            automation_base_url: env_str("AUTOMATION_BASE_URL", &d.automation_base_url),
            selector_llm_url: env_opt("SELECTOR_LLM_URL"),
        };

        if cfg.workers_min > cfg.workers_max {
            bail!(
                "CONFIG_INVALID: WORKERS_MIN ({}) exceeds WORKERS_MAX ({})",
                cfg.workers_min,
                cfg.workers_max
            );
        }
        if cfg.workers_min == 0 {
            bail!("CONFIG_INVALID: WORKERS_MIN must be at least 1");
        }

        Ok(cfg)
    }

    pub fn queue_lease(&self) -> Duration {
        Duration::from_secs(self.queue_lease_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.dedup_window_hours as i64)
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_str(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_opt(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<u64>()
            .with_context(|| format!("env var {name} is not a valid integer")),
        _ => Ok(default),
    }
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    Ok(env_u64(name, default as u64)? as usize)
}

fn env_f64(name: &str, default: f64) -> Result<f64> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<f64>()
            .with_context(|| format!("env var {name} is not a valid number")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recognized_options() {
        let d = RuntimeConfig::default();
        assert_eq!(d.dedup_window_hours, 24);
        assert_eq!(d.queue_lease_seconds, 30);
        assert_eq!(d.heartbeat_interval_seconds, 10);
        assert_eq!(d.reaper_interval_seconds, 15);
        assert_eq!(d.workers_min, 2);
        assert_eq!(d.workers_max, 16);
        assert_eq!(d.catalog_cache_size, 1000);
        assert_eq!(d.asset_cache_size, 128);
        assert_eq!(d.asset_cache_ttl_seconds, 120);
        assert!((d.selector_ambiguity_epsilon - 0.08).abs() < f64::EPSILON);
        assert_eq!(d.selector_llm_timeout_ms, 800);
    }
}
