//! Process-wide metrics registry.
//!
//! The registry is one of the few process singletons (alongside the DB pool,
//! the two caches, and the logger) and has an explicit `init` — call
//! [`Metrics::global`] once at startup and pass the handle down, or let
//! lazy init kick in for tests.

use std::sync::OnceLock;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

static GLOBAL: OnceLock<Metrics> = OnceLock::new();

/// Typed handles for every metric the core emits. Cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub requests_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub selector_requests_total: IntCounterVec,
    pub db_errors_total: IntCounter,
    pub cache_hits: IntCounterVec,
    pub cache_misses: IntCounterVec,
    pub dlq_items_total: IntCounter,
    pub approvals_total: IntCounterVec,
    pub secrets_lookups_total: IntCounterVec,

    pub request_duration_seconds: HistogramVec,
    pub selector_request_duration_seconds: HistogramVec,

    pub cache_entries: IntGaugeVec,
    pub lease_holders: IntGauge,
    pub queue_depth: IntGaugeVec,
    pub build_info: IntGaugeVec,
}

impl Metrics {
    /// Build a fresh registry. Tests use this to avoid cross-test bleed;
    /// production code goes through [`Metrics::global`].
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Executions submitted, by outcome and tool"),
            &["status", "tool"],
        )
        .expect("metric opts");
        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "Step and engine errors, by reason and tool"),
            &["reason", "tool"],
        )
        .expect("metric opts");
        let selector_requests_total = IntCounterVec::new(
            Opts::new(
                "selector_requests_total",
                "Stage B selections, by outcome and decision source",
            ),
            &["status", "source"],
        )
        .expect("metric opts");
        let db_errors_total =
            IntCounter::new("db_errors_total", "Database round-trips that failed").expect("metric");
        let cache_hits = IntCounterVec::new(
            Opts::new("cache_hits", "Cache hits, by cache"),
            &["cache"],
        )
        .expect("metric opts");
        let cache_misses = IntCounterVec::new(
            Opts::new("cache_misses", "Cache misses, by cache"),
            &["cache"],
        )
        .expect("metric opts");
        let dlq_items_total =
            IntCounter::new("dlq_items_total", "Items moved to the dead-letter queue")
                .expect("metric");
        let approvals_total = IntCounterVec::new(
            Opts::new("approvals_total", "Approval decisions, by decision"),
            &["decision"],
        )
        .expect("metric opts");
        let secrets_lookups_total = IntCounterVec::new(
            Opts::new("secrets_lookups_total", "Credential broker lookups, by outcome"),
            &["outcome"],
        )
        .expect("metric opts");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "request_duration_seconds",
                "End-to-end execution duration, by tool",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["tool"],
        )
        .expect("metric opts");
        let selector_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "selector_request_duration_seconds",
                "Stage B selection latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
            &["source"],
        )
        .expect("metric opts");

        let cache_entries = IntGaugeVec::new(
            Opts::new("cache_entries", "Live entries, by cache"),
            &["cache"],
        )
        .expect("metric opts");
        let lease_holders =
            IntGauge::new("lease_holders", "Live mutex leases").expect("metric");
        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Visible queue depth, by SLA class"),
            &["sla"],
        )
        .expect("metric opts");
        let build_info = IntGaugeVec::new(
            Opts::new("build_info", "Static build metadata (value is always 1)"),
            &["service", "version"],
        )
        .expect("metric opts");

        for c in [
            &requests_total,
            &errors_total,
            &selector_requests_total,
            &cache_hits,
            &cache_misses,
            &approvals_total,
            &secrets_lookups_total,
        ] {
            registry.register(Box::new(c.clone())).expect("register");
        }
        registry
            .register(Box::new(db_errors_total.clone()))
            .expect("register");
        registry
            .register(Box::new(dlq_items_total.clone()))
            .expect("register");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register");
        registry
            .register(Box::new(selector_request_duration_seconds.clone()))
            .expect("register");
        for g in [&cache_entries, &queue_depth, &build_info] {
            registry.register(Box::new(g.clone())).expect("register");
        }
        registry
            .register(Box::new(lease_holders.clone()))
            .expect("register");

        Self {
            registry,
            requests_total,
            errors_total,
            selector_requests_total,
            db_errors_total,
            cache_hits,
            cache_misses,
            dlq_items_total,
            approvals_total,
            secrets_lookups_total,
            request_duration_seconds,
            selector_request_duration_seconds,
            cache_entries,
            lease_holders,
            queue_depth,
            build_info,
        }
    }

    /// The process-wide instance.
    pub fn global() -> &'static Metrics {
        GLOBAL.get_or_init(Metrics::new)
    }

    /// Record build metadata; call once at startup.
    pub fn set_build_info(&self, service: &str, version: &str) {
        self.build_info.with_label_values(&[service, version]).set(1);
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .expect("text encoding must not fail");
        String::from_utf8(buf).expect("prometheus text output is utf-8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_text_output() {
        let m = Metrics::new();
        m.requests_total
            .with_label_values(&["SUCCEEDED", "asset_search"])
            .inc();
        m.set_build_info("ovs-daemon", "0.0.1");
        let text = m.encode_text();
        assert!(text.contains("requests_total"));
        assert!(text.contains("asset_search"));
        assert!(text.contains("build_info"));
    }

    #[test]
    fn histogram_buckets_match_contract() {
        let m = Metrics::new();
        m.request_duration_seconds
            .with_label_values(&["restart_service"])
            .observe(0.3);
        let text = m.encode_text();
        assert!(text.contains("le=\"0.25\""));
        assert!(text.contains("le=\"60\""));
    }

    #[test]
    fn global_is_a_singleton() {
        let a = Metrics::global() as *const _;
        let b = Metrics::global() as *const _;
        assert_eq!(a, b);
    }
}
