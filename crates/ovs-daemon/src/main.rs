//! ovs-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, builds the shared
//! state and the worker pool, wires middleware, and starts the HTTP server.
//! All route handlers live in `routes.rs`; all shared state types live in
//! `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use ovs_daemon::{routes, state};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use ovs_assets::client::HttpInventoryClient;
use ovs_assets::AssetResolver;
use ovs_audit::{EventWriter, LogMasker};
use ovs_catalog::CatalogService;
use ovs_config::{ResolvedKeys, RuntimeConfig, ENV_DAEMON_ADDR};
use ovs_engine::{EngineDeps, ExecutionEngine, HandlerRegistry, HttpAutomationClient};
use ovs_metrics::Metrics;
use ovs_queue::{spawn_queue_reaper, DlqHandler, QueueManager, WorkerPool, WorkerPoolConfig};
use ovs_safety::rbac::{RbacValidator, StaticPolicyProvider};
use ovs_safety::{spawn_lock_reaper, CancellationManager, CleanupRegistry, GuardPipeline};
use ovs_secrets::SecretsBroker;
use ovs_selector::tiebreak::HttpTieBreaker;
use ovs_selector::Selector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = RuntimeConfig::from_env().context("runtime config")?;
    let keys = ResolvedKeys::from_env().context("required key material")?;

    let pool = ovs_db::connect_from_env()
        .await
        .context("database connection")?;
    ovs_db::migrate(&pool).await.context("database migration")?;

    let metrics = Metrics::global();
    metrics.set_build_info("ovs-daemon", env!("CARGO_PKG_VERSION"));

    // Shared singletons: masker, event writer, caches, broker.
    let masker = LogMasker::standard();
    let events = EventWriter::new(pool.clone(), masker.clone());

    let catalog = Arc::new(CatalogService::new(
        pool.clone(),
        cfg.catalog_cache_size,
        Duration::from_secs(cfg.catalog_cache_ttl_seconds),
    ));
    let resolver = Arc::new(AssetResolver::new(
        Arc::new(HttpInventoryClient::new(cfg.inventory_base_url.clone())),
        cfg.asset_cache_size,
        Duration::from_secs(cfg.asset_cache_ttl_seconds),
    ));
    let broker = Arc::new(SecretsBroker::new(
        pool.clone(),
        keys.kms_master_key.clone(),
        keys.internal_key.clone(),
    ));

    let tie_breaker = cfg.selector_llm_url.clone().map(|url| {
        Box::new(HttpTieBreaker::new(
            url,
            Duration::from_millis(cfg.selector_llm_timeout_ms),
        )) as Box<dyn ovs_selector::tiebreak::TieBreaker>
    });
    let selector = Arc::new(Selector::new(
        cfg.selector_ambiguity_epsilon,
        Duration::from_millis(cfg.selector_llm_timeout_ms),
        tie_breaker,
    ));

    // Safety wiring. The policy provider is the in-process one until an
    // external policy service is configured; deny-by-default either way.
    let validator = Arc::new(RbacValidator::new(Box::new(StaticPolicyProvider::new())));
    let cancellations = Arc::new(CancellationManager::new());
    let pipeline = GuardPipeline::standard(
        pool.clone(),
        chrono::Duration::seconds(cfg.queue_lease_seconds as i64),
        broker.clone(),
        validator,
        events.clone(),
    );

    let automation = Arc::new(HttpAutomationClient::new(cfg.automation_base_url.clone()));
    let handlers = HandlerRegistry::standard(resolver.clone(), automation);

    let engine = Arc::new(ExecutionEngine::new(EngineDeps {
        pool: pool.clone(),
        cfg: cfg.clone(),
        catalog: catalog.clone(),
        resolver: resolver.clone(),
        handlers,
        pipeline,
        cancellations: cancellations.clone(),
        cleanup: CleanupRegistry::new(),
        events: events.clone(),
        selector: selector.clone(),
    }));

    // Background machinery: workers, queue reaper, lock reaper, heartbeat.
    let shutdown = CancellationToken::new();
    let queue = QueueManager::new(pool.clone(), cfg.queue_lease());
    let pool_handle = WorkerPool::start(
        queue.clone(),
        engine.clone(),
        cancellations.clone(),
        WorkerPoolConfig {
            min_workers: cfg.workers_min,
            max_workers: cfg.workers_max,
            heartbeat_interval: cfg.heartbeat_interval(),
        },
    );
    spawn_queue_reaper(queue.clone(), cfg.reaper_interval(), shutdown.clone());
    spawn_lock_reaper(pool.clone(), cfg.reaper_interval(), shutdown.clone());

    let (bus, _rx) = state::AppState::bus_channel();
    state::spawn_heartbeat(bus.clone(), Duration::from_secs(1));

    let shared = Arc::new(state::AppState {
        pool: pool.clone(),
        cfg: cfg.clone(),
        build: state::BuildInfo {
            service: "ovs-daemon",
            version: env!("CARGO_PKG_VERSION"),
        },
        engine,
        catalog,
        resolver,
        selector,
        broker,
        dlq: DlqHandler::new(pool.clone()),
        events,
        masker,
        bus,
        metrics,
    });

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8780)));
    info!("ovs-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    // Stop background machinery after the listener drains.
    shutdown.cancel();
    pool_handle.shutdown().await;
    info!("ovs-daemon stopped");

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var(ENV_DAEMON_ADDR).ok()?.parse().ok()
}

/// SIGINT / SIGTERM both trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
