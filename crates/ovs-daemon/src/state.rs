//! Shared runtime state for ovs-daemon.
//!
//! All types here are `Clone`-able (via `Arc` or copy). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::broadcast;

use ovs_assets::AssetResolver;
use ovs_audit::{EventWriter, LogMasker};
use ovs_catalog::CatalogService;
use ovs_config::RuntimeConfig;
use ovs_engine::ExecutionEngine;
use ovs_metrics::Metrics;
use ovs_queue::DlqHandler;
use ovs_secrets::SecretsBroker;
use ovs_selector::Selector;

// ---------------------------------------------------------------------------
// BusMsg — SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE
/// events. Execution events are re-broadcast here after masking.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    ExecutionEvent { execution_id: uuid::Uuid, kind: String, seq: i64 },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses and `build_info`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub cfg: RuntimeConfig,
    pub build: BuildInfo,
    pub engine: Arc<ExecutionEngine>,
    pub catalog: Arc<CatalogService>,
    pub resolver: Arc<AssetResolver>,
    pub selector: Arc<Selector>,
    pub broker: Arc<SecretsBroker>,
    pub dlq: DlqHandler,
    pub events: EventWriter,
    pub masker: LogMasker,
    pub bus: broadcast::Sender<BusMsg>,
    pub metrics: &'static Metrics,
}

impl AppState {
    pub fn bus_channel() -> (broadcast::Sender<BusMsg>, broadcast::Receiver<BusMsg>) {
        broadcast::channel::<BusMsg>(1024)
    }
}

/// Spawn a background task that emits a heartbeat SSE message every
/// `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
