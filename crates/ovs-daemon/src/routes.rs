//! Axum router and all HTTP handlers for ovs-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.
//!
//! The typed error taxonomy is rendered to the shared envelope here and
//! nowhere else.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use ovs_schemas::{ErrorKind, OvsError, ToolSpec, WireError};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;
use uuid::Uuid;

use crate::api_types::*;
use crate::state::{AppState, BusMsg};
use ovs_assets::client::AssetQuery;
use ovs_assets::Projection;
use ovs_engine::SubmitRequest;
use ovs_selector::features::SelectionContext;
use ovs_selector::SelectionRequest;

// ---------------------------------------------------------------------------
// Error rendering
// ---------------------------------------------------------------------------

/// Wrapper rendering `OvsError` into the wire envelope with the contract
/// status codes.
pub(crate) struct ApiError(pub OvsError);

impl From<OvsError> for ApiError {
    fn from(e: OvsError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Policy => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Duplicate | ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::CircuitOpen | ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(WireError::from(self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Tenant scoping: every public call names its tenant.
fn tenant_of(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError(OvsError::validation("missing X-Tenant-Id header")))
}

fn actor_of(headers: &HeaderMap) -> String {
    headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("operator")
        .to_string()
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
///
/// The `/internal/*` routes must never be exposed by the external gateway —
/// they are additionally defended by the internal-key check.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        // Execution API (public, tenant-scoped)
        .route("/executions", post(create_execution))
        .route("/executions/:id", get(get_execution))
        .route("/executions/:id/cancel", post(cancel_execution))
        .route("/executions/:id/events", get(list_events))
        .route("/approvals/:id/decide", post(decide_approval))
        // Selector observability
        .route("/selector/explain", post(selector_explain))
        // Asset-context façade (public, read-only)
        .route("/assets/count", get(assets_count))
        .route("/assets/search", get(assets_search))
        .route("/assets/connection-profile", get(assets_connection_profile))
        // Tool catalog (internal HTTP)
        .route("/tools", get(list_tools))
        .route("/tools/:name", get(get_tool))
        .route("/tools/:name", put(put_tool))
        .route("/tools/reload", post(reload_tools))
        // Dead-letter queue (internal only)
        .route("/internal/dlq", get(dlq_list))
        .route("/internal/dlq/stats", get(dlq_stats))
        .route("/internal/dlq/:id/requeue", post(dlq_requeue))
        // Secrets broker (internal only)
        .route(
            "/internal/secrets/credential-upsert",
            post(credential_upsert),
        )
        .route(
            "/internal/secrets/credential-lookup",
            post(credential_lookup),
        )
        .route(
            "/internal/secrets/handle-resolve",
            post(handle_resolve),
        )
        .route(
            "/internal/secrets/:host/:purpose",
            delete(credential_delete),
        )
        // SSE event feed
        .route("/v1/stream", get(stream))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /health, GET /metrics
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

pub(crate) async fn metrics(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.metrics.encode_text(),
    )
}

// ---------------------------------------------------------------------------
// POST /executions
// ---------------------------------------------------------------------------

pub(crate) async fn create_execution(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateExecutionRequest>,
) -> ApiResult<Response> {
    let tenant_id = tenant_of(&headers)?;

    let resp = st
        .engine
        .submit(SubmitRequest {
            tenant_id,
            actor_id: body.actor,
            plan: body.plan,
            target: body.target,
            preferences: body.preferences.unwrap_or_default(),
        })
        .await?;

    let _ = st.bus.send(BusMsg::ExecutionEvent {
        execution_id: resp.execution_id,
        kind: "EXECUTION_CREATED".to_string(),
        seq: 0,
    });

    // 201 on create, 200 on idempotency replay.
    let code = if resp.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    let body = ExecutionCreatedResponse {
        execution_id: resp.execution_id,
        status: resp.status,
        mode: resp.mode,
        approval_id: resp.approval_id,
        retry_after: resp.retry_after,
    };
    Ok((code, Json(body)).into_response())
}

// ---------------------------------------------------------------------------
// GET /executions/{id}
// ---------------------------------------------------------------------------

pub(crate) async fn get_execution(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionView>> {
    let tenant_id = tenant_of(&headers)?;

    let row = ovs_db::executions::fetch_execution(&st.pool, &tenant_id, id)
        .await?
        .ok_or_else(|| ApiError(OvsError::not_found(format!("no execution {id}"))))?;
    let steps = ovs_db::steps::fetch_steps(&st.pool, id).await?;

    Ok(Json(ExecutionView {
        execution_id: row.execution_id,
        status: row.status,
        mode: row.mode,
        sla_class: row.sla_class,
        action_class: row.action_class,
        attempt_count: row.attempt_count,
        results: row.results,
        started_at: row.started_at,
        ended_at: row.ended_at,
        created_at: row.created_at,
        steps: steps
            .into_iter()
            .map(|s| StepView {
                ordinal: s.ordinal,
                tool_name: s.tool_name,
                status: s.status,
                result: s.result,
                error: s.error,
                attempt: s.attempt,
                started_at: s.started_at,
                ended_at: s.ended_at,
            })
            .collect(),
    }))
}

// ---------------------------------------------------------------------------
// POST /executions/{id}/cancel
// ---------------------------------------------------------------------------

pub(crate) async fn cancel_execution(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelRequest>,
) -> ApiResult<Json<CancelResponse>> {
    let tenant_id = tenant_of(&headers)?;
    let status = st.engine.cancel(&tenant_id, id, &body.reason).await?;
    info!(execution_id = %id, "cancel requested");
    Ok(Json(CancelResponse {
        execution_id: id,
        status,
    }))
}

// ---------------------------------------------------------------------------
// POST /approvals/{id}/decide
// ---------------------------------------------------------------------------

pub(crate) async fn decide_approval(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<DecideRequest>,
) -> ApiResult<Json<ExecutionCreatedResponse>> {
    let tenant_id = tenant_of(&headers)?;
    let actor = actor_of(&headers);

    let approve = match body.decision.as_str() {
        "APPROVED" => true,
        "REJECTED" => false,
        other => {
            return Err(ApiError(OvsError::validation(format!(
                "decision must be APPROVED or REJECTED, got '{other}'"
            ))))
        }
    };

    let resp = st
        .engine
        .decide(&tenant_id, id, approve, &actor, body.reason.as_deref())
        .await?;

    Ok(Json(ExecutionCreatedResponse {
        execution_id: resp.execution_id,
        status: resp.status,
        mode: resp.mode,
        approval_id: resp.approval_id,
        retry_after: None,
    }))
}

// ---------------------------------------------------------------------------
// GET /executions/{id}/events?since=<cursor>
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
pub(crate) struct EventsQuery {
    #[serde(default = "default_since")]
    since: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_since() -> i64 {
    -1
}

fn default_limit() -> i64 {
    200
}

pub(crate) async fn list_events(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(q): Query<EventsQuery>,
) -> ApiResult<Json<EventsPage>> {
    let tenant_id = tenant_of(&headers)?;

    let rows =
        ovs_db::events::list_events(&st.pool, &tenant_id, id, q.since, q.limit.clamp(1, 500))
            .await?;
    let cursor = rows.last().map(|e| e.seq).unwrap_or(q.since);

    Ok(Json(EventsPage {
        events: rows
            .into_iter()
            .map(|e| EventView {
                seq: e.seq,
                ts: e.ts,
                kind: e.kind,
                payload: e.payload,
            })
            .collect(),
        cursor,
    }))
}

// ---------------------------------------------------------------------------
// POST /selector/explain
// ---------------------------------------------------------------------------

pub(crate) async fn selector_explain(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ExplainRequest>,
) -> ApiResult<Json<ovs_selector::SelectionOutcome>> {
    let candidates: Vec<ToolSpec> = st
        .catalog
        .get_tools_by_capability(&body.capability, body.platform, None)
        .await?;

    let outcome = st
        .selector
        .select(&SelectionRequest {
            intent: body.intent,
            mode: body.mode.unwrap_or_default(),
            environment: body.environment.unwrap_or_else(|| "unknown".to_string()),
            actor_permissions: body.permissions.into_iter().collect(),
            context: SelectionContext {
                n: body.entity_count.unwrap_or(1.0),
                ..Default::default()
            },
            candidates,
        })
        .await?;

    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// Asset-context façade
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize, Default)]
pub(crate) struct AssetsQueryParams {
    asset_id: Option<String>,
    search: Option<String>,
    os_type: Option<String>,
    service_type: Option<String>,
    environment: Option<String>,
    is_active: Option<bool>,
    limit: Option<u32>,
    /// Comma-separated projection override.
    fields: Option<String>,
}

impl AssetsQueryParams {
    fn query(&self) -> AssetQuery {
        AssetQuery {
            asset_id: self.asset_id.clone(),
            search: self.search.clone(),
            os_type: self.os_type.clone(),
            service_type: self.service_type.clone(),
            environment: self.environment.clone(),
            is_active: self.is_active,
            limit: self.limit,
        }
    }

    fn projection(&self) -> Projection {
        match &self.fields {
            Some(f) if !f.trim().is_empty() => {
                Projection(f.split(',').map(|s| s.trim().to_string()).collect())
            }
            _ => Projection::default(),
        }
    }
}

pub(crate) async fn assets_count(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<AssetsQueryParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let tenant_id = tenant_of(&headers)?;
    let count = st.resolver.count(&tenant_id, &params.query()).await?;
    Ok(Json(json!({
        "count": count,
        "updated_at": chrono::Utc::now(),
    })))
}

pub(crate) async fn assets_search(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<AssetsQueryParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let tenant_id = tenant_of(&headers)?;
    let projection = params.projection();
    let answer = st
        .resolver
        .search_and_disambiguate(&tenant_id, &params.query(), &projection)
        .await?;
    Ok(Json(json!({
        "result": answer,
        "updated_at": chrono::Utc::now(),
    })))
}

#[derive(serde::Deserialize)]
pub(crate) struct ProfileQuery {
    host: String,
}

pub(crate) async fn assets_connection_profile(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<ProfileQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let tenant_id = tenant_of(&headers)?;
    let profile = st
        .resolver
        .connection_profile(&tenant_id, &q.host)
        .await?
        .ok_or_else(|| {
            ApiError(OvsError::not_found(format!(
                "no connection profile for host '{}'",
                q.host
            )))
        })?;
    Ok(Json(json!({
        "profile": profile,
        "updated_at": chrono::Utc::now(),
    })))
}

// ---------------------------------------------------------------------------
// Tool catalog (internal HTTP)
// ---------------------------------------------------------------------------

pub(crate) async fn list_tools(
    State(st): State<Arc<AppState>>,
) -> ApiResult<Json<ToolListResponse>> {
    let tools = st.catalog.list_tools().await?;
    Ok(Json(ToolListResponse { tools }))
}

pub(crate) async fn get_tool(
    State(st): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<ToolSpec>> {
    Ok(Json(st.catalog.get_tool_by_name(&name).await?))
}

pub(crate) async fn put_tool(
    State(st): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(spec): Json<ToolSpec>,
) -> ApiResult<Json<ToolPutResponse>> {
    if spec.tool_name != name {
        return Err(ApiError(OvsError::validation(format!(
            "path tool '{name}' does not match body tool '{}'",
            spec.tool_name
        ))));
    }
    let version = st.catalog.put_tool(&spec).await?;
    Ok(Json(ToolPutResponse {
        tool_name: name,
        version,
    }))
}

pub(crate) async fn reload_tools(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    st.catalog.reload().await;
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Dead-letter queue (internal only)
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
pub(crate) struct DlqListQuery {
    #[serde(default)]
    offset: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

pub(crate) async fn dlq_list(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<DlqListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    internal_gate(&st, &headers)?;
    let items = st.dlq.list(q.limit, q.offset).await?;
    Ok(Json(json!({
        "items": items.iter().map(|i| json!({
            "item_id": i.item_id,
            "execution_id": i.execution_id,
            "tenant_id": i.tenant_id,
            "attempt": i.attempt,
            "max_attempts": i.max_attempts,
            "failure_reason": i.failure_reason,
            "dead_at": i.dead_at,
        })).collect::<Vec<_>>(),
    })))
}

pub(crate) async fn dlq_stats(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<ovs_queue::DlqStats>> {
    internal_gate(&st, &headers)?;
    Ok(Json(st.dlq.stats().await?))
}

#[derive(serde::Deserialize)]
pub(crate) struct DlqRequeueBody {
    #[serde(default)]
    reset_attempt: bool,
}

pub(crate) async fn dlq_requeue(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<DlqRequeueBody>,
) -> ApiResult<StatusCode> {
    internal_gate(&st, &headers)?;
    st.dlq.requeue(id, body.reset_attempt).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Secrets broker (internal only)
// ---------------------------------------------------------------------------

/// Internal-key gate. Absence and mismatch are both rendered as 404 so the
/// endpoint does not confirm its own existence to probes.
fn internal_gate(st: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers.get("x-internal-key").and_then(|v| v.to_str().ok());
    if st.broker.internal_key_matches(provided) {
        Ok(())
    } else {
        Err(ApiError(OvsError::not_found("not found")))
    }
}

pub(crate) async fn credential_upsert(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CredentialUpsertRequest>,
) -> ApiResult<StatusCode> {
    internal_gate(&st, &headers)?;
    let actor = actor_of(&headers);
    st.broker
        .upsert(
            &actor,
            &body.host,
            &body.purpose,
            &body.username,
            &body.password,
            body.domain.clone(),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn credential_lookup(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CredentialLookupRequest>,
) -> ApiResult<Json<CredentialLookupResponse>> {
    internal_gate(&st, &headers)?;
    let actor = actor_of(&headers);
    let lease = st.broker.lookup(&actor, &body.host, &body.purpose).await?;
    Ok(Json(CredentialLookupResponse {
        handle: lease.handle,
        username: lease.username,
        domain: lease.domain,
    }))
}

#[derive(serde::Deserialize)]
pub(crate) struct HandleResolveBody {
    handle: String,
}

/// Just-in-time handle resolution for the automation worker. Single use:
/// a handle resolves at most once, and unknown / expired / consumed handles
/// are indistinguishable. This is the only place plaintext crosses a wire,
/// and only inside the internal network.
pub(crate) async fn handle_resolve(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<HandleResolveBody>,
) -> ApiResult<Json<serde_json::Value>> {
    internal_gate(&st, &headers)?;
    let cred = st
        .broker
        .resolve_handle(&body.handle)
        .await
        .ok_or_else(|| ApiError(OvsError::not_found("not found")))?;
    Ok(Json(json!({
        "host": cred.host,
        "purpose": cred.purpose,
        "username": cred.username,
        "password": cred.password,
        "domain": cred.domain,
    })))
}

pub(crate) async fn credential_delete(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((host, purpose)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    internal_gate(&st, &headers)?;
    let actor = actor_of(&headers);
    st.broker.delete(&actor, &host, &purpose).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// GET /v1/stream — SSE feed
// ---------------------------------------------------------------------------

pub(crate) async fn stream(
    State(st): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = st.bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(bus_msg) => {
                let event = Event::default()
                    .json_data(&bus_msg)
                    .unwrap_or_else(|_| Event::default().data("serialization error"));
                Some(Ok(event))
            }
            // Lagged receivers skip missed messages rather than erroring.
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
