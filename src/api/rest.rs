// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. `health` is public; every other
// endpoint requires the service bearer token (see `ServiceToken`). Endpoints
// that open or close a signal additionally act on behalf of the requester
// named in the `X-Requester-Key` header (see `Requester`).
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::{Requester, ServiceToken};
use crate::api::ApiError;
use crate::app_state::AppState;
use crate::error::Rejection;
use crate::types::Signal;
use crate::watcher::WatchPhase;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_DECISION_LIMIT: usize = 20;
const MAX_LIMIT: usize = 500;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Read-only (token) ───────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/signals/active", get(active_signals))
        .route("/api/v1/signals/history", get(history))
        .route("/api/v1/signals/:id", get(signal_detail))
        .route("/api/v1/decisions", get(decisions))
        // ── Gated (token + requester) ───────────────────────────────
        .route("/api/v1/signals", post(request_signal))
        .route("/api/v1/signals/:id/close", post(close_signal))
        // ── WebSocket event feed ────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn or(&self, default: usize) -> usize {
        self.limit.unwrap_or(default).min(MAX_LIMIT)
    }
}

// =============================================================================
// Health & status
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active_signals: usize,
    watch_tasks: usize,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        active_signals: state.store.list_active().len(),
        watch_tasks: state.scheduler.running_count(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

async fn status(_auth: ServiceToken, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.status())
}

// =============================================================================
// Signal queries
// =============================================================================

#[derive(Deserialize)]
struct ActiveQuery {
    owner: Option<String>,
    instrument: Option<String>,
}

async fn active_signals(
    _auth: ServiceToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActiveQuery>,
) -> impl IntoResponse {
    let instrument = query.instrument.map(|s| s.to_uppercase());
    let signals: Vec<Signal> = state
        .store
        .list_active()
        .into_iter()
        .filter(|s| query.owner.as_deref().map_or(true, |o| s.owner_key == o))
        .filter(|s| instrument.as_deref().map_or(true, |i| s.instrument_key == i))
        .collect();
    Json(signals)
}

async fn history(
    _auth: ServiceToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.store.history(query.or(DEFAULT_HISTORY_LIMIT)))
}

#[derive(Serialize)]
struct SignalView {
    #[serde(flatten)]
    signal: Signal,
    watching: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    watch_phase: Option<WatchPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_price: Option<f64>,
}

async fn signal_detail(
    _auth: ServiceToken,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SignalView>, ApiError> {
    let signal = state
        .store
        .get(&id)
        .ok_or_else(|| Rejection::UnknownSignal(id.clone()))?;
    Ok(Json(SignalView {
        signal,
        watching: state.scheduler.is_watching(&id),
        watch_phase: state.scheduler.phase(&id),
        last_price: state.scheduler.last_price(&id),
    }))
}

async fn decisions(
    _auth: ServiceToken,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.gateway.recent_decisions(query.or(DEFAULT_DECISION_LIMIT)))
}

// =============================================================================
// Gated operations
// =============================================================================

#[derive(Deserialize)]
struct SignalRequest {
    instrument: String,
}

async fn request_signal(
    _auth: ServiceToken,
    Requester(requester): Requester,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let signal = state.gateway.request_signal(&requester, &req.instrument).await?;
    info!(requester = %requester, id = %signal.id, "signal issued via API");
    Ok((StatusCode::CREATED, Json(signal)))
}

async fn close_signal(
    _auth: ServiceToken,
    Requester(requester): Requester,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Signal>, ApiError> {
    let signal = state.gateway.request_manual_close(&id, &requester).await?;
    Ok(Json(signal))
}

// =============================================================================
// Tests
// =============================================================================
