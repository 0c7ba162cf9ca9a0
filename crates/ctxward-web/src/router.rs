//! Route tables for the four listeners §6 describes: telemetry ingest, the
//! JSON/SSE API, health probes, and Prometheus exposition. Split into
//! separate `Router`s (rather than one router on one port) so a slow
//! `/v1/metrics` client can't starve a liveness probe, and so operators can
//! put different network policy in front of ingest than the dashboard API.

use crate::sse::SseHub;
use crate::state::AppState;
use crate::{api, health, ingest, metrics};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::Router;
use std::convert::Infallible;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

fn cors() -> CorsLayer {
    CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
}

/// C1: `POST /v1/metrics`. §5 gives ingestion requests a 5s deadline.
pub fn ingest_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/metrics", post(ingest::ingest_metrics))
        .layer(TimeoutLayer::new(Duration::from_secs(5)))
        .layer(cors())
        .with_state(state)
}

async fn sse_handler(
    state: axum::extract::State<AppState>,
    headers: axum::http::HeaderMap,
) -> Sse<impl futures::stream::Stream<Item = Result<Event, Infallible>>> {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    Sse::new(state.sse.stream(last_event_id)).keep_alive(SseHub::keep_alive())
}

/// C8: JSON session API plus `GET /events` (SSE). The 30s handshake
/// deadline (§5) belongs on the connect, not the long-lived stream body, so
/// it isn't layered on here; `axum::serve`'s accept loop plus the client's
/// own read timeout cover it in practice.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", get(api::list_sessions))
        .route("/api/sessions/{id}", get(api::get_session))
        .route("/api/sessions/{id}/plan", post(api::put_plan))
        .route("/api/sessions/{id}/update", post(api::patch_status))
        .route("/api/sessions/{id}/end", post(api::end_session))
        .route("/api/diagnostics/quarantine", get(api::list_quarantined))
        .route("/events", get(sse_handler))
        .layer(cors())
        .with_state(state)
}

/// Health probes on their own port so they stay reachable even if the
/// API/ingest listeners are saturated (§4.9 "user-visible behavior").
pub fn health_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .with_state(state)
}

/// Prometheus exposition, same isolation rationale as `health_router`.
pub fn prometheus_router(state: AppState) -> Router {
    Router::new().route("/metrics", get(metrics::metrics)).with_state(state)
}
