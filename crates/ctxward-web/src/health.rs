//! Health probes (C8, §4.8, §4.9 "degraded" rule).

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ctxward_core::models::Severity;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

const DEGRADED_WINDOW_SECS: u64 = 60;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `GET /health` — healthy iff every component is alive and the receiver
/// channel isn't saturated, and no non-info alert fired in the last 60s
/// (§4.9 user-visible behavior).
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let receiver_saturated = state.governor.queue.is_saturated();
    let now = now_secs();
    let recent_non_info_alert = state
        .governor
        .alerts
        .recent()
        .iter()
        .any(|a| a.severity > Severity::Info && now.saturating_sub(a.observed_at / 1000) < DEGRADED_WINDOW_SECS);

    let healthy = !receiver_saturated && !recent_non_info_alert && !state.governor.queue.is_closed();
    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "components": {
            "ingest": if state.governor.queue.is_closed() { "stopped" } else { "operational" },
            "processor": "operational",
            "registry": "operational",
            "orchestrator": "operational",
            "store": "operational",
            "receiverSaturated": receiver_saturated,
            "sessionsActive": state.governor.registry.len(),
        }
    }))
}

/// `GET /health/live` — cheap liveness: always 200 if the process can answer.
pub async fn live() -> StatusCode {
    StatusCode::OK
}

/// `GET /health/ready` — 200 iff C1, C2, C3, C6 are operational; once
/// shutdown has begun (the ingest queue is closed) they are not.
pub async fn ready(State(state): State<AppState>) -> Response {
    if state.governor.queue.is_closed() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not-ready" })),
        )
            .into_response();
    }
    (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::SseHub;
    use ctxward_core::{Config, EventBus, FileStateStore, Governor};
    use std::sync::Arc;

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        let store: Arc<dyn ctxward_core::StateStore> =
            Arc::new(FileStateStore::new(dir.path()).await.unwrap());
        let governor = Arc::new(Governor::new(&config, store));
        let sse = Arc::new(SseHub::new(EventBus::default(), 16));
        (
            AppState {
                governor,
                config: Arc::new(config),
                sse,
            },
            dir,
        )
    }

    #[tokio::test]
    async fn healthy_by_default() {
        let (state, _dir) = test_state().await;
        let Json(value) = health(State(state)).await;
        assert_eq!(value["status"], "healthy");
    }

    #[tokio::test]
    async fn live_is_always_ok() {
        assert_eq!(live().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_flips_after_queue_closes() {
        let (state, _dir) = test_state().await;
        assert_eq!(ready(State(state.clone())).await.status(), StatusCode::OK);
        state.governor.queue.close();
        assert_eq!(
            ready(State(state)).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
