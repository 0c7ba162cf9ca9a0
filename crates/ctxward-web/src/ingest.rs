//! Telemetry Receiver (C1, §4.1): `POST /v1/metrics`.
//!
//! Transport-only: decoding lives in `ctxward_core::otlp`, session
//! assignment and queueing in `ctxward_core::Governor::ingest`. This module
//! just maps HTTP in and out.

use crate::error::simple_error;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ctxward_core::otlp::decode_otlp_json;
use std::time::Duration;
use tracing::warn;

/// `POST /v1/metrics` — OTLP/JSON body. Returns 204 on success, 400 on a
/// malformed body, 503 if the ingest queue has been saturated for longer
/// than `shedTimeout` (default 5s).
pub async fn ingest_metrics(State(state): State<AppState>, body: Bytes) -> Response {
    let shed_timeout = Duration::from_secs(state.config.shed_timeout_secs);
    if let Some(saturated_for) = state.governor.queue.saturated_duration() {
        if saturated_for >= shed_timeout {
            warn!(seconds = saturated_for.as_secs(), "shedding ingest: queue saturated past shedTimeout");
            return simple_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "backpressure",
                format!("ingest queue saturated for {}s", saturated_for.as_secs()),
            );
        }
    }

    let batches = match decode_otlp_json(&body) {
        Ok(batches) => batches,
        Err(e) => {
            return simple_error(StatusCode::BAD_REQUEST, "ingestion_error", e.to_string());
        }
    };

    for batch in batches {
        if let Err(e) = state.governor.ingest(batch) {
            return simple_error(StatusCode::BAD_REQUEST, "ingestion_error", e.to_string());
        }
    }

    StatusCode::NO_CONTENT.into_response()
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
        let state = AppState {
            governor,
            config: Arc::new(config),
            sse,
        };
        (state, dir)
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_as_400() {
        let (state, _dir) = test_state().await;
        let response = ingest_metrics(State(state), Bytes::from_static(b"not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_request_is_accepted() {
        let (state, _dir) = test_state().await;
        let body = Bytes::from_static(br#"{"resourceMetrics": []}"#);
        let response = ingest_metrics(State(state), body).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
