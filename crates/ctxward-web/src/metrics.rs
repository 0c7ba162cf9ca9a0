//! Prometheus exposition (C8, §4.8 `GET /metrics`): per-session gauges plus
//! the fleet-wide counters the other components already track internally.

use crate::state::AppState;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use prometheus::{Encoder, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// A fresh `Registry` is built per scrape so series for sessions that have
/// since closed don't linger forever (§3 lifecycle).
pub async fn metrics(State(state): State<AppState>) -> Response {
    let registry = Registry::new();

    let tokens_total = IntGaugeVec::new(
        Opts::new("context_tokens_total", "Current token count per session"),
        &["session", "project"],
    )
    .unwrap();
    let utilization = GaugeVec::new(
        Opts::new("context_utilization", "Fraction of the context window in use"),
        &["session", "project"],
    )
    .unwrap();
    let velocity = GaugeVec::new(
        Opts::new("context_velocity_tokens_per_sec", "Token consumption rate"),
        &["session", "project"],
    )
    .unwrap();
    let checkpoints = IntGaugeVec::new(
        Opts::new("checkpoints_total", "Checkpoints written for this session"),
        &["session", "project"],
    )
    .unwrap();
    let compaction_saves = IntGaugeVec::new(
        Opts::new("compaction_saves_total", "Compaction events detected for this session"),
        &["session", "project"],
    )
    .unwrap();
    let operations = IntGaugeVec::new(
        Opts::new("operations_total", "Tool-call operations observed for this session"),
        &["session", "project"],
    )
    .unwrap();
    let sessions_active = IntGauge::new("sessions_active", "Currently tracked sessions").unwrap();
    let ingest_dropped = IntGauge::new(
        "ingest_points_dropped_total",
        "Points dropped by the ingest queue under backpressure",
    )
    .unwrap();
    let session_collisions = IntGauge::new(
        "session_id_collisions_total",
        "Suspicious session-id collisions observed by the registry",
    )
    .unwrap();

    registry.register(Box::new(tokens_total.clone())).unwrap();
    registry.register(Box::new(utilization.clone())).unwrap();
    registry.register(Box::new(velocity.clone())).unwrap();
    registry.register(Box::new(checkpoints.clone())).unwrap();
    registry.register(Box::new(compaction_saves.clone())).unwrap();
    registry.register(Box::new(operations.clone())).unwrap();
    registry.register(Box::new(sessions_active.clone())).unwrap();
    registry.register(Box::new(ingest_dropped.clone())).unwrap();
    registry.register(Box::new(session_collisions.clone())).unwrap();

    let sessions = state.governor.registry.list_active().await;
    sessions_active.set(sessions.len() as i64);
    ingest_dropped.set(state.governor.queue.dropped_count() as i64);
    session_collisions.set(state.governor.registry.suspicious_collisions() as i64);

    for snap in &sessions {
        let session = snap.session_id.as_str();
        let project = snap.project_id.as_str();
        tokens_total.with_label_values(&[session, project]).set(snap.current_tokens as i64);
        utilization.with_label_values(&[session, project]).set(snap.utilization);
        velocity.with_label_values(&[session, project]).set(snap.token_velocity);
        checkpoints.with_label_values(&[session, project]).set(snap.checkpoints as i64);
        compaction_saves
            .with_label_values(&[session, project])
            .set(snap.compaction_saves as i64);
        operations.with_label_values(&[session, project]).set(snap.operations as i64);
    }

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
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
    async fn exposition_returns_ok_and_text_format() {
        let (state, _dir) = test_state().await;
        let response = metrics(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn exposition_includes_per_session_series() {
        let (state, _dir) = test_state().await;
        state
            .governor
            .registry
            .get_or_create(&"s-1".into(), &"p-a".into(), None, 0);
        let response = metrics(State(state)).await;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("context_tokens_total"));
        assert!(text.contains("s-1"));
    }
}
