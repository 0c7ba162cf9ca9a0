//! Publication Layer JSON endpoints (C8, §4.8): session listing/detail and
//! the external-controller mutation endpoints (`plan`, `update`, `end`).

use crate::error::{simple_error, ApiError};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ctxward_core::models::{ExecutionPlan, ExternalStatusUpdate, SessionId, Task};
use serde::Serialize;
use serde_json::json;

/// `GET /api/sessions` — copy-on-read snapshot of every tracked session
/// (§4.8: "not coherent with any specific SSE position").
pub async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.governor.registry.list_active().await;
    Json(json!({ "sessions": sessions, "total": sessions.len() }))
}

#[derive(Serialize)]
struct SessionDetail {
    #[serde(flatten)]
    snapshot: ctxward_core::SessionSnapshot,
    execution_plan: ExecutionPlan,
    current_task: Option<String>,
    phase: Option<String>,
    quality_score: Option<f64>,
    iteration: Option<u64>,
    checkpoint_threshold: f64,
    warning_threshold: f64,
    compaction_threshold: f64,
}

/// `GET /api/sessions/:id` — full detail including `executionPlan`, opaque
/// external-status fields, and the session's currently learned thresholds.
pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let session_id: SessionId = id.as_str().into();
    let Some(handle) = state.governor.registry.get(&session_id) else {
        return ApiError::from(ctxward_core::CoreError::SessionNotFound(id)).into_response();
    };
    let locked = handle.lock().await;
    let detail = SessionDetail {
        snapshot: ctxward_core::SessionSnapshot::from(&locked.record),
        execution_plan: locked.record.execution_plan.clone(),
        current_task: locked.record.external.current_task.clone(),
        phase: locked.record.external.phase.clone(),
        quality_score: locked.record.external.quality_score,
        iteration: locked.record.external.iteration,
        checkpoint_threshold: locked.record.thresholds.checkpoint_threshold,
        warning_threshold: locked.record.thresholds.warning_threshold,
        compaction_threshold: locked.record.thresholds.compaction_threshold,
    };
    Json(detail).into_response()
}

#[derive(serde::Deserialize)]
pub struct PlanRequest {
    tasks: Vec<Task>,
}

/// `POST /api/sessions/:id/plan` — replace the execution plan. Opaque to
/// the core beyond status/progress bookkeeping (§3 `ExecutionPlan`).
pub async fn put_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PlanRequest>,
) -> Response {
    let session_id: SessionId = id.as_str().into();
    let Some(handle) = state.governor.registry.get(&session_id) else {
        return ApiError::from(ctxward_core::CoreError::SessionNotFound(id)).into_response();
    };
    let mut locked = handle.lock().await;
    locked.record.execution_plan.replace(req.tasks);
    StatusCode::NO_CONTENT.into_response()
}

/// `POST /api/sessions/:id/update` — patch `currentTask`/`phase`/
/// `qualityScore`/`iteration`; unset fields in the request keep their
/// previous value.
pub async fn patch_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ExternalStatusUpdate>,
) -> Response {
    let session_id: SessionId = id.as_str().into();
    let Some(handle) = state.governor.registry.get(&session_id) else {
        return ApiError::from(ctxward_core::CoreError::SessionNotFound(id)).into_response();
    };
    let mut locked = handle.lock().await;
    locked.record.external.apply(update);
    StatusCode::NO_CONTENT.into_response()
}

/// `POST /api/sessions/:id/end` — transition to `closed` via C6's wrap-up
/// path.
pub async fn end_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let session_id: SessionId = id.as_str().into();
    if state.governor.registry.get(&session_id).is_none() {
        return ApiError::from(ctxward_core::CoreError::SessionNotFound(id)).into_response();
    }
    state.governor.wrap_up_session(&id).await;
    StatusCode::NO_CONTENT.into_response()
}

/// `GET /api/diagnostics/quarantine` — supplemental diagnostics endpoint:
/// blobs C7 has quarantined because they failed to parse (§6).
pub async fn list_quarantined(State(state): State<AppState>) -> Response {
    match state.governor.store.list_quarantined().await {
        Ok(names) => Json(json!({ "quarantined": names })).into_response(),
        Err(e) => simple_error(StatusCode::INTERNAL_SERVER_ERROR, e.code(), e.to_string()),
    }
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
    async fn unknown_session_detail_is_404() {
        let (state, _dir) = test_state().await;
        let response = get_session(State(state), Path("nope".into())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_sessions_starts_empty() {
        let (state, _dir) = test_state().await;
        let Json(value) = list_sessions(State(state)).await;
        assert_eq!(value["total"], 0);
    }

    #[tokio::test]
    async fn plan_and_status_updates_round_trip() {
        let (state, _dir) = test_state().await;
        state
            .governor
            .registry
            .get_or_create(&"s-1".into(), &"p".into(), None, 0);

        let plan = PlanRequest {
            tasks: vec![Task {
                id: "t1".into(),
                content: "write tests".into(),
                status: ctxward_core::models::TaskStatus::InProgress,
                progress: 50,
                active_form: None,
            }],
        };
        let response = put_plan(State(state.clone()), Path("s-1".into()), Json(plan)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let update = ExternalStatusUpdate {
            current_task: Some("writing tests".into()),
            phase: None,
            quality_score: Some(0.9),
            iteration: Some(3),
        };
        let response = patch_status(State(state.clone()), Path("s-1".into()), Json(update)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let handle = state.governor.registry.get(&"s-1".into()).unwrap();
        let locked = handle.lock().await;
        assert_eq!(locked.record.execution_plan.tasks.len(), 1);
        assert_eq!(locked.record.external.quality_score, Some(0.9));
    }
}
