//! HTTP-facing error envelope (§7): wraps `CoreError` into the stable
//! `{ code, message, retryable }` JSON body and picks a status code, so
//! handlers never hand a raw `Display` of an internal error to a client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ctxward_core::CoreError;
use serde::Serialize;

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ApiErrorBody {
    code: &'static str,
    message: String,
    retryable: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Ingestion { .. } | CoreError::UnsupportedMetricShape { .. } => {
                StatusCode::BAD_REQUEST
            }
            CoreError::Backpressure(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            CoreError::PersistenceTransient { .. }
            | CoreError::PersistenceFatal { .. }
            | CoreError::CorruptBlob { .. }
            | CoreError::InvariantViolation(_)
            | CoreError::Io(_)
            | CoreError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ApiErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
            retryable: self.0.retryable(),
        };
        (status, Json(body)).into_response()
    }
}

/// A plain `{code, message, retryable}` body for errors that never pass
/// through `CoreError` (body decode failures, bad paths).
pub fn simple_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    let body = ApiErrorBody {
        code,
        message: message.into(),
        retryable: false,
    };
    (status, Json(body)).into_response()
}
