//! Error types for ctxward-core
//!
//! One variant per failure in the taxonomy the governor must reason about.
//! Every handler-facing error carries enough to build the stable
//! `{ code, message, retryable }` envelope the web layer returns; internal
//! `Display` text is never handed to a client verbatim.

use thiserror::Error;

/// Core error type for governor operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("malformed OTLP body: {reason}")]
    Ingestion { reason: String },

    #[error("unsupported metric shape: {kind}")]
    UnsupportedMetricShape { kind: String },

    #[error("ingest queue saturated for {0}s")]
    Backpressure(u64),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("store write failed for session {session_id}")]
    PersistenceTransient {
        session_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store write failed permanently for session {session_id} after {attempts} attempts")]
    PersistenceFatal { session_id: String, attempts: u32 },

    #[error("persisted blob for session {session_id} is corrupt: {reason}")]
    CorruptBlob { session_id: String, reason: String },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Stable machine-readable code for the `{ code, message, retryable }` envelope (§7).
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Ingestion { .. } => "ingestion_error",
            CoreError::UnsupportedMetricShape { .. } => "unsupported_metric_shape",
            CoreError::Backpressure(_) => "backpressure",
            CoreError::SessionNotFound(_) => "session_not_found",
            CoreError::PersistenceTransient { .. } => "persistence_transient",
            CoreError::PersistenceFatal { .. } => "persistence_fatal",
            CoreError::CorruptBlob { .. } => "corrupt_blob",
            CoreError::InvariantViolation(_) => "invariant_violation",
            CoreError::InvalidConfig(_) => "invalid_config",
            CoreError::Io(_) => "io_error",
            CoreError::Json(_) => "json_error",
        }
    }

    /// Whether retrying the same request is expected to help (§7 propagation policy).
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Backpressure(_) | CoreError::PersistenceTransient { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_is_retryable() {
        let err = CoreError::Backpressure(5);
        assert!(err.retryable());
        assert_eq!(err.code(), "backpressure");
    }

    #[test]
    fn session_not_found_is_not_retryable() {
        let err = CoreError::SessionNotFound("s-1".into());
        assert!(!err.retryable());
    }
}
