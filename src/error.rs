//! Engine error taxonomy.
//!
//! Every library-level operation returns [`EngineError`]. The variants follow the
//! failure classes the engine distinguishes at runtime: malformed input is rejected
//! synchronously, transient faults are retried by the scheduler, consistency faults
//! trigger an index rebuild, and everything else is surfaced as-is.

use axum::http::StatusCode;
use axum::Json;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed ingest payload or out-of-range argument. Never enqueued.
    #[error("validation error: {0}")]
    Validation(String),

    /// `submit()` was called while the queue sits above its high-water mark.
    #[error("task queue full ({depth} queued, high-water mark {high_water})")]
    QueueFull { depth: usize, high_water: usize },

    /// Embedding model or disk I/O temporarily unavailable. Retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Index contents disagree with the record table for a partition.
    #[error("index inconsistent for {shard}: {details}")]
    Consistency { shard: String, details: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the scheduler should re-queue a task that failed with this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Consistency { .. } | Self::Database(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {e}"))
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task failed: {e}"))
    }
}

impl axum::response::IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
