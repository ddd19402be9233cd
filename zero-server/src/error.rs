//! API error envelope and status-code mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use zero_core::error::{DiffError, QueueError, SchedError, StoreError, ZeroError};

/// An error ready to leave the API boundary as
/// `{ "error": { "code", "message" } }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            code: "validation",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<ZeroError> for ApiError {
    fn from(err: ZeroError) -> Self {
        let (status, code) = match &err {
            ZeroError::Store(StoreError::ArtifactNotFound { .. })
            | ZeroError::Store(StoreError::RepoNotFound(_))
            | ZeroError::Queue(QueueError::JobNotFound(_))
            | ZeroError::Diff(DiffError::ScanNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            ZeroError::Queue(QueueError::Full { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, "queue_full")
            }
            ZeroError::Queue(QueueError::DuplicateJob(_))
            | ZeroError::Queue(QueueError::AlreadyTerminal { .. })
            | ZeroError::Diff(DiffError::HistoryDisabled) => (StatusCode::CONFLICT, "conflict"),
            ZeroError::Sched(SchedError::UnknownProfile(_))
            | ZeroError::Sched(SchedError::UnknownUnit(_))
            | ZeroError::Config(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}
