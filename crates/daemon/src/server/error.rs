//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol::{ErrorBody, ProtocolError};
use thiserror::Error;

use crate::session::SessionError;

/// Errors returned by HTTP handlers, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Unknown session.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Missing or wrong credential.
    #[error("unauthorized")]
    Unauthorized,

    /// Malformed request.
    #[error("{0}")]
    Validation(String),

    /// Name already taken.
    #[error("{0}")]
    Conflict(String),

    /// Temporarily out of capacity.
    #[error("{0}")]
    Unavailable(String),

    /// The backend could not be started.
    #[error("{0}")]
    Spawn(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Spawn(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => ApiError::NotFound(id),
            SessionError::AlreadyExists(_) => ApiError::Conflict(err.to_string()),
            SessionError::LimitReached(_) => ApiError::Unavailable(err.to_string()),
            SessionError::InvalidId(_) | SessionError::InvalidGeometry { .. } => {
                ApiError::Validation(err.to_string())
            }
            SessionError::SpawnFailed(_) => ApiError::Spawn(err.to_string()),
            SessionError::WriteFailed(_)
            | SessionError::ResizeFailed(_)
            | SessionError::KillFailed(_)
            | SessionError::Io(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Serialization(message) => ApiError::Internal(message),
            other => ApiError::Validation(other.to_string()),
        }
    }
}
