//! HTTP error translation.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::session::SessionError;
use crate::storage::StorageError;

/// Wire-level error wrapper. Each session error variant maps to exactly one
/// status code; 5xx details are not revealed to the caller.
#[derive(Debug)]
pub struct ApiError(pub SessionError);

/// Error body: human-readable detail plus a stable machine code.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
    pub code: &'static str,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            SessionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Busy(_) => StatusCode::CONFLICT,
            SessionError::QuotaExceeded(_) | SessionError::Overloaded(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            SessionError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Agent(_) | SessionError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_code(&self) -> &'static str {
        match &self.0 {
            SessionError::InvalidInput(_) => "INVALID_INPUT",
            SessionError::NotFound(_) => "NOT_FOUND",
            SessionError::Busy(_) => "SESSION_BUSY",
            SessionError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            SessionError::Overloaded(_) => "OVERLOADED",
            SessionError::Storage(StorageError::Unavailable(_)) => "STORAGE_UNAVAILABLE",
            SessionError::Storage(StorageError::Broken(_)) => "STORAGE_BROKEN",
            SessionError::Agent(_) | SessionError::Internal(_) => "INTERNAL",
        }
    }

    /// Caller-facing detail. 4xx messages are descriptive, 5xx are not.
    fn detail(&self) -> String {
        match &self.0 {
            SessionError::Storage(_) => "storage backend unavailable".to_string(),
            SessionError::Agent(_) | SessionError::Internal(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        match &self.0 {
            SessionError::Agent(_) | SessionError::Internal(_) => {
                error!(error_code = code, message = %self.0, "API error");
            }
            SessionError::Storage(_) => {
                warn!(error_code = code, message = %self.0, "storage unavailable");
            }
            _ => {
                debug!(error_code = code, message = %self.0, "client error");
            }
        }

        let body = ErrorBody {
            detail: self.detail(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
