//! API error types and HTTP status mapping.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::scheduler::SchedulerError;
use crate::storage::StorageError;

/// API error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// The request body or parameters were rejected.
    BadRequest(String),
    /// Resource not found.
    NotFound(String),
    /// Request conflict (e.g., duplicate job name).
    Conflict(String),
    /// Service unavailable (e.g., no scheduler attached).
    ServiceUnavailable(String),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg)
            }
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::InvalidJob(e) => ApiError::BadRequest(e.to_string()),
            SchedulerError::DuplicateJob(name) => {
                ApiError::Conflict(format!("job already exists: {}", name))
            }
            SchedulerError::JobNotFound(name) => {
                ApiError::NotFound(format!("job not found: {}", name))
            }
            SchedulerError::NotRunning => {
                ApiError::ServiceUnavailable("scheduler is not running".to_string())
            }
            SchedulerError::Storage(e) => e.into(),
            SchedulerError::Lock(e) => ApiError::Internal(e.to_string()),
            SchedulerError::ChannelError(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => ApiError::NotFound(msg),
            StorageError::DuplicateKey(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobError;

    #[test]
    fn test_scheduler_errors_map_to_status_codes() {
        let cases = [
            (
                SchedulerError::InvalidJob(JobError::UnknownJobType("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (SchedulerError::DuplicateJob("a".into()), StatusCode::CONFLICT),
            (SchedulerError::JobNotFound("a".into()), StatusCode::NOT_FOUND),
            (SchedulerError::NotRunning, StatusCode::SERVICE_UNAVAILABLE),
            (
                SchedulerError::Storage(StorageError::Other("disk".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
