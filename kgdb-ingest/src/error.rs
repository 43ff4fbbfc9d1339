//! HTTP error responses for kgdb-ingest

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409) - e.g. reviewing an entry twice
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Upstream source failure (502)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// kgdb-common error without a more specific status
    #[error("Common error: {0}")]
    Common(kgdb_common::Error),
}

impl From<kgdb_common::Error> for ApiError {
    fn from(err: kgdb_common::Error) -> Self {
        use kgdb_common::Error;
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            Error::InvalidState(msg) => ApiError::Conflict(msg),
            Error::Upstream { message, .. } => ApiError::Upstream(message),
            other => ApiError::Common(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", msg),
            ApiError::Common(ref err) => {
                tracing::error!(error = %err, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    err.to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_errors_map_to_statuses() {
        let cases = [
            (kgdb_common::Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (kgdb_common::Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (kgdb_common::Error::InvalidState("x".into()), StatusCode::CONFLICT),
            (kgdb_common::Error::upstream("x"), StatusCode::BAD_GATEWAY),
            (kgdb_common::Error::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
