//! Axum-specific error types and mappings.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use syncd_server::ServerError;

/// Errors surfaced by the admin HTTP surface.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request (invalid input).
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Missing or wrong admin token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A conflicting operation is already running.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
            status: status.as_u16(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<ServerError> for HttpError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::RealmNotFound => Self::NotFound("no realm at this path".to_owned()),
            ServerError::CompactionBusy => {
                Self::ServiceUnavailable("compaction already in progress".to_owned())
            }
            ServerError::Config(msg) => Self::Internal(msg),
            ServerError::Store(err) => Self::Internal(err.to_string()),
            ServerError::ShuttingDown => {
                Self::ServiceUnavailable("server is shutting down".to_owned())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_map_to_expected_statuses() {
        let cases = [
            (ServerError::RealmNotFound, StatusCode::NOT_FOUND),
            (ServerError::CompactionBusy, StatusCode::SERVICE_UNAVAILABLE),
            (
                ServerError::Config("x".to_owned()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            let response = HttpError::from(err).into_response();
            assert_eq!(response.status(), status);
        }
    }
}
