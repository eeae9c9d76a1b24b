//! Error types for the server.
//!
//! Every failure is reported as `{status_code, error, description}` built
//! from the closed [`ErrorKind`] set; the underlying cause only goes to the
//! log.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use pipewright_engine::EngineError;
use pipewright_store::StoreError;
use pipewright_types::ErrorKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server error type.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No `x-user-login` header.
    #[error("missing user login")]
    MissingIdentity,

    /// Body or path could not be parsed.
    #[error("Bad request: {0}")]
    BodyParse(String),

    /// Request parsed but failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The store did not answer a readiness ping.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Engine error.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        ServerError::Engine(EngineError::Store(e))
    }
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status_code: u32,
    pub error: String,
    pub description: String,
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::MissingIdentity => ErrorKind::MissingIdentity,
            ServerError::BodyParse(_) => ErrorKind::BodyParse,
            ServerError::Validation(_) => ErrorKind::Validation,
            ServerError::ServiceUnavailable(_) => ErrorKind::Storage,
            ServerError::Engine(e) => e.kind(),
            ServerError::Config(_) | ServerError::Internal(_) => ErrorKind::Unknown,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServerError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            other => StatusCode::from_u16(other.kind().status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = self.status();
        let cause = self.to_string();

        if status.is_server_error() {
            tracing::error!(status = %status, code = kind.code(), error = %cause, "Server error");
        } else {
            tracing::warn!(status = %status, code = kind.code(), error = %cause, "Client error");
        }

        let body = ErrorResponse {
            status_code: kind.code(),
            error: kind.message().to_string(),
            description: kind.description().to_string(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_rejection_is_client_error() {
        let err = ServerError::from(EngineError::rejected(ErrorKind::TaskIsPaused, "work 3 is paused"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.status_code, ErrorKind::TaskIsPaused.code());
        assert_eq!(body.error, "work is paused");
        assert!(!body.description.contains("work 3"));
    }

    #[test]
    fn test_store_not_found_maps_to_404() {
        let err = ServerError::from(StoreError::not_found("task", 9));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(ServerError::MissingIdentity.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ServerError::ServiceUnavailable("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
