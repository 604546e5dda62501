use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
///
/// Channel-layer errors (`NotConnected`, `Timeout`, `ConnectionLost`) are
/// recoverable by re-issuing the request once the channel is open again.
/// Validation errors are scoped to a single request and never tear down the
/// connection.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Signaling channel not connected")]
    NotConnected,

    #[error("Request {request} timed out after {after_ms}ms")]
    Timeout { request: String, after_ms: u64 },

    #[error("Signaling connection lost")]
    ConnectionLost,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Incompatible capabilities: {0}")]
    IncompatibleCapabilities(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Media engine error: {0}")]
    EngineFailure(String),

    #[error("Media engine unavailable")]
    EngineUnavailable,

    #[error("Failed to load capabilities: {0}")]
    CapabilityLoadFailed(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Server rejected request: {0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Channel-layer failures the caller may retry after reconnecting
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AppError::NotConnected | AppError::Timeout { .. } | AppError::ConnectionLost
        )
    }
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::InvalidState(_) => StatusCode::BAD_REQUEST,
            AppError::EngineUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
