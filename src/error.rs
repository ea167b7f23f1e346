use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Failures of the file-backed persistence store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Invalid environment configuration. Only ever fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// Signature header present, secret bound, digest mismatch.
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid JSON payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// Only produced by the read APIs, never on the webhook path.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ReceiverError {
    fn into_response(self) -> Response {
        match self {
            ReceiverError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "Invalid signature",
                    "hint": "Secret mismatch or body format incorrect",
                })),
            )
                .into_response(),
            ReceiverError::MalformedPayload(_) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": self.to_string() })),
            )
                .into_response(),
            ReceiverError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "success": false, "error": self.to_string() })),
            )
                .into_response(),
        }
    }
}
