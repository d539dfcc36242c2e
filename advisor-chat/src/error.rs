//! Error types for the chat service.

use crate::provider::{ProviderError, ProviderErrorKind};
use crate::session::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Message returned for failures the client may simply retry.
pub const RETRY_MESSAGE: &str = "Failed to get a response from the assistant. Please try again.";

/// Message returned when the session history no longer fits the model's
/// turn ordering rules.
pub const RESET_MESSAGE: &str =
    "This conversation got out of sync. Please refresh the page to start a new conversation.";

/// Failures of a chat turn.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// The inbound request is malformed. Nothing was attempted.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The conversation sent to the model broke its role ordering. The
    /// session's stored history should be treated as corrupt.
    #[error("Conversation history rejected: {0}")]
    UpstreamProtocol(String),

    /// Network failure, timeout, rate limit or other model-side failure.
    #[error("Model call failed: {0}")]
    UpstreamTransient(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TurnError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text shown to the client.
    pub fn client_message(&self) -> String {
        match self {
            Self::Validation(reason) => reason.clone(),
            Self::UpstreamProtocol(_) => RESET_MESSAGE.to_string(),
            Self::UpstreamTransient(_) | Self::Store(_) => RETRY_MESSAGE.to_string(),
        }
    }
}

impl From<ProviderError> for TurnError {
    fn from(err: ProviderError) -> Self {
        match err.kind {
            ProviderErrorKind::HistoryOrder => Self::UpstreamProtocol(err.to_string()),
            _ => Self::UpstreamTransient(err.to_string()),
        }
    }
}

/// Error body: `{ "error": "..." }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for TurnError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.client_message(),
        };
        (self.status_code(), axum::Json(body)).into_response()
    }
}
