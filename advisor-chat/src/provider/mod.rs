//! Outbound model interface.
//!
//! A model takes a system instruction, the prior turns of a conversation and
//! a new user message, and answers with a lazy, finite stream of reply
//! fragments.

mod gemini;
mod retry;

pub use gemini::GeminiProvider;
pub use retry::{RetryConfig, RetryingModel};

use crate::fragment::Fragment;
use crate::session::{Role, Turn};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

// ============================================================================
// Model Trait
// ============================================================================

/// Reply fragments in arrival order. Not restartable.
pub type FragmentStream = BoxStream<'static, Result<Fragment, ProviderError>>;

/// A hosted generative model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Provider name, used in logs and errors.
    fn name(&self) -> &str;

    /// Start a reply. Errors returned here happen before any fragment
    /// arrives; errors inside the stream happen mid-reply.
    async fn stream_reply(&self, request: ModelRequest) -> Result<FragmentStream, ProviderError>;
}

// ============================================================================
// Request
// ============================================================================

/// One call to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    /// Model identifier
    pub model: String,
    /// System instruction parts, in order
    pub system_instruction: Vec<String>,
    /// Turns before the new message
    pub history: Vec<Turn>,
    /// The new user message
    pub message: String,
    /// Sampling temperature, model default when unset
    pub temperature: Option<f64>,
}

impl ModelRequest {
    /// The full conversation the model sees: prior turns followed by the new
    /// message as a user turn.
    pub fn contents(&self) -> Vec<Turn> {
        let mut contents = self.history.clone();
        contents.push(Turn::user(self.message.clone()));
        contents
    }
}

/// Check that turns start with `user` and strictly alternate.
///
/// Returns a description of the first violation.
pub fn check_alternation(turns: &[Turn]) -> Result<(), String> {
    let mut expected = Role::User;
    for (idx, turn) in turns.iter().enumerate() {
        if turn.role != expected {
            return Err(format!(
                "turn {idx} has role {}, expected {}",
                turn.role.as_str(),
                expected.as_str()
            ));
        }
        expected = match expected {
            Role::User => Role::Assistant,
            Role::Assistant => Role::User,
        };
    }
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

/// Broad category of a model failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The conversation broke the role ordering the API requires.
    HistoryOrder,
    /// Quota or rate limit hit.
    RateLimited,
    /// Credential rejected.
    Auth,
    /// The call took too long.
    Timeout,
    /// Connection-level failure.
    Transport,
    /// Any other error reported by the service.
    Service,
}

/// Error from a model provider.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub kind: ProviderErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Whether repeating the identical call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ProviderErrorKind::RateLimited
            | ProviderErrorKind::Timeout
            | ProviderErrorKind::Transport => true,
            ProviderErrorKind::Service => self.status_code.map_or(true, |s| s >= 500),
            ProviderErrorKind::HistoryOrder | ProviderErrorKind::Auth => false,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.provider, self.model, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Classify a service-reported failure from its HTTP status and message.
pub fn classify_failure(status_code: Option<u16>, message: &str) -> ProviderErrorKind {
    let lower = message.to_lowercase();

    let mentions_order = lower.contains("multiturn")
        || (lower.contains("role")
            && (lower.contains("first content")
                || lower.contains("alternate")
                || lower.contains("ends with")));
    if mentions_order {
        return ProviderErrorKind::HistoryOrder;
    }

    match status_code {
        Some(429) => ProviderErrorKind::RateLimited,
        Some(401) | Some(403) => ProviderErrorKind::Auth,
        Some(408) | Some(504) => ProviderErrorKind::Timeout,
        _ if lower.contains("resource_exhausted") || lower.contains("quota") => {
            ProviderErrorKind::RateLimited
        }
        _ => ProviderErrorKind::Service,
    }
}
