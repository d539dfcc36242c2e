//! Advisor Chat - insurance advisor chat service.
//!
//! Proxies chat turns between a browser client and Gemini, keeping each
//! session's transcript in memory and sending a fixed advisor instruction
//! with every call.
//!
//! ## Architecture
//!
//! ```text
//! Client → POST /api/chat → TurnCoordinator → RetryingModel → GeminiProvider
//!                               ↓      ↑
//!                          SessionStore (commit on success only)
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod coordinator;
pub mod error;
pub mod fragment;
pub mod prompt;
pub mod provider;
pub mod routes;
pub mod session;

pub use coordinator::{CoordinatorSettings, Phase, TurnCoordinator, TurnOutcome, TurnRequest};
pub use error::{TurnError, RESET_MESSAGE, RETRY_MESSAGE};
pub use fragment::Fragment;
pub use prompt::SystemInstruction;
pub use provider::{
    ChatModel, FragmentStream, GeminiProvider, ModelRequest, ProviderError, ProviderErrorKind,
    RetryConfig, RetryingModel,
};
pub use routes::{AppState, ChatResponse, HealthResponse};
pub use session::{InMemorySessionStore, Role, SessionStore, Turn};

use advisor_common::config::Config;
use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the service router with CORS and request tracing.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::build_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Wire the store, model and instruction described by `config`.
pub fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let api_key = config
        .llm
        .api_key
        .clone()
        .context("No Gemini API key configured (set GEMINI_API_KEY)")?;

    let instruction = SystemInstruction::resolve(config.chat.instruction_path.as_deref())?;
    tracing::debug!(
        model = %config.llm.model,
        instruction_parts = instruction.parts().len(),
        "System instruction loaded"
    );

    let gemini: Arc<dyn ChatModel> = Arc::new(GeminiProvider::new(api_key, config.llm.base_url.clone())?);
    let model = Arc::new(RetryingModel::new(gemini, RetryConfig::from(&config.llm)));
    let store = Arc::new(InMemorySessionStore::new());

    let coordinator = TurnCoordinator::new(
        store,
        model,
        instruction,
        CoordinatorSettings::from_config(config),
    );

    Ok(AppState::new(coordinator))
}

/// Start the chat server.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = config.listen_address()?;

    let router = build_router(build_state(config)?);

    tracing::info!("Starting Advisor Chat on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
