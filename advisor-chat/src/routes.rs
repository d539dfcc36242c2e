//! HTTP API routes.

use crate::coordinator::{TurnCoordinator, TurnRequest};
use crate::error::TurnError;
use crate::session::{SessionStore, Turn};
use advisor_common::logging::generate_trace_id;
use advisor_common::request_span;
use axum::{
    extract::{rejection::JsonRejection, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::Instrument;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<TurnCoordinator>,
}

impl AppState {
    pub fn new(coordinator: TurnCoordinator) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        self.coordinator.store()
    }
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Chat
        .route("/api/chat", post(chat))
        .with_state(state)
}

// ============ Health Check ============

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
    /// Sessions currently held in memory
    pub sessions: usize,
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        service: "advisor-chat".into(),
        sessions: state.store().session_count().await,
    })
}

// ============ Chat ============

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub history: Vec<Turn>,
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, TurnError> {
    let Json(request) = payload.map_err(|rejection| {
        tracing::debug!(error = %rejection, "Rejected chat body");
        TurnError::Validation(format!("Invalid request body: {}", rejection.body_text()))
    })?;

    let trace_id = generate_trace_id();
    let span = request_span!(
        "chat_turn",
        trace_id,
        session_id = request.session_id.as_deref().unwrap_or_default()
    );

    let outcome = state.coordinator.handle_turn(request).instrument(span).await?;

    Ok(Json(ChatResponse {
        response: outcome.reply,
        history: outcome.history,
    }))
}
