// [[ASSEMBLY]]/apps/agent-server/src/server/mod.rs
// Purpose: Router for the uniform agent API.
// Architecture: API Layer

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::worker::AgentRuntime;

pub fn router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/process", post(handlers::process))
        .route("/agent-tokens", get(handlers::agent_tokens))
        .route("/reset-tokens", post(handlers::reset_tokens))
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}
