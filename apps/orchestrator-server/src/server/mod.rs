// [[ASSEMBLY]]/apps/orchestrator-server/src/server/mod.rs
// Purpose: Orchestrator router. Coordination endpoints only.
// Architecture: API Layer

pub mod handlers;

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::OrchestratorState;

pub fn router(state: Arc<OrchestratorState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        // Pipeline
        .route("/start-assembly", post(handlers::start_assembly))
        .route("/start-continuous", post(handlers::start_continuous))
        .route("/stop-continuous", post(handlers::stop_continuous))
        // Supervisor
        .route("/start-agents", post(handlers::start_agents))
        .route("/stop-agents", post(handlers::stop_agents))
        .route("/start-agent", post(handlers::start_agent))
        .route("/stop-agent", post(handlers::stop_agent))
        .route("/restart-agent", post(handlers::restart_agent))
        .route("/refresh-all-agents", post(handlers::refresh_all_agents))
        .route("/restart-agent-context/:agent_type", post(handlers::restart_agent_context))
        .route("/agent-status", get(handlers::agent_status))
        .route("/agents-health", get(handlers::agents_health))
        // Tokens
        .route("/token-usage", get(handlers::token_usage))
        .route("/context-performance", get(handlers::context_performance))
        // Orchestrator handoff
        .route("/orchestrator-handoff", post(handlers::orchestrator_handoff))
        .route("/orchestrator-restore", post(handlers::orchestrator_restore))
        // Reservoir
        .route("/initialize-reservoir", post(handlers::initialize_reservoir))
        .route("/reservoir-status", get(handlers::reservoir_status))
        // Diagnostics
        .route("/system-errors", get(handlers::system_errors))
        .route("/clear-errors", post(handlers::clear_errors))
        .route("/ws/events", get(handlers::ws_events))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
