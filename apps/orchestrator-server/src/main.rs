// [[ASSEMBLY]]/apps/orchestrator-server/src/main.rs
// Purpose: Entry point for the assembly line orchestrator.
// Architecture: Application Boot
// Dependencies: Axum, Tokio

mod agent_client;
mod config;
mod coordinator;
mod error;
mod events;
mod handoff;
mod observability;
mod server;
mod state;
mod supervisor;

use anyhow::Context;
use assembly_core::{telemetry, PostgrestReservoir};
use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::state::OrchestratorState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing(&["assembly_orchestrator=debug", "assembly_core=info", "tower_http=debug"]);

    tracing::info!("Initializing Agent Assembly Line Orchestrator...");

    let config = OrchestratorConfig::from_env()?;
    let reservoir = PostgrestReservoir::from_env();
    if !reservoir.is_configured() {
        tracing::warn!("Reservoir credentials missing, runs will fail readiness until they are set");
    }

    for descriptor in &config.agents {
        tracing::info!("Stage {} -> port {}", descriptor.agent_type, descriptor.port);
    }

    let port = config.port;
    let state = OrchestratorState::new(config, Arc::new(reservoir));
    let monitor = state.spawn_health_monitor();

    let app = server::router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("Orchestrator listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    state.shutdown().await;
    let _ = monitor.await;
    tracing::info!("Orchestrator stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
