// [[ASSEMBLY]]/apps/agent-server/src/main.rs
// Purpose: Entry point for one stage agent. AGENT_TYPE selects the stage.
// Architecture: Application Boot
// Dependencies: Axum, Tokio

mod analyzer;
mod config;
mod parse;
mod prompts;
mod server;
mod worker;

use anyhow::Context;
use assembly_core::{telemetry, PostgrestReservoir, TokenTracker};
use std::sync::Arc;

use crate::analyzer::CliAnalyzer;
use crate::config::AgentConfig;
use crate::worker::AgentRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing(&["assembly_agent=debug", "assembly_core=info", "tower_http=debug"]);

    let config = AgentConfig::from_env()?;
    let agent = config.agent_type;
    tracing::info!("Initializing {} on port {}", config.descriptor.name, config.port);
    let context = config.context;
    if context.token_reset {
        tracing::info!("{}: recycled after reaching the token ceiling", agent);
    } else if context.fresh_start {
        tracing::info!("{}: supervised restart", agent);
    }
    if !context.resume_sessions() {
        tracing::info!("{}: context cleared, CLI sessions will not be resumed", agent);
    }

    let tracker = Arc::new(TokenTracker::new(agent.agent_name(), config.token_limit));
    let analyzer = CliAnalyzer::new(config.cli_path.clone(), tracker.clone())
        .with_base_args(config.cli_args.clone())
        .with_prompt_mode(config.prompt_mode)
        .with_timeout(config.cli_timeout)
        .with_session_resume(context.resume_sessions());
    let reservoir = PostgrestReservoir::from_env();

    let runtime = Arc::new(AgentRuntime::new(
        config.descriptor.clone(),
        tracker,
        Arc::new(reservoir),
        Arc::new(analyzer),
    ));

    let app = server::router(runtime);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("{} listening on http://{}", agent.agent_name(), addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("{} stopped", agent.agent_name());
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
