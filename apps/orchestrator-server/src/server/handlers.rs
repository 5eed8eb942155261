// [[ASSEMBLY]]/apps/orchestrator-server/src/server/handlers.rs
// Purpose: Orchestrator API handlers.
// Architecture: API Layer
// Dependencies: Axum, OrchestratorState

use assembly_core::{AgentType, TokenUsage};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Json, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::error::ApiError;
use crate::handoff::HandoffReport;
use crate::observability::Severity;
use crate::state::OrchestratorState;
use crate::supervisor::{RestartCause, StartFlags};

#[derive(Deserialize)]
pub struct AgentRequest {
    #[serde(rename = "agentType")]
    agent_type: String,
}

impl AgentRequest {
    fn agent(&self) -> Result<AgentType, ApiError> {
        Ok(self.agent_type.parse()?)
    }
}

fn enabled() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default = "enabled")]
    clear_context: bool,
    #[serde(default = "enabled")]
    staggered: bool,
}

impl Default for RefreshRequest {
    fn default() -> Self {
        RefreshRequest {
            clear_context: true,
            staggered: true,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRestartRequest {
    #[serde(default = "enabled")]
    clear_context: bool,
}

impl Default for ContextRestartRequest {
    fn default() -> Self {
        ContextRestartRequest { clear_context: true }
    }
}

#[derive(Deserialize)]
pub struct RestoreRequest {
    handoff_report: Option<HandoffReport>,
}

#[derive(Deserialize)]
pub struct ErrorQuery {
    limit: Option<usize>,
    severity: Option<Severity>,
}

/// 500 listing every agent a bulk operation failed for.
fn bulk_failure(action: &str, failures: Vec<Value>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": format!("{} failed for {} agent(s)", action, failures.len()),
            "component": "process_supervisor",
            "failures": failures,
        })),
    )
        .into_response()
}

pub async fn health(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    let statuses = state.supervisor.statuses();
    Json(json!({
        "status": "healthy",
        "service": "Agent Assembly Line Orchestrator",
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "orchestration_runs": state.coordinator.runs(),
        "total_processed": state.coordinator.total_processed(),
        "last_run_at": state.coordinator.last_run_at(),
        "continuous_mode": state.coordinator.continuous_running(),
        "orchestrator_restart_count": state.restart_count(),
        "agents_running": statuses.iter().filter(|s| s.running).count(),
        "agents_configured": statuses.len(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

// ---- Pipeline ----

pub async fn start_assembly(State(state): State<Arc<OrchestratorState>>) -> Result<Json<Value>, ApiError> {
    tracing::info!("Starting agent assembly line");

    let started: Vec<Value> = state
        .supervisor
        .start_all()
        .await
        .into_iter()
        .map(|(agent, result)| match result {
            Ok(status) => json!({ "agentType": agent, "status": "started", "pid": status.pid }),
            Err(e) => json!({ "agentType": agent, "status": "failed", "error": e.to_string() }),
        })
        .collect();

    let reservoir_initialized = match state.reservoir.initialize_from_queue().await {
        Ok(init) => Some(init),
        Err(e) => {
            state
                .errors
                .record("reservoir", format!("initialization failed: {}", e), "initialize_reservoir");
            None
        }
    };

    let results = state.coordinator.run_once().await?;

    Ok(Json(json!({
        "success": true,
        "run_number": state.coordinator.runs(),
        "agents_started": started,
        "reservoir_initialized": reservoir_initialized,
        "results": results,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

pub async fn start_continuous(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    if !state.coordinator.start_continuous() {
        return Json(json!({ "success": true, "message": "Continuous mode already running" }));
    }
    Json(json!({
        "success": true,
        "message": "Continuous processing started",
        "interval_seconds": state.config.continuous_interval.as_secs(),
    }))
}

/// Ends continuous mode and shuts the agents down with it.
pub async fn stop_continuous(State(state): State<Arc<OrchestratorState>>) -> Response {
    let was_running = state.coordinator.stop_continuous();

    let failures: Vec<Value> = state
        .supervisor
        .stop_all()
        .await
        .into_iter()
        .filter_map(|(agent, result)| {
            result
                .err()
                .map(|e| json!({ "agentType": agent, "error": e.to_string() }))
        })
        .collect();
    if !failures.is_empty() {
        return bulk_failure("stop", failures);
    }

    Json(json!({
        "success": true,
        "message": "Pipeline stopped and all agents shut down",
        "continuous_was_running": was_running,
        "agents_stopped": true,
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}

// ---- Supervisor ----

pub async fn start_agents(State(state): State<Arc<OrchestratorState>>) -> Response {
    let failures: Vec<Value> = state
        .supervisor
        .start_all()
        .await
        .into_iter()
        .filter_map(|(agent, result)| {
            result
                .err()
                .map(|e| json!({ "agentType": agent, "error": e.to_string() }))
        })
        .collect();
    if !failures.is_empty() {
        return bulk_failure("start", failures);
    }

    Json(json!({
        "success": true,
        "message": "All agents started",
        "agents": state.supervisor.statuses(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}

pub async fn stop_agents(State(state): State<Arc<OrchestratorState>>) -> Response {
    let failures: Vec<Value> = state
        .supervisor
        .stop_all()
        .await
        .into_iter()
        .filter_map(|(agent, result)| {
            result
                .err()
                .map(|e| json!({ "agentType": agent, "error": e.to_string() }))
        })
        .collect();
    if !failures.is_empty() {
        return bulk_failure("stop", failures);
    }

    Json(json!({
        "success": true,
        "message": "All agents stopped",
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}

pub async fn start_agent(
    State(state): State<Arc<OrchestratorState>>,
    Json(request): Json<AgentRequest>,
) -> Result<Json<Value>, ApiError> {
    let agent = request.agent()?;
    let status = state.supervisor.start(agent, StartFlags::default()).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("{} agent started successfully", agent),
        "agent_status": status,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

pub async fn stop_agent(
    State(state): State<Arc<OrchestratorState>>,
    Json(request): Json<AgentRequest>,
) -> Result<Json<Value>, ApiError> {
    let agent = request.agent()?;
    state.supervisor.stop(agent).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("{} agent stopped successfully", agent),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

pub async fn restart_agent(
    State(state): State<Arc<OrchestratorState>>,
    Json(request): Json<AgentRequest>,
) -> Result<Json<Value>, ApiError> {
    let agent = request.agent()?;
    let status = state.supervisor.restart(agent, RestartCause::Operator).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("{} agent restarted successfully", agent),
        "agent_status": status,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

pub async fn refresh_all_agents(
    State(state): State<Arc<OrchestratorState>>,
    body: Option<Json<RefreshRequest>>,
) -> Json<Value> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    // No stage may run against an agent that is being recycled.
    let pipeline_stopped = state.coordinator.stop_continuous();
    tracing::info!(
        "Refreshing all agents (clear_context: {}, staggered: {})",
        request.clear_context,
        request.staggered
    );

    let results = state
        .supervisor
        .refresh_all(request.clear_context, request.staggered)
        .await;
    let failed = results.iter().filter(|r| r.status == "failed").count();

    Json(json!({
        "action": "refresh_all_agents",
        "status": if failed == 0 { "completed" } else { "completed_with_errors" },
        "results": results,
        "contextCleared": request.clear_context,
        "staggered": request.staggered,
        "pipelineStopped": pipeline_stopped,
        "message": format!("{} of {} agents refreshed", results.len() - failed, results.len()),
    }))
}

/// Recycles one agent so it comes back with an empty context window.
pub async fn restart_agent_context(
    State(state): State<Arc<OrchestratorState>>,
    Path(agent_type): Path<String>,
    body: Option<Json<ContextRestartRequest>>,
) -> Result<Json<Value>, ApiError> {
    let agent: AgentType = agent_type.parse()?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    tracing::info!("Context restart for {} (clear_context: {})", agent, request.clear_context);

    let status = state
        .supervisor
        .restart(
            agent,
            RestartCause::ContextRefresh {
                clear_context: request.clear_context,
            },
        )
        .await?;

    Ok(Json(json!({
        "action": "restart_agent_context",
        "agentType": agent,
        "status": "restarted_fresh",
        "pid": status.pid,
        "port": status.port,
        "contextCleared": status.context_cleared,
        "restartCount": status.restart_count,
        "performance_optimization": "context_window_reset",
    })))
}

pub async fn agent_status(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    Json(json!({
        "continuous_mode": state.coordinator.continuous_running(),
        "agents": state.supervisor.statuses(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn agents_health(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    let mut agents = serde_json::Map::new();
    let mut all_healthy = true;

    for (agent, port, health) in state.coordinator.poll_agents().await {
        let entry = match health {
            Ok(report) => {
                all_healthy &= report.is_healthy();
                json!({
                    "status": report.status,
                    "port": port,
                    "agent": report.agent,
                    "processed": report.processed,
                    "errors": report.errors,
                    "timestamp": report.timestamp,
                })
            }
            Err(e) => {
                all_healthy = false;
                let status = if e.is_timeout() { "timeout" } else { "unreachable" };
                json!({ "status": status, "port": port, "error": e.to_string() })
            }
        };
        agents.insert(agent.as_str().to_string(), entry);
    }

    Json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "agents": agents,
        "overall_status": if all_healthy { "all_healthy" } else { "some_issues" },
    }))
}

// ---- Tokens ----

async fn live_token_usage(state: &OrchestratorState) -> HashMap<AgentType, TokenUsage> {
    let fetches = state.config.agents.iter().map(|descriptor| async move {
        (descriptor.agent_type, state.client.tokens(descriptor.port).await.ok())
    });
    futures::future::join_all(fetches)
        .await
        .into_iter()
        .filter_map(|(agent, usage)| usage.map(|u| (agent, u)))
        .collect()
}

fn degradation_risk(utilization: f64) -> &'static str {
    if utilization > 90.0 {
        "high"
    } else if utilization > 70.0 {
        "medium"
    } else {
        "low"
    }
}

pub async fn token_usage(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    let live = live_token_usage(&state).await;
    let agent_limit = state.config.agent_token_limit;

    let mut agents = serde_json::Map::new();
    for descriptor in &state.config.agents {
        let agent = descriptor.agent_type;
        let usage = live
            .get(&agent)
            .cloned()
            .unwrap_or_else(|| TokenUsage::empty(agent.agent_name(), agent_limit));
        let communication = state.coordinator.communication_usage(agent);

        agents.insert(
            agent.as_str().to_string(),
            json!({
                "agent_tokens": usage,
                "communication_tokens": communication,
                "token_limit": agent_limit,
                "restart_recommended": usage.restart_recommended,
                "tokens_remaining": agent_limit.saturating_sub(usage.total_tokens),
                "reachable": live.contains_key(&agent),
            }),
        );
    }

    let orchestrator = state.coordinator.tracker().usage();
    Json(json!({
        "agent_token_usage": agents,
        "orchestrator_token_usage": {
            "total_tokens": orchestrator.total_tokens,
            "token_limit": orchestrator.token_limit,
            "utilization_percent": orchestrator.usage_percentage.round(),
            "restart_recommended": orchestrator.restart_recommended,
            "tokens_until_restart": orchestrator.tokens_remaining,
            "kind": "communication_overhead_estimate",
        },
        "token_limits": {
            "agent_limit": agent_limit,
            "orchestrator_limit": state.config.orchestrator_token_limit,
        },
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn context_performance(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    let live = live_token_usage(&state).await;
    let now = Utc::now();

    let mut agents = serde_json::Map::new();
    let mut risks = Vec::new();
    let mut high_usage = Vec::new();

    for status in state.supervisor.statuses() {
        let agent = status.agent_type;
        if !status.running {
            agents.insert(
                agent.as_str().to_string(),
                json!({
                    "running": false,
                    "state": status.state,
                    "context_degradation_risk": "none",
                    "token_usage": 0,
                    "token_utilization_percent": 0,
                }),
            );
            continue;
        }

        let usage = live.get(&agent).cloned().or(status.last_token_usage.clone());
        let utilization = usage.as_ref().map_or(0.0, |u| u.usage_percentage);
        let risk = degradation_risk(utilization);
        risks.push(risk);
        if utilization > 90.0 {
            high_usage.push(agent.as_str());
        }

        agents.insert(
            agent.as_str().to_string(),
            json!({
                "running": true,
                "uptime_hours": status.started_at.map_or(0, |t| (now - t).num_hours()),
                "restart_count": status.restart_count,
                "token_usage": usage.as_ref().map_or(0, |u| u.total_tokens),
                "token_limit": state.config.agent_token_limit,
                "token_utilization_percent": utilization.round(),
                "tokens_remaining": usage.as_ref().map_or(state.config.agent_token_limit, |u| u.tokens_remaining),
                "context_degradation_risk": risk,
                "recommended_action": if utilization > 90.0 {
                    "token_restart_required"
                } else if utilization > 70.0 {
                    "token_restart_recommended"
                } else {
                    "none"
                },
                "last_token_reset": usage.as_ref().map(|u| u.last_reset),
                "manual_intervention_required": status.manual_intervention_required,
            }),
        );
    }

    let orchestrator = state.coordinator.tracker().usage();
    let orchestrator_risk = degradation_risk(orchestrator.usage_percentage);
    risks.push(orchestrator_risk);
    let overall = if risks.contains(&"high") {
        "high"
    } else if risks.contains(&"medium") {
        "medium"
    } else {
        "low"
    };

    Json(json!({
        "context_performance": agents,
        "orchestrator_context": {
            "uptime_hours": (now - state.started_at).num_hours(),
            "token_usage": orchestrator.total_tokens,
            "token_limit": orchestrator.token_limit,
            "token_utilization_percent": orchestrator.usage_percentage.round(),
            "tokens_remaining": orchestrator.tokens_remaining,
            "context_degradation_risk": orchestrator_risk,
            "restart_count": state.restart_count(),
            "recommended_action": if orchestrator.usage_percentage > 90.0 {
                "orchestrator_restart_required"
            } else if orchestrator.usage_percentage > 70.0 {
                "orchestrator_restart_recommended"
            } else {
                "none"
            },
        },
        "overall_degradation_risk": overall,
        "recommendations": {
            "restart_agents_high_tokens": high_usage,
            "restart_orchestrator": orchestrator.usage_percentage > 90.0,
        },
        "token_limits": {
            "agent_limit": state.config.agent_token_limit,
            "orchestrator_limit": state.config.orchestrator_token_limit,
        },
        "timestamp": now.to_rfc3339(),
    }))
}

// ---- Orchestrator handoff ----

pub async fn orchestrator_handoff(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    let report = state.handoff_report();
    tracing::info!(
        "Handoff report generated: {} active agents, pipeline {}",
        report.essential_metrics.active_agent_count,
        report.critical_state.pipeline_status
    );
    Json(json!({
        "action": "orchestrator_handoff",
        "status": "report_generated",
        "handoff_report": report,
        "next_actions": {
            "restart_orchestrator": "use_handoff_report_for_context_restoration",
            "restore_critical_state": "maintain_agent_coordination",
            "continue_mission": "islamic_text_processing_workflow",
        },
    }))
}

pub async fn orchestrator_restore(
    State(state): State<Arc<OrchestratorState>>,
    body: Option<Json<RestoreRequest>>,
) -> Result<Json<Value>, ApiError> {
    let report = body
        .and_then(|Json(r)| r.handoff_report)
        .ok_or(ApiError::MissingHandoffReport)?;
    let restored = state.restore(&report);
    Ok(Json(json!({
        "action": "orchestrator_restore",
        "status": "context_restored",
        "restored_state": restored,
        "mission_status": "context_optimized_and_ready",
    })))
}

// ---- Reservoir ----

pub async fn initialize_reservoir(State(state): State<Arc<OrchestratorState>>) -> Result<Json<Value>, ApiError> {
    let init = state.reservoir.initialize_from_queue().await?;
    Ok(Json(json!({
        "success": true,
        "processed_count": init.processed_count,
        "reservoir_entries": init.reservoir_entries,
        "message": format!("Added {} books to reservoir", init.processed_count),
    })))
}

pub async fn reservoir_status(State(state): State<Arc<OrchestratorState>>) -> Result<Json<Value>, ApiError> {
    let counts = state.reservoir.stage_counts().await?;
    let total: u64 = counts.values().sum();
    Ok(Json(json!({
        "success": true,
        "stage_counts": counts,
        "total_books": total,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

// ---- Diagnostics ----

pub async fn system_errors(
    State(state): State<Arc<OrchestratorState>>,
    Query(query): Query<ErrorQuery>,
) -> Json<Value> {
    let errors = state.errors.recent(query.limit.unwrap_or(20), query.severity);
    Json(json!({
        "errors": errors,
        "total_errors": state.errors.len(),
        "error_breakdown": state.errors.breakdown(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn clear_errors(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    let cleared = state.errors.clear();
    Json(json!({
        "success": true,
        "message": format!("Cleared {} system errors", cleared),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn ws_events(
    State(state): State<Arc<OrchestratorState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(socket: WebSocket, state: Arc<OrchestratorState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();

    // Current picture first, then every event as it happens.
    let snapshot = json!({
        "type": "agent_status",
        "agents": state.supervisor.statuses(),
        "timestamp": Utc::now().to_rfc3339(),
    });
    if sender.send(Message::Text(snapshot.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                        tracing::info!("Client disconnected from event stream");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::warn!("Unserializable event skipped: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(text)).await.is_err() {
                            tracing::info!("Failed to send event, client disconnected");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event stream lagged, {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}
