// [[ASSEMBLY]]/apps/orchestrator-server/src/state.rs
// Purpose: The one owner of orchestrator state, shared by handlers and timers.
// Architecture: Application State Layer
// Dependencies: tokio-util

use assembly_core::{Reservoir, TokenTracker};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent_client::AgentClient;
use crate::config::OrchestratorConfig;
use crate::coordinator::PipelineCoordinator;
use crate::events::{AssemblyEvent, EventBus, EventType};
use crate::handoff::{
    ActiveAgent, CriticalState, EssentialMetrics, HandoffReport, MissionCriticalInfo, RestoredState,
    DEGRADED_CRITICAL_ERRORS, DEGRADED_UPTIME_HOURS,
};
use crate::observability::ErrorLog;
use crate::supervisor::ProcessSupervisor;

pub struct OrchestratorState {
    pub config: Arc<OrchestratorConfig>,
    pub client: AgentClient,
    pub supervisor: Arc<ProcessSupervisor>,
    pub coordinator: Arc<PipelineCoordinator>,
    pub reservoir: Arc<dyn Reservoir>,
    pub events: EventBus,
    pub errors: Arc<ErrorLog>,
    pub started_at: DateTime<Utc>,
    /// How many predecessors handed off to this orchestrator.
    restart_count: AtomicU32,
    monitor: CancellationToken,
}

impl OrchestratorState {
    pub fn new(config: OrchestratorConfig, reservoir: Arc<dyn Reservoir>) -> Arc<Self> {
        let config = Arc::new(config);
        let client = AgentClient::new(config.agent_host.clone(), config.health_timeout, config.stage_timeout);
        let events = EventBus::new(256);
        let errors = Arc::new(ErrorLog::default());

        let supervisor = Arc::new(ProcessSupervisor::new(
            config.clone(),
            client.clone(),
            events.clone(),
            errors.clone(),
        ));
        let tracker = Arc::new(TokenTracker::new("orchestrator", config.orchestrator_token_limit));
        let coordinator = Arc::new(PipelineCoordinator::new(
            config.clone(),
            client.clone(),
            reservoir.clone(),
            supervisor.clone(),
            tracker,
            events.clone(),
            errors.clone(),
        ));

        Arc::new(OrchestratorState {
            config,
            client,
            supervisor,
            coordinator,
            reservoir,
            events,
            errors,
            started_at: Utc::now(),
            restart_count: AtomicU32::new(0),
            monitor: CancellationToken::new(),
        })
    }

    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        self.supervisor.spawn_health_monitor(self.monitor.child_token())
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    /// Everything a successor needs to carry on where this orchestrator stops.
    pub fn handoff_report(&self) -> HandoffReport {
        let now = Utc::now();
        let statuses = self.supervisor.statuses();
        let breakdown = self.errors.breakdown();
        let logged = self.errors.len();
        let pipeline_running = self.coordinator.continuous_running();

        let running: Vec<_> = statuses.iter().filter(|s| s.running).collect();
        let active_agents = running
            .iter()
            .map(|s| {
                (
                    s.agent_type.as_str().to_string(),
                    ActiveAgent {
                        pid: s.pid,
                        port: s.port,
                        started_at: s.started_at,
                        restart_count: s.restart_count,
                    },
                )
            })
            .collect();
        let must_restart = running
            .iter()
            .filter(|s| s.started_at.map_or(false, |t| (now - t).num_hours() >= DEGRADED_UPTIME_HOURS))
            .map(|s| s.agent_type)
            .collect();

        HandoffReport {
            handoff_timestamp: now,
            orchestrator_restart_count: self.restart_count(),
            previous_uptime_hours: (now - self.started_at).num_hours(),
            orchestrator_tokens_used: self.coordinator.tracker().usage().total_tokens,
            critical_state: CriticalState {
                active_agents,
                pipeline_status: if pipeline_running { "running" } else { "stopped" }.to_string(),
                error_count: logged,
                performance_degradation_detected: breakdown.critical > DEGRADED_CRITICAL_ERRORS,
            },
            essential_metrics: EssentialMetrics {
                total_processed: self.coordinator.total_processed(),
                orchestration_runs: self.coordinator.runs(),
                active_agent_count: running.len(),
                error_rate: if logged == 0 {
                    0.0
                } else {
                    breakdown.critical as f64 / logged as f64
                },
            },
            mission_critical_info: MissionCriticalInfo {
                must_restart_agents_if_degraded: must_restart,
                pipeline_continuation_ready: pipeline_running,
            },
        }
    }

    /// Adopts a predecessor's counters and pipeline mode. The communication
    /// tracker starts over, since this process has its own context.
    pub fn restore(&self, report: &HandoffReport) -> RestoredState {
        let restart_count = report.orchestrator_restart_count.saturating_add(1);
        self.restart_count.store(restart_count, Ordering::Relaxed);
        self.coordinator.restore_totals(
            report.essential_metrics.orchestration_runs,
            report.essential_metrics.total_processed,
        );
        self.coordinator.tracker().reset();

        let pipeline_running = if report.pipeline_was_running() {
            self.coordinator.start_continuous();
            true
        } else {
            self.coordinator.continuous_running()
        };

        tracing::info!(
            "Restored from handoff: restart {}, {} runs, {} books processed",
            restart_count,
            report.essential_metrics.orchestration_runs,
            report.essential_metrics.total_processed
        );
        let restored = RestoredState {
            restart_count,
            total_processed: report.essential_metrics.total_processed,
            orchestration_runs: report.essential_metrics.orchestration_runs,
            pipeline_running,
        };
        self.events
            .publish(AssemblyEvent::system(EventType::OrchestratorRestored, json!(restored)));
        restored
    }

    /// Timers first, then the agents.
    pub async fn shutdown(&self) {
        tracing::info!("Orchestrator shutting down");
        self.monitor.cancel();
        self.coordinator.stop_continuous();
        self.supervisor.shutdown().await;
    }
}
