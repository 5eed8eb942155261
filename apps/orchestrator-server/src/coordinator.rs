// [[ASSEMBLY]]/apps/orchestrator-server/src/coordinator.rs
// Purpose: One pass of the five-stage assembly line, plus continuous mode.
// Architecture: Orchestration Layer
// Dependencies: AgentClient, Reservoir, ProcessSupervisor, tokio-util

use assembly_core::tokens::estimate_tokens;
use assembly_core::{AgentType, HealthReport, ProcessRequest, Reservoir, TokenTracker, PIPELINE_ORDER};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::agent_client::AgentClient;
use crate::config::OrchestratorConfig;
use crate::error::{AgentCallError, CoordinatorError};
use crate::events::{AssemblyEvent, EventBus, EventType};
use crate::observability::ErrorLog;
use crate::supervisor::ProcessSupervisor;

/// Keys every `/process` answer should carry. Checked, never enforced.
const EXPECTED_STAGE_KEYS: [&str; 2] = ["success", "processed"];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StageError {
    pub stage: String,
    pub error: String,
    /// Advisory follow-up only. No fallback work is done for a failed stage.
    pub recovery: String,
}

/// Books processed per enhancement category, keyed by
/// `AgentType::enhancement_category`. Every category is present, zero or not.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct EnhancementSummary {
    counts: BTreeMap<&'static str, u64>,
}

impl Default for EnhancementSummary {
    fn default() -> Self {
        EnhancementSummary {
            counts: PIPELINE_ORDER
                .iter()
                .map(|agent| (agent.enhancement_category(), 0))
                .collect(),
        }
    }
}

impl EnhancementSummary {
    pub fn record(&mut self, agent: AgentType, processed: u64) {
        *self.counts.entry(agent.enhancement_category()).or_default() += processed;
    }

    pub fn get(&self, category: &str) -> u64 {
        self.counts.get(category).copied().unwrap_or(0)
    }

    /// Categories (out of five) that produced at least one item.
    pub fn categories_with_output(&self) -> usize {
        self.counts.values().filter(|n| **n > 0).count()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QualityMetrics {
    pub stages_completed: u32,
    pub stages_attempted: u32,
    pub total_books_processed: u64,
    pub error_rate: f64,
    pub enhancement_completeness: f64,
    pub overall_score: f64,
    pub overall_grade: char,
}

impl QualityMetrics {
    pub fn compute(
        summary: &EnhancementSummary,
        agents_run: u32,
        stages_attempted: u32,
        error_count: usize,
        books_processed: u64,
    ) -> Self {
        let completeness = summary.categories_with_output() as f64 / PIPELINE_ORDER.len() as f64;
        let error_rate = error_count as f64 / stages_attempted.max(1) as f64;
        let coverage = (agents_run as f64 / PIPELINE_ORDER.len() as f64).min(1.0);
        let score = 0.5 * completeness + 0.3 * (1.0 - error_rate) + 0.2 * coverage;

        QualityMetrics {
            stages_completed: agents_run,
            stages_attempted,
            total_books_processed: books_processed,
            error_rate,
            enhancement_completeness: completeness,
            overall_score: score,
            overall_grade: grade(score),
        }
    }
}

pub fn grade(score: f64) -> char {
    if score >= 0.8 {
        'A'
    } else if score >= 0.6 {
        'B'
    } else if score >= 0.4 {
        'C'
    } else {
        'D'
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub success: bool,
    pub agents_run: u32,
    pub stages_attempted: u32,
    pub books_processed: u64,
    pub errors: Vec<StageError>,
    pub stage_results: BTreeMap<String, Value>,
    pub enhancement_summary: EnhancementSummary,
    pub quality_metrics: QualityMetrics,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Estimated orchestrator-to-agent traffic. Never drives recycling.
#[derive(Debug, Clone, Serialize)]
pub struct CommunicationUsage {
    pub total_tokens: u64,
    pub request_count: u64,
    pub last_reset: DateTime<Utc>,
}

impl Default for CommunicationUsage {
    fn default() -> Self {
        CommunicationUsage {
            total_tokens: 0,
            request_count: 0,
            last_reset: Utc::now(),
        }
    }
}

pub struct PipelineCoordinator {
    config: Arc<OrchestratorConfig>,
    client: AgentClient,
    reservoir: Arc<dyn Reservoir>,
    supervisor: Arc<ProcessSupervisor>,
    tracker: Arc<TokenTracker>,
    communication: DashMap<AgentType, CommunicationUsage>,
    events: EventBus,
    errors: Arc<ErrorLog>,
    // Only one run at a time, whoever triggers it.
    run_gate: Mutex<()>,
    runs: AtomicU64,
    total_processed: AtomicU64,
    last_run_at: std::sync::Mutex<Option<DateTime<Utc>>>,
    continuous: std::sync::Mutex<Option<CancellationToken>>,
}

impl PipelineCoordinator {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        client: AgentClient,
        reservoir: Arc<dyn Reservoir>,
        supervisor: Arc<ProcessSupervisor>,
        tracker: Arc<TokenTracker>,
        events: EventBus,
        errors: Arc<ErrorLog>,
    ) -> Self {
        PipelineCoordinator {
            config,
            client,
            reservoir,
            supervisor,
            tracker,
            communication: DashMap::new(),
            events,
            errors,
            run_gate: Mutex::new(()),
            runs: AtomicU64::new(0),
            total_processed: AtomicU64::new(0),
            last_run_at: std::sync::Mutex::new(None),
            continuous: std::sync::Mutex::new(None),
        }
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::Relaxed)
    }

    pub fn last_run_at(&self) -> Option<DateTime<Utc>> {
        self.last_run_at.lock().ok().and_then(|t| *t)
    }

    /// Carries totals over from a handoff report.
    pub fn restore_totals(&self, runs: u64, total_processed: u64) {
        self.runs.store(runs, Ordering::Relaxed);
        self.total_processed.store(total_processed, Ordering::Relaxed);
    }

    pub fn tracker(&self) -> &TokenTracker {
        &self.tracker
    }

    pub fn communication_usage(&self, agent: AgentType) -> CommunicationUsage {
        self.communication
            .get(&agent)
            .map(|u| u.clone())
            .unwrap_or_default()
    }

    /// Concurrent `/health` check of every configured agent.
    pub async fn poll_agents(&self) -> Vec<(AgentType, u16, Result<HealthReport, AgentCallError>)> {
        let checks = self.config.agents.iter().map(|descriptor| async move {
            let result = self.client.health(descriptor.port).await;
            (descriptor.agent_type, descriptor.port, result)
        });
        futures::future::join_all(checks).await
    }

    async fn check_readiness(&self) -> Result<(), CoordinatorError> {
        let mut issues = Vec::new();
        for (agent, port, health) in self.poll_agents().await {
            match health {
                Ok(report) if report.is_healthy() => {}
                Ok(report) => issues.push(format!("{} (port {}) reported status '{}'", agent, port, report.status)),
                Err(e) => issues.push(format!("{} (port {}): {}", agent, port, e)),
            }
        }
        if let Err(e) = self.reservoir.ping().await {
            issues.push(format!("reservoir: {}", e));
        }

        if issues.is_empty() {
            return Ok(());
        }
        self.errors
            .record("pipeline_readiness", issues.join("; "), "start_agents");
        Err(CoordinatorError::NotReady { issues })
    }

    /// Readiness, then every configured stage in pipeline order. A stage
    /// failure is recorded and the run moves on; only readiness aborts.
    pub async fn run_once(&self) -> Result<RunResult, CoordinatorError> {
        let _gate = self.run_gate.lock().await;
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();

        self.check_readiness().await?;

        tracing::info!("Assembly run {} starting", run_id);
        self.events
            .publish(AssemblyEvent::run(EventType::RunStarted, &run_id, None, json!({})));

        let stages: Vec<_> = PIPELINE_ORDER
            .iter()
            .filter_map(|agent| self.config.descriptor(*agent).cloned())
            .collect();

        let mut agents_run = 0u32;
        let mut stages_attempted = 0u32;
        let mut books_processed = 0u64;
        let mut errors = Vec::new();
        let mut stage_results = BTreeMap::new();
        let mut summary = EnhancementSummary::default();

        for (index, descriptor) in stages.iter().enumerate() {
            let agent = descriptor.agent_type;
            stages_attempted += 1;

            let request = ProcessRequest::coordinated(json!({
                "run_id": run_id,
                "stage": agent.as_str(),
                "stage_number": index + 1,
                "agent": descriptor.name,
                "expected_output": descriptor.expected_output,
                "methodology": descriptor.methodology,
                "params": agent.coordination_params(),
            }));
            let request_text = serde_json::to_string(&request).unwrap_or_default();

            tracing::info!("Stage {}/{}: {}", index + 1, stages.len(), descriptor.name);
            match self.client.process(descriptor.port, &request).await {
                Ok(reply) => {
                    self.account_communication(agent, &request_text, &reply.text);
                    validate_stage_reply(agent, &reply.body);

                    let processed = reply.body.get("processed").and_then(Value::as_u64).unwrap_or(0);
                    agents_run += 1;
                    books_processed += processed;
                    summary.record(agent, processed);
                    stage_results.insert(agent.as_str().to_string(), reply.body);

                    tracing::info!("{} processed {} books", agent, processed);
                    self.events.publish(AssemblyEvent::run(
                        EventType::StageCompleted,
                        &run_id,
                        Some(agent),
                        json!({ "processed": processed }),
                    ));
                    self.supervisor.schedule_token_check(agent);
                }
                Err(e) => {
                    self.account_communication(agent, &request_text, "");
                    let stage_error = StageError {
                        stage: agent.as_str().to_string(),
                        error: e.to_string(),
                        recovery: agent.recovery_label().to_string(),
                    };
                    self.errors.record(
                        "pipeline_stage",
                        format!("{}: {}", agent, stage_error.error),
                        agent.recovery_label(),
                    );
                    self.events.publish(AssemblyEvent::run(
                        EventType::StageFailed,
                        &run_id,
                        Some(agent),
                        json!(stage_error),
                    ));
                    errors.push(stage_error);
                }
            }

            if index + 1 < stages.len() {
                let pause = self.pacing_after(agent);
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        }

        let quality_metrics =
            QualityMetrics::compute(&summary, agents_run, stages_attempted, errors.len(), books_processed);
        let finished_at = Utc::now();

        self.runs.fetch_add(1, Ordering::Relaxed);
        self.total_processed.fetch_add(books_processed, Ordering::Relaxed);
        if let Ok(mut last) = self.last_run_at.lock() {
            *last = Some(finished_at);
        }

        tracing::info!(
            "Assembly run {} complete: {}/{} stages, {} books, {} errors, grade {}",
            run_id,
            agents_run,
            stages_attempted,
            books_processed,
            errors.len(),
            quality_metrics.overall_grade
        );
        self.events.publish(AssemblyEvent::run(
            EventType::RunCompleted,
            &run_id,
            None,
            json!({
                "agents_run": agents_run,
                "books_processed": books_processed,
                "errors": errors.len(),
                "grade": quality_metrics.overall_grade,
            }),
        ));

        Ok(RunResult {
            run_id,
            success: true,
            agents_run,
            stages_attempted,
            books_processed,
            errors,
            stage_results,
            enhancement_summary: summary,
            quality_metrics,
            started_at,
            finished_at,
        })
    }

    /// Longer pauses after the data-heavy stages.
    fn pacing_after(&self, agent: AgentType) -> Duration {
        if !self.config.stage_pacing {
            return Duration::ZERO;
        }
        match agent {
            AgentType::Flowchart | AgentType::Network => Duration::from_millis(500),
            AgentType::Metadata | AgentType::Synthesis => Duration::from_millis(1000),
            AgentType::Pipeline => Duration::ZERO,
        }
    }

    fn account_communication(&self, agent: AgentType, request: &str, response: &str) {
        let request_tokens = estimate_tokens(request);
        let response_tokens = estimate_tokens(response);
        let was_over = self.tracker.usage().restart_recommended;
        let usage = self.tracker.record(request_tokens, response_tokens);
        if usage.restart_recommended && !was_over {
            self.errors.record(
                "orchestrator_context",
                format!(
                    "orchestrator token ceiling reached ({}/{})",
                    usage.total_tokens, usage.token_limit
                ),
                "orchestrator_handoff",
            );
            self.events.publish(AssemblyEvent::system(
                EventType::OrchestratorHandoffRecommended,
                json!({ "total_tokens": usage.total_tokens, "token_limit": usage.token_limit }),
            ));
        }

        let mut usage = self.communication.entry(agent).or_default();
        usage.total_tokens += request_tokens + response_tokens;
        usage.request_count += 1;
    }

    // ---- Continuous mode ----

    pub fn continuous_running(&self) -> bool {
        self.continuous.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Returns false when continuous mode was already on.
    pub fn start_continuous(self: &Arc<Self>) -> bool {
        let token = {
            let Ok(mut slot) = self.continuous.lock() else {
                return false;
            };
            if slot.is_some() {
                return false;
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.config.continuous_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            tracing::info!("Continuous mode every {:?}", coordinator.config.continuous_interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match coordinator.run_once().await {
                            Ok(result) => tracing::info!(
                                "Continuous run {}: {} books, grade {}",
                                result.run_id,
                                result.books_processed,
                                result.quality_metrics.overall_grade
                            ),
                            Err(e) => {
                                coordinator.errors.record("continuous_mode", &e, "retry_next_interval");
                            }
                        }
                    }
                }
            }
            tracing::info!("Continuous mode stopped");
        });
        true
    }

    /// Returns false when continuous mode was not running.
    pub fn stop_continuous(&self) -> bool {
        match self.continuous.lock() {
            Ok(mut slot) => match slot.take() {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}

fn validate_stage_reply(agent: AgentType, body: &Value) {
    let missing: Vec<&str> = EXPECTED_STAGE_KEYS
        .iter()
        .copied()
        .filter(|key| body.get(key).is_none())
        .collect();
    if !missing.is_empty() {
        tracing::warn!("{} reply lacks {:?}; keeping it anyway", agent, missing);
    }
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        tracing::warn!("{} reported success=false", agent);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assembly_core::{AgentDescriptor, ReservoirBook, ReservoirError, ReservoirInit};
    use std::sync::atomic::AtomicU32;
    use async_trait::async_trait;
    use axum::{
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };

    pub struct StaticReservoir {
        pub reachable: bool,
    }

    #[async_trait]
    impl Reservoir for StaticReservoir {
        async fn ping(&self) -> Result<(), ReservoirError> {
            if self.reachable {
                Ok(())
            } else {
                Err(ReservoirError::NotConfigured)
            }
        }

        async fn books_ready_for(&self, _agent: AgentType) -> Result<Vec<ReservoirBook>, ReservoirError> {
            Ok(Vec::new())
        }

        async fn update_entry(&self, _id: &str, _patch: Value) -> Result<(), ReservoirError> {
            Ok(())
        }

        async fn initialize_from_queue(&self) -> Result<ReservoirInit, ReservoirError> {
            Ok(ReservoirInit {
                processed_count: 3,
                reservoir_entries: 3,
            })
        }

        async fn stage_counts(&self) -> Result<BTreeMap<String, u64>, ReservoirError> {
            Ok(BTreeMap::from([("flowchart".to_string(), 3)]))
        }
    }

    /// `Some(n)`: healthy agent that reports `n` processed books.
    /// `None`: healthy agent whose `/process` answers HTTP 500.
    pub async fn mock_agent(processed: Option<u64>) -> u16 {
        let app = Router::new()
            .route("/health", get(|| async { Json(json!({"status": "healthy", "processed": 0, "errors": 0})) }))
            .route(
                "/process",
                post(move || async move {
                    match processed {
                        Some(n) => Ok(Json(json!({
                            "success": true,
                            "processed": n,
                            "results": [],
                            "total_processed": n,
                            "total_errors": 0
                        }))),
                        None => Err((StatusCode::INTERNAL_SERVER_ERROR, "llm cli crashed")),
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    pub fn test_config(agents: Vec<(AgentType, u16)>) -> OrchestratorConfig {
        OrchestratorConfig {
            agents: agents
                .into_iter()
                .map(|(agent, port)| AgentDescriptor::default_for(agent).with_port(port))
                .collect(),
            health_timeout: Duration::from_millis(500),
            stage_timeout: Duration::from_secs(5),
            stage_pacing: false,
            token_recycle_delay: Duration::ZERO,
            ..OrchestratorConfig::default()
        }
    }

    pub fn coordinator(config: OrchestratorConfig, reachable: bool) -> Arc<PipelineCoordinator> {
        let tracker = Arc::new(TokenTracker::new("orchestrator", config.orchestrator_token_limit));
        let config = Arc::new(config);
        let client = AgentClient::new("127.0.0.1", config.health_timeout, config.stage_timeout);
        let events = EventBus::new(64);
        let errors = Arc::new(ErrorLog::default());
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.clone(),
            client.clone(),
            events.clone(),
            errors.clone(),
        ));
        Arc::new(PipelineCoordinator::new(
            config,
            client,
            Arc::new(StaticReservoir { reachable }),
            supervisor,
            tracker,
            events,
            errors,
        ))
    }

    async fn five_agents(failing: Option<AgentType>) -> Vec<(AgentType, u16)> {
        let mut agents = Vec::new();
        for agent in PIPELINE_ORDER {
            let processed = if Some(agent) == failing { None } else { Some(2) };
            agents.push((agent, mock_agent(processed).await));
        }
        agents
    }

    #[tokio::test]
    async fn test_full_run_grades_a() {
        let coordinator = coordinator(test_config(five_agents(None).await), true);

        let result = coordinator.run_once().await.unwrap();
        assert!(result.success);
        assert_eq!(result.agents_run, 5);
        assert_eq!(result.books_processed, 10);
        assert!(result.errors.is_empty());
        assert_eq!(result.stage_results.len(), 5);
        assert_eq!(result.quality_metrics.overall_grade, 'A');
        assert_eq!(result.enhancement_summary.get("production_records_created"), 2);

        assert_eq!(coordinator.runs(), 1);
        assert_eq!(coordinator.total_processed(), 10);
        assert!(coordinator.tracker().usage().total_tokens > 0);
        assert_eq!(coordinator.communication_usage(AgentType::Network).request_count, 1);
    }

    #[tokio::test]
    async fn test_single_stage_failure_is_not_fatal() {
        let coordinator = coordinator(test_config(five_agents(Some(AgentType::Metadata)).await), true);

        let result = coordinator.run_once().await.unwrap();
        assert!(result.success);
        assert_eq!(result.agents_run, 4);
        assert_eq!(result.stages_attempted, 5);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].stage, "metadata");
        assert_eq!(result.errors[0].recovery, "rerun_metadata_research_next_run");
        assert!(result.errors[0].error.contains("500"));
        assert_eq!(result.books_processed, 8);
        assert!(!result.stage_results.contains_key("metadata"));
    }

    #[tokio::test]
    async fn test_three_agents_with_network_down() {
        let agents = vec![
            (AgentType::Flowchart, mock_agent(Some(3)).await),
            (AgentType::Network, mock_agent(None).await),
            (AgentType::Metadata, mock_agent(Some(4)).await),
        ];
        let coordinator = coordinator(test_config(agents), true);

        let result = coordinator.run_once().await.unwrap();
        assert!(result.stage_results.contains_key("flowchart"));
        assert!(result.stage_results.contains_key("metadata"));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].stage, "network");
        assert_eq!(result.books_processed, 7);
        assert_eq!(result.agents_run, 2);
    }

    #[tokio::test]
    async fn test_readiness_failure_lists_issues() {
        let dead_port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let agents = vec![
            (AgentType::Flowchart, mock_agent(Some(1)).await),
            (AgentType::Network, dead_port),
        ];
        let coordinator = coordinator(test_config(agents), false);

        match coordinator.run_once().await {
            Err(CoordinatorError::NotReady { issues }) => {
                assert_eq!(issues.len(), 2);
                assert!(issues[0].starts_with("network"));
                assert!(issues[1].starts_with("reservoir"));
            }
            Ok(_) => panic!("run should not start"),
        }
        assert_eq!(coordinator.runs(), 0);
    }

    #[test]
    fn test_grade_boundaries() {
        let mut all = EnhancementSummary::default();
        for agent in PIPELINE_ORDER {
            all.record(agent, 1);
        }
        assert_eq!(QualityMetrics::compute(&all, 5, 5, 0, 5).overall_grade, 'A');

        // Two stages attempted, both failed, nothing produced.
        let none = EnhancementSummary::default();
        let metrics = QualityMetrics::compute(&none, 0, 2, 2, 0);
        assert_eq!(metrics.error_rate, 1.0);
        assert_eq!(metrics.overall_grade, 'D');

        assert_eq!(grade(0.6), 'B');
        assert_eq!(grade(0.59), 'C');
        assert_eq!(grade(0.39), 'D');
    }

    #[tokio::test]
    async fn test_continuous_mode_toggles() {
        let coordinator = coordinator(test_config(Vec::new()), true);
        assert!(coordinator.start_continuous());
        assert!(!coordinator.start_continuous());
        assert!(coordinator.continuous_running());
        assert!(coordinator.stop_continuous());
        assert!(!coordinator.stop_continuous());
    }

    /// Healthy agent whose `/process` takes `delay` and records how many
    /// calls were in flight at once.
    async fn slow_agent(delay: Duration, in_flight: Arc<AtomicU32>, peak: Arc<AtomicU32>) -> u16 {
        let app = Router::new()
            .route("/health", get(|| async { Json(json!({"status": "healthy"})) }))
            .route(
                "/process",
                post(move || {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(delay).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Json(json!({"success": true, "processed": 1, "results": []}))
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_continuous_ticks_run_behind_manual_runs() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let port = slow_agent(Duration::from_millis(150), in_flight.clone(), peak.clone()).await;
        let mut config = test_config(vec![(AgentType::Flowchart, port)]);
        config.continuous_interval = Duration::from_millis(100);
        let coordinator = coordinator(config, true);

        assert!(coordinator.start_continuous());
        let (first, second) = tokio::join!(coordinator.run_once(), coordinator.run_once());
        assert!(first.is_ok() && second.is_ok());

        // Timer ticks keep adding runs on top of the two manual ones.
        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.runs() < 4 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("continuous mode never ran");

        assert!(coordinator.stop_continuous());
        assert_eq!(peak.load(Ordering::SeqCst), 1, "runs overlapped");
    }

    #[tokio::test]
    async fn test_orchestrator_ceiling_recommends_handoff() {
        let mut config = test_config(vec![(AgentType::Flowchart, mock_agent(Some(1)).await)]);
        config.orchestrator_token_limit = 10;
        let coordinator = coordinator(config, true);
        let mut events = coordinator.events.subscribe();

        coordinator.run_once().await.unwrap();
        coordinator.run_once().await.unwrap();
        assert!(coordinator.tracker().usage().restart_recommended);

        // Recorded once, when the ceiling is crossed.
        let recorded = coordinator.errors.recent(10, None);
        let handoffs: Vec<_> = recorded.iter().filter(|e| e.component == "orchestrator_context").collect();
        assert_eq!(handoffs.len(), 1);
        assert_eq!(handoffs[0].action, "orchestrator_handoff");

        let mut seen = false;
        while let Ok(event) = events.try_recv() {
            seen |= event.event_type == EventType::OrchestratorHandoffRecommended;
        }
        assert!(seen);

        coordinator.restore_totals(7, 40);
        assert_eq!((coordinator.runs(), coordinator.total_processed()), (7, 40));
    }
}
