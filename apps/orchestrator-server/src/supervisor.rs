// [[ASSEMBLY]]/apps/orchestrator-server/src/supervisor.rs
// Purpose: Owns every agent subprocess: spawn, health gate, stop, restart,
//          periodic health checks and token-ceiling recycling.
// Architecture: Process Lifecycle Layer
// Dependencies: tokio::process, DashMap, nix (unix signals), tokio-util

use assembly_core::{AgentDescriptor, AgentType, TokenUsage};
use chrono::{DateTime, Utc};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::agent_client::AgentClient;
use crate::config::OrchestratorConfig;
use crate::error::SupervisorError;
use crate::events::{AssemblyEvent, EventBus, EventType};
use crate::observability::ErrorLog;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Failed,
}

/// Environment flags handed to a (re)started agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StartFlags {
    pub clear_context: bool,
    pub fresh_start: bool,
    pub token_reset: bool,
}

impl StartFlags {
    pub fn fresh(clear_context: bool) -> Self {
        StartFlags {
            clear_context,
            fresh_start: true,
            token_reset: false,
        }
    }

    pub fn token_reset() -> Self {
        StartFlags {
            clear_context: true,
            fresh_start: true,
            token_reset: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    Operator,
    /// Operator restart into a fresh context (`FRESH_START`, optional `CLEAR_CONTEXT`).
    ContextRefresh { clear_context: bool },
    HealthCheck,
    TokenCeiling,
}

impl RestartCause {
    fn as_str(&self) -> &'static str {
        match self {
            RestartCause::Operator => "operator_request",
            RestartCause::ContextRefresh { .. } => "context_refresh",
            RestartCause::HealthCheck => "failed_health_check",
            RestartCause::TokenCeiling => "token_limit_exceeded",
        }
    }
}

/// Result of one health tick for one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Not supervised right now, or a lifecycle operation holds the agent.
    Skipped,
    Healthy,
    Recycled,
    Restarted,
    RestartFailed,
    ManualIntervention,
}

/// Exit code once the reaper has seen the child go away.
type ExitStatus = Option<Option<i32>>;

struct ProcessHandle {
    pid: u32,
    started_at: DateTime<Utc>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<ExitStatus>,
}

struct AgentSlot {
    descriptor: AgentDescriptor,
    state: AgentState,
    handle: Option<ProcessHandle>,
    restart_count: u32,
    manual_intervention: bool,
    /// Stopped on purpose; health checks leave it alone.
    operator_stopped: bool,
    flags: StartFlags,
    last_token_usage: Option<TokenUsage>,
    last_error: Option<String>,
}

impl AgentSlot {
    fn new(descriptor: AgentDescriptor) -> Self {
        AgentSlot {
            descriptor,
            state: AgentState::Stopped,
            handle: None,
            restart_count: 0,
            manual_intervention: false,
            operator_stopped: true,
            flags: StartFlags::default(),
            last_token_usage: None,
            last_error: None,
        }
    }

    fn status(&self) -> AgentStatus {
        AgentStatus {
            agent_type: self.descriptor.agent_type,
            name: self.descriptor.name.clone(),
            state: self.state,
            running: self.state == AgentState::Running,
            pid: self.handle.as_ref().map(|h| h.pid),
            port: self.descriptor.port,
            started_at: self.handle.as_ref().map(|h| h.started_at),
            restart_count: self.restart_count,
            context_cleared: self.flags.clear_context,
            fresh_start: self.flags.fresh_start,
            manual_intervention_required: self.manual_intervention,
            last_token_usage: self.last_token_usage.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent_type: AgentType,
    pub name: String,
    pub state: AgentState,
    pub running: bool,
    pub pid: Option<u32>,
    pub port: u16,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub context_cleared: bool,
    pub fresh_start: bool,
    pub manual_intervention_required: bool,
    pub last_token_usage: Option<TokenUsage>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    #[serde(rename = "agentType")]
    pub agent_type: AgentType,
    pub status: &'static str,
    pub pid: Option<u32>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ProcessSupervisor {
    config: Arc<OrchestratorConfig>,
    client: AgentClient,
    slots: Arc<DashMap<AgentType, AgentSlot>>,
    // Serializes start/stop/restart/health handling per agent.
    locks: HashMap<AgentType, Arc<Mutex<()>>>,
    events: EventBus,
    errors: Arc<ErrorLog>,
}

impl ProcessSupervisor {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        client: AgentClient,
        events: EventBus,
        errors: Arc<ErrorLog>,
    ) -> Self {
        let slots = DashMap::new();
        let mut locks = HashMap::new();
        for descriptor in &config.agents {
            locks.insert(descriptor.agent_type, Arc::new(Mutex::new(())));
            slots.insert(descriptor.agent_type, AgentSlot::new(descriptor.clone()));
        }

        ProcessSupervisor {
            config,
            client,
            slots: Arc::new(slots),
            locks,
            events,
            errors,
        }
    }

    /// Configured agents in pipeline order.
    pub fn configured(&self) -> Vec<AgentType> {
        self.config.agents.iter().map(|d| d.agent_type).collect()
    }

    fn lock_for(&self, agent: AgentType) -> Result<Arc<Mutex<()>>, SupervisorError> {
        self.locks
            .get(&agent)
            .cloned()
            .ok_or(SupervisorError::NotConfigured(agent))
    }

    fn slot_mut(&self, agent: AgentType) -> Result<RefMut<'_, AgentType, AgentSlot>, SupervisorError> {
        self.slots.get_mut(&agent).ok_or(SupervisorError::NotConfigured(agent))
    }

    pub fn status(&self, agent: AgentType) -> Option<AgentStatus> {
        self.slots.get(&agent).map(|slot| slot.status())
    }

    pub fn statuses(&self) -> Vec<AgentStatus> {
        self.configured()
            .into_iter()
            .filter_map(|agent| self.status(agent))
            .collect()
    }

    pub fn is_running(&self, agent: AgentType) -> bool {
        self.slots
            .get(&agent)
            .map_or(false, |slot| slot.state == AgentState::Running)
    }

    // ---- Operator entry points ----

    pub async fn start(&self, agent: AgentType, flags: StartFlags) -> Result<AgentStatus, SupervisorError> {
        let lock = self.lock_for(agent)?;
        let _guard = lock.lock().await;
        self.slot_mut(agent)?.manual_intervention = false;
        self.start_locked(agent, flags).await
    }

    pub async fn stop(&self, agent: AgentType) -> Result<(), SupervisorError> {
        let lock = self.lock_for(agent)?;
        let _guard = lock.lock().await;
        self.stop_locked(agent, true).await.map(|_| ())
    }

    pub async fn restart(&self, agent: AgentType, cause: RestartCause) -> Result<AgentStatus, SupervisorError> {
        let lock = self.lock_for(agent)?;
        let _guard = lock.lock().await;
        self.restart_locked(agent, cause).await
    }

    /// Starts every configured agent that is not already running.
    pub async fn start_all(&self) -> Vec<(AgentType, Result<AgentStatus, SupervisorError>)> {
        let mut results = Vec::new();
        for agent in self.configured() {
            if self.is_running(agent) {
                continue;
            }
            let result = self.start(agent, StartFlags::default()).await;
            if let Err(e) = &result {
                tracing::error!("Failed to start {}: {}", agent, e);
            }
            results.push((agent, result));
        }
        results
    }

    pub async fn stop_all(&self) -> Vec<(AgentType, Result<(), SupervisorError>)> {
        let mut results = Vec::new();
        for agent in self.configured() {
            let result = self.stop(agent).await;
            if let Err(e) = &result {
                tracing::error!("Failed to stop {}: {}", agent, e);
            }
            results.push((agent, result));
        }
        results
    }

    /// Stop and fresh-start every agent in pipeline order. A failure is
    /// reported for that agent and the sweep continues.
    pub async fn refresh_all(&self, clear_context: bool, staggered: bool) -> Vec<RefreshOutcome> {
        let delay = if staggered {
            self.config.refresh_delay_staggered
        } else {
            self.config.refresh_delay
        };

        let mut outcomes = Vec::new();
        for agent in self.configured() {
            let port = self.config.descriptor(agent).map_or(0, |d| d.port);
            tracing::info!("Refreshing {} (clear_context: {})", agent, clear_context);

            let result = match self.lock_for(agent) {
                Ok(lock) => {
                    let _guard = lock.lock().await;
                    match self.stop_locked(agent, false).await {
                        Ok(_) => {
                            tokio::time::sleep(delay).await;
                            if let Ok(mut slot) = self.slot_mut(agent) {
                                slot.manual_intervention = false;
                            }
                            self.start_locked(agent, StartFlags::fresh(clear_context)).await
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };

            outcomes.push(match result {
                Ok(status) => RefreshOutcome {
                    agent_type: agent,
                    status: "refreshed",
                    pid: status.pid,
                    port,
                    error: None,
                },
                Err(e) => RefreshOutcome {
                    agent_type: agent,
                    status: "failed",
                    pid: None,
                    port,
                    error: Some(e.to_string()),
                },
            });
        }
        outcomes
    }

    /// Stops everything; used at orchestrator shutdown.
    pub async fn shutdown(&self) {
        for (agent, result) in self.stop_all().await {
            if let Err(e) = result {
                tracing::warn!("{} did not shut down cleanly: {}", agent, e);
            }
        }
    }

    // ---- Lifecycle internals (callers hold the agent's lock) ----

    async fn start_locked(&self, agent: AgentType, flags: StartFlags) -> Result<AgentStatus, SupervisorError> {
        let descriptor = self
            .config
            .descriptor(agent)
            .cloned()
            .ok_or(SupervisorError::NotConfigured(agent))?;

        let has_process = self.slot_mut(agent)?.handle.is_some();
        if has_process {
            self.stop_locked(agent, false).await?;
        }

        {
            let mut slot = self.slot_mut(agent)?;
            slot.state = AgentState::Starting;
            slot.flags = flags;
            slot.operator_stopped = false;
            slot.last_error = None;
        }
        self.events.publish(AssemblyEvent::agent(
            EventType::AgentStarting,
            agent,
            json!({ "port": descriptor.port, "flags": flags }),
        ));
        tracing::info!("Starting {} agent on port {}", agent, descriptor.port);

        let child = match self.spawn_child(&descriptor, flags) {
            Ok(child) => child,
            Err(source) => {
                let reason = format!("spawn of '{}' failed: {}", self.config.agent_command, source);
                self.mark_failed(agent, &reason);
                self.errors
                    .record("agent_startup", &reason, &format!("restart_agent_{}", agent));
                return Err(SupervisorError::Spawn { agent, source });
            }
        };

        let handle = self.watch_child(agent, child);
        let pid = handle.pid;
        let mut exit_rx = handle.exit_rx.clone();
        self.slot_mut(agent)?.handle = Some(handle);

        tokio::time::sleep(self.config.settle_delay).await;

        let early_exit: ExitStatus = *exit_rx.borrow();
        let verdict = match early_exit {
            Some(code) => Err(format!("exited during startup with code {:?}", code)),
            None => match self.client.health(descriptor.port).await {
                Ok(report) if report.is_healthy() => Ok(()),
                Ok(report) => Err(format!("reported status '{}'", report.status)),
                Err(e) => Err(e.to_string()),
            },
        };

        match verdict {
            Ok(()) => {
                self.slot_mut(agent)?.state = AgentState::Running;
                tracing::info!("{} agent started successfully on port {} (pid {})", agent, descriptor.port, pid);
                self.events.publish(AssemblyEvent::agent(
                    EventType::AgentStarted,
                    agent,
                    json!({ "pid": pid, "port": descriptor.port }),
                ));
                self.status(agent).ok_or(SupervisorError::NotConfigured(agent))
            }
            Err(reason) => {
                let kill_tx = self
                    .slot_mut(agent)?
                    .handle
                    .as_mut()
                    .and_then(|h| h.kill_tx.take());
                if let Some(tx) = kill_tx {
                    let _ = tx.send(());
                }
                if !wait_for_exit(&mut exit_rx, self.config.stop_grace).await {
                    tracing::warn!("[{}:{}] did not confirm exit after a failed start", agent, pid);
                }

                self.slot_mut(agent)?.handle = None;
                self.mark_failed(agent, &reason);
                self.errors.record(
                    "agent_startup",
                    format!("{} failed health check: {}", agent, reason),
                    &format!("failed_health_check_{}", agent),
                );
                Err(SupervisorError::Unhealthy { agent, reason })
            }
        }
    }

    /// Returns whether a live process was stopped. The slot reaches `Stopped`
    /// only after the reaper confirms the exit.
    async fn stop_locked(&self, agent: AgentType, operator: bool) -> Result<bool, SupervisorError> {
        let live = {
            let mut slot = self.slot_mut(agent)?;
            match slot.handle.as_ref().map(|h| (h.pid, h.exit_rx.clone())) {
                Some(live) => {
                    slot.state = AgentState::Stopping;
                    Some(live)
                }
                None => {
                    slot.state = AgentState::Stopped;
                    slot.operator_stopped = operator;
                    None
                }
            }
        };

        let Some((pid, mut exit_rx)) = live else {
            return Ok(false);
        };

        tracing::info!("Stopping {} agent (pid {})", agent, pid);
        let mut exited = if send_sigterm(pid) {
            wait_for_exit(&mut exit_rx, self.config.stop_grace).await
        } else {
            false
        };

        if !exited {
            tracing::warn!("[{}:{}] still running after {:?}, forcing kill", agent, pid, self.config.stop_grace);
            let kill_tx = self
                .slot_mut(agent)?
                .handle
                .as_mut()
                .and_then(|h| h.kill_tx.take());
            if let Some(tx) = kill_tx {
                let _ = tx.send(());
            }
            exited = wait_for_exit(&mut exit_rx, self.config.stop_grace).await;
        }

        if !exited {
            let reason = format!("pid {} did not exit after SIGKILL", pid);
            self.mark_failed(agent, &reason);
            self.errors
                .record("process_supervisor", &reason, &format!("kill_agent_port_{}", agent));
            return Err(SupervisorError::Stop { agent, reason });
        }

        {
            let mut slot = self.slot_mut(agent)?;
            slot.handle = None;
            slot.state = AgentState::Stopped;
            slot.operator_stopped = operator;
        }
        self.events
            .publish(AssemblyEvent::agent(EventType::AgentStopped, agent, json!({ "pid": pid })));
        Ok(true)
    }

    async fn restart_locked(&self, agent: AgentType, cause: RestartCause) -> Result<AgentStatus, SupervisorError> {
        let (restart_count, flags) = {
            let mut slot = self.slot_mut(agent)?;
            if matches!(cause, RestartCause::Operator | RestartCause::ContextRefresh { .. }) {
                slot.manual_intervention = false;
            }
            slot.state = AgentState::Restarting;
            slot.restart_count += 1;
            let flags = match cause {
                RestartCause::TokenCeiling => StartFlags::token_reset(),
                RestartCause::ContextRefresh { clear_context } => StartFlags::fresh(clear_context),
                RestartCause::Operator | RestartCause::HealthCheck => StartFlags::default(),
            };
            (slot.restart_count, flags)
        };

        tracing::info!("Restarting {} ({}), attempt {}", agent, cause.as_str(), restart_count);
        self.events.publish(AssemblyEvent::agent(
            EventType::AgentRestarting,
            agent,
            json!({ "reason": cause.as_str(), "restart_count": restart_count }),
        ));

        self.stop_locked(agent, false).await?;
        tokio::time::sleep(self.config.restart_delay).await;
        self.start_locked(agent, flags).await
    }

    fn mark_failed(&self, agent: AgentType, reason: &str) {
        if let Some(mut slot) = self.slots.get_mut(&agent) {
            slot.state = AgentState::Failed;
            slot.last_error = Some(reason.to_string());
        }
        self.events.publish(AssemblyEvent::agent(
            EventType::AgentFailed,
            agent,
            json!({ "reason": reason }),
        ));
    }

    fn spawn_child(&self, descriptor: &AgentDescriptor, flags: StartFlags) -> std::io::Result<Child> {
        let mut command = Command::new(&self.config.agent_command);
        command.args(&self.config.agent_args).env_clear();
        for key in &self.config.env_passthrough {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        command
            .env("PORT", descriptor.port.to_string())
            .env("AGENT_TYPE", descriptor.agent_type.as_str())
            .env("CLEAR_CONTEXT", flags.clear_context.to_string())
            .env("FRESH_START", flags.fresh_start.to_string())
            .env("TOKEN_RESET", flags.token_reset.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.spawn()
    }

    /// Hands the child to a reaper task, which is the only owner of the
    /// process from here on.
    fn watch_child(&self, agent: AgentType, mut child: Child) -> ProcessHandle {
        let pid = child.id().unwrap_or_default();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(agent, pid, stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(agent, pid, stderr, true));
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel::<ExitStatus>(None);
        let slots = Arc::clone(&self.slots);
        let events = self.events.clone();
        let errors = Arc::clone(&self.errors);

        tokio::spawn(async move {
            // A dropped sender also means "kill": the handle is gone.
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("[{}:{}] kill failed: {}", agent, pid, e);
                    }
                    child.wait().await
                }
            };

            let code = status.as_ref().ok().and_then(|s| s.code());
            tracing::info!("[{}:{}] exited with code {:?}", agent, pid, code);
            let _ = exit_tx.send(Some(code));

            let unexpected = match slots.get_mut(&agent) {
                Some(mut slot) => {
                    let owned = slot.handle.as_ref().map(|h| h.pid) == Some(pid);
                    if owned && slot.state == AgentState::Running {
                        slot.handle = None;
                        slot.state = AgentState::Failed;
                        slot.last_error = Some(format!("exited unexpectedly with code {:?}", code));
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };

            if unexpected {
                errors.record(
                    "agent_process",
                    format!("{} (pid {}) exited unexpectedly with code {:?}", agent, pid, code),
                    &format!("restart_agent_{}", agent),
                );
                events.publish(AssemblyEvent::agent(
                    EventType::AgentExited,
                    agent,
                    json!({ "pid": pid, "code": code }),
                ));
            }
        });

        ProcessHandle {
            pid,
            started_at: Utc::now(),
            kill_tx: Some(kill_tx),
            exit_rx,
        }
    }

    // ---- Health monitoring ----

    /// One health tick over every configured agent.
    pub async fn check_all_once(&self) -> Vec<(AgentType, HealthVerdict)> {
        let agents = self.configured();
        let verdicts = futures::future::join_all(agents.iter().map(|agent| self.check_agent(*agent))).await;
        agents.into_iter().zip(verdicts).collect()
    }

    pub async fn check_agent(&self, agent: AgentType) -> HealthVerdict {
        let Ok(lock) = self.lock_for(agent) else {
            return HealthVerdict::Skipped;
        };
        // A start/stop/restart in flight owns the agent; look again next tick.
        let Ok(_guard) = lock.try_lock() else {
            return HealthVerdict::Skipped;
        };

        let Some((state, port, manual, operator_stopped)) = self
            .slots
            .get(&agent)
            .map(|s| (s.state, s.descriptor.port, s.manual_intervention, s.operator_stopped))
        else {
            return HealthVerdict::Skipped;
        };

        if manual {
            return HealthVerdict::Skipped;
        }

        let failure = match state {
            AgentState::Running => match self.client.health(port).await {
                Ok(report) if report.is_healthy() => None,
                Ok(report) => Some(format!("reported status '{}'", report.status)),
                Err(e) => Some(e.to_string()),
            },
            AgentState::Failed if !operator_stopped => Some("agent is in failed state".to_string()),
            _ => return HealthVerdict::Skipped,
        };

        match failure {
            None => {
                if let Some(mut slot) = self.slots.get_mut(&agent) {
                    slot.restart_count = 0;
                }
                match self.recycle_if_over_limit_locked(agent).await {
                    Ok(true) => HealthVerdict::Recycled,
                    Ok(false) => HealthVerdict::Healthy,
                    Err(e) => {
                        tracing::error!("Token recycle of {} failed: {}", agent, e);
                        HealthVerdict::RestartFailed
                    }
                }
            }
            Some(reason) => self.handle_failed_check(agent, reason).await,
        }
    }

    async fn handle_failed_check(&self, agent: AgentType, reason: String) -> HealthVerdict {
        self.errors
            .record("health_check", format!("{}: {}", agent, reason), &format!("restart_agent_{}", agent));

        let restart_count = self.slots.get(&agent).map_or(0, |s| s.restart_count);
        if restart_count >= self.config.max_auto_restarts {
            if let Some(mut slot) = self.slots.get_mut(&agent) {
                slot.manual_intervention = true;
            }
            self.errors.record(
                "process_supervisor",
                format!(
                    "{} exceeded {} automatic restarts; manual intervention required",
                    agent, self.config.max_auto_restarts
                ),
                "manual_intervention_required",
            );
            self.events.publish(AssemblyEvent::agent(
                EventType::ManualInterventionRequired,
                agent,
                json!({ "restart_count": restart_count, "reason": reason }),
            ));
            return HealthVerdict::ManualIntervention;
        }

        match self.restart_locked(agent, RestartCause::HealthCheck).await {
            Ok(_) => HealthVerdict::Restarted,
            Err(e) => {
                tracing::warn!("Automatic restart of {} failed: {}", agent, e);
                HealthVerdict::RestartFailed
            }
        }
    }

    /// Fetches the agent's own token usage and recycles it past the ceiling.
    async fn recycle_if_over_limit_locked(&self, agent: AgentType) -> Result<bool, SupervisorError> {
        let Some(port) = self.config.descriptor(agent).map(|d| d.port) else {
            return Err(SupervisorError::NotConfigured(agent));
        };

        let usage = match self.client.tokens(port).await {
            Ok(usage) => usage,
            Err(e) => {
                tracing::debug!("Token usage of {} unavailable: {}", agent, e);
                return Ok(false);
            }
        };

        let over = usage.restart_recommended;
        if let Some(mut slot) = self.slots.get_mut(&agent) {
            slot.last_token_usage = Some(usage.clone());
        }
        if !over {
            return Ok(false);
        }

        tracing::warn!(
            "{} exceeded token limit ({}/{}), recycling",
            agent,
            usage.total_tokens,
            usage.token_limit
        );
        self.events.publish(AssemblyEvent::agent(
            EventType::TokenRecycle,
            agent,
            json!({ "total_tokens": usage.total_tokens, "token_limit": usage.token_limit }),
        ));

        self.restart_locked(agent, RestartCause::TokenCeiling).await?;

        match self.client.reset_tokens(port).await {
            Ok(reset) => {
                if let Some(mut slot) = self.slots.get_mut(&agent) {
                    slot.last_token_usage = Some(reset.new_usage);
                }
            }
            Err(e) => {
                self.errors
                    .record("token_recycle", format!("{}: reset failed: {}", agent, e), "none");
            }
        }
        Ok(true)
    }

    /// Token check after a stage call. Runs off the request path and only
    /// touches agents that are still running.
    pub fn schedule_token_check(self: &Arc<Self>, agent: AgentType) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(supervisor.config.token_recycle_delay).await;
            let Ok(lock) = supervisor.lock_for(agent) else {
                return;
            };
            let _guard = lock.lock().await;
            if !supervisor.is_running(agent) {
                return;
            }
            if let Err(e) = supervisor.recycle_if_over_limit_locked(agent).await {
                tracing::error!("Scheduled token recycle of {} failed: {}", agent, e);
            }
        });
    }

    pub fn spawn_health_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.config.health_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; agents need a full interval.
            ticker.tick().await;

            tracing::info!("Health monitor running every {:?}", supervisor.config.health_check_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for (agent, verdict) in supervisor.check_all_once().await {
                            if verdict != HealthVerdict::Skipped && verdict != HealthVerdict::Healthy {
                                tracing::info!("Health check {}: {:?}", agent, verdict);
                            }
                        }
                    }
                }
            }
            tracing::info!("Health monitor stopped");
        })
    }
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<ExitStatus>, within: Duration) -> bool {
    // An Err means the reaper is gone, which only happens after the child is.
    tokio::time::timeout(within, exit_rx.wait_for(Option::is_some))
        .await
        .is_ok()
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("SIGTERM to pid {} failed: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}

async fn forward_output<R>(agent: AgentType, pid: u32, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => tracing::warn!("[{}:{}] {}", agent, pid, line),
            Ok(Some(line)) => tracing::info!("[{}:{}] {}", agent, pid, line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("[{}:{}] output stream closed: {}", agent, pid, e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use axum::{
        routing::{get, post},
        Json, Router,
    };
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Stands in for an agent's HTTP side; the supervised process is `sleep`.
    struct MockAgent {
        over_limit: AtomicBool,
        resets: std::sync::atomic::AtomicU32,
    }

    fn usage(total: u64) -> TokenUsage {
        let mut usage = TokenUsage::empty("flowchart_mapper", 100_000);
        usage.input_tokens = total;
        usage.total_tokens = total;
        usage.restart_recommended = total > 100_000;
        usage.usage_percentage = total as f64 / 1_000.0;
        usage
    }

    async fn serve_mock(mock: Arc<MockAgent>) -> u16 {
        let tokens_mock = mock.clone();
        let reset_mock = mock.clone();
        let app = Router::new()
            .route("/health", get(|| async { Json(json!({"status": "healthy", "processed": 0, "errors": 0})) }))
            .route(
                "/agent-tokens",
                get(move || {
                    let mock = tokens_mock.clone();
                    async move {
                        let total = if mock.over_limit.load(Ordering::SeqCst) { 120_000 } else { 10 };
                        Json(usage(total))
                    }
                }),
            )
            .route(
                "/reset-tokens",
                post(move || {
                    let mock = reset_mock.clone();
                    async move {
                        mock.over_limit.store(false, Ordering::SeqCst);
                        mock.resets.fetch_add(1, Ordering::SeqCst);
                        Json(json!({"success": true, "message": "reset", "new_usage": usage(0)}))
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

    async fn unused_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn supervisor(port: u16) -> Arc<ProcessSupervisor> {
        supervisor_running(port, "sleep", &["30"])
    }

    fn supervisor_running(port: u16, command: &str, args: &[&str]) -> Arc<ProcessSupervisor> {
        let config = OrchestratorConfig {
            agent_command: command.to_string(),
            agent_args: args.iter().map(|a| a.to_string()).collect(),
            agents: vec![AgentDescriptor::default_for(AgentType::Flowchart).with_port(port)],
            health_timeout: Duration::from_millis(500),
            settle_delay: Duration::from_millis(50),
            stop_grace: Duration::from_secs(2),
            restart_delay: Duration::ZERO,
            token_recycle_delay: Duration::ZERO,
            refresh_delay: Duration::ZERO,
            refresh_delay_staggered: Duration::ZERO,
            ..OrchestratorConfig::default()
        };
        let client = AgentClient::new("127.0.0.1", config.health_timeout, config.stage_timeout);
        Arc::new(ProcessSupervisor::new(
            Arc::new(config),
            client,
            EventBus::new(64),
            Arc::new(ErrorLog::default()),
        ))
    }

    fn pid_alive(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn test_start_stop_start_gets_fresh_pid() {
        let mock = Arc::new(MockAgent {
            over_limit: AtomicBool::new(false),
            resets: Default::default(),
        });
        let port = serve_mock(mock).await;
        let supervisor = supervisor(port);

        let first = supervisor.start(AgentType::Flowchart, StartFlags::default()).await.unwrap();
        assert_eq!(first.state, AgentState::Running);
        let first_pid = first.pid.unwrap();
        assert!(pid_alive(first_pid));

        supervisor.stop(AgentType::Flowchart).await.unwrap();
        let stopped = supervisor.status(AgentType::Flowchart).unwrap();
        assert_eq!(stopped.state, AgentState::Stopped);
        assert!(stopped.pid.is_none());
        assert_eq!(stopped.restart_count, 0);

        let second = supervisor.start(AgentType::Flowchart, StartFlags::default()).await.unwrap();
        assert_ne!(second.pid.unwrap(), first_pid);
        assert_eq!(second.restart_count, 0);

        supervisor.shutdown().await;
        assert!(supervisor.status(AgentType::Flowchart).unwrap().pid.is_none());
    }

    #[tokio::test]
    async fn test_restart_attempts_stop_at_cap() {
        let supervisor = supervisor(unused_port().await);

        let err = supervisor
            .start(AgentType::Flowchart, StartFlags::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Unhealthy { .. }));
        let failed = supervisor.status(AgentType::Flowchart).unwrap();
        assert_eq!(failed.state, AgentState::Failed);
        assert!(failed.pid.is_none());

        let mut verdicts = Vec::new();
        for _ in 0..4 {
            verdicts.push(supervisor.check_agent(AgentType::Flowchart).await);
        }
        assert_eq!(
            verdicts,
            vec![
                HealthVerdict::RestartFailed,
                HealthVerdict::RestartFailed,
                HealthVerdict::RestartFailed,
                HealthVerdict::ManualIntervention,
            ]
        );

        let status = supervisor.status(AgentType::Flowchart).unwrap();
        assert_eq!(status.restart_count, 3);
        assert!(status.manual_intervention_required);

        // Further ticks leave the agent alone.
        assert_eq!(supervisor.check_agent(AgentType::Flowchart).await, HealthVerdict::Skipped);
        assert_eq!(supervisor.status(AgentType::Flowchart).unwrap().restart_count, 3);
    }

    #[tokio::test]
    async fn test_token_ceiling_triggers_recycle() {
        let mock = Arc::new(MockAgent {
            over_limit: AtomicBool::new(false),
            resets: Default::default(),
        });
        let port = serve_mock(mock.clone()).await;
        let supervisor = supervisor(port);

        let started = supervisor.start(AgentType::Flowchart, StartFlags::default()).await.unwrap();
        assert_eq!(supervisor.check_agent(AgentType::Flowchart).await, HealthVerdict::Healthy);

        mock.over_limit.store(true, Ordering::SeqCst);
        assert_eq!(supervisor.check_agent(AgentType::Flowchart).await, HealthVerdict::Recycled);

        let status = supervisor.status(AgentType::Flowchart).unwrap();
        assert_eq!(status.state, AgentState::Running);
        assert_ne!(status.pid, started.pid);
        assert!(status.fresh_start && status.context_cleared);
        assert_eq!(status.last_token_usage.as_ref().map(|u| u.total_tokens), Some(0));
        assert_eq!(mock.resets.load(Ordering::SeqCst), 1);
        assert!(!pid_alive(started.pid.unwrap()));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unexpected_exit_marks_failed() {
        let mock = Arc::new(MockAgent {
            over_limit: AtomicBool::new(false),
            resets: Default::default(),
        });
        let port = serve_mock(mock).await;
        let supervisor = supervisor(port);
        let mut events = supervisor.events.subscribe();

        let status = supervisor.start(AgentType::Flowchart, StartFlags::default()).await.unwrap();
        let pid = status.pid.unwrap();
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
        }

        let exited = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if event.event_type == EventType::AgentExited => return event,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream closed: {}", e),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(exited.payload["pid"], Value::from(pid));

        let status = supervisor.status(AgentType::Flowchart).unwrap();
        assert_eq!(status.state, AgentState::Failed);
        assert!(status.pid.is_none());
    }

    #[tokio::test]
    async fn test_refresh_all_reports_each_agent() {
        let mock = Arc::new(MockAgent {
            over_limit: AtomicBool::new(false),
            resets: Default::default(),
        });
        let port = serve_mock(mock).await;
        let supervisor = supervisor(port);

        let outcomes = supervisor.refresh_all(true, true).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, "refreshed");
        let status = supervisor.status(AgentType::Flowchart).unwrap();
        assert!(status.context_cleared && status.fresh_start);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill_when_sigterm_is_ignored() {
        let mock = Arc::new(MockAgent {
            over_limit: AtomicBool::new(false),
            resets: Default::default(),
        });
        let port = serve_mock(mock).await;
        let supervisor = supervisor_running(port, "sh", &["-c", "trap '' TERM; while true; do sleep 0.1; done"]);

        let status = supervisor.start(AgentType::Flowchart, StartFlags::default()).await.unwrap();
        let pid = status.pid.unwrap();

        let started = std::time::Instant::now();
        supervisor.stop(AgentType::Flowchart).await.unwrap();
        // The grace window (2 s) had to run out before SIGKILL.
        assert!(started.elapsed() >= Duration::from_secs(2));

        let stopped = supervisor.status(AgentType::Flowchart).unwrap();
        assert_eq!(stopped.state, AgentState::Stopped);
        assert!(stopped.pid.is_none());
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn test_context_restart_sets_fresh_flags() {
        let mock = Arc::new(MockAgent {
            over_limit: AtomicBool::new(false),
            resets: Default::default(),
        });
        let port = serve_mock(mock).await;
        let supervisor = supervisor(port);

        let first = supervisor.start(AgentType::Flowchart, StartFlags::default()).await.unwrap();
        assert!(!first.fresh_start);

        let status = supervisor
            .restart(AgentType::Flowchart, RestartCause::ContextRefresh { clear_context: false })
            .await
            .unwrap();
        assert_eq!(status.state, AgentState::Running);
        assert_ne!(status.pid, first.pid);
        assert!(status.fresh_start);
        assert!(!status.context_cleared);
        assert_eq!(status.restart_count, 1);

        let status = supervisor
            .restart(AgentType::Flowchart, RestartCause::ContextRefresh { clear_context: true })
            .await
            .unwrap();
        assert!(status.fresh_start && status.context_cleared);
        assert_eq!(status.restart_count, 2);

        supervisor.shutdown().await;
    }
}
