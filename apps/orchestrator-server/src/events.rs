// [[ASSEMBLY]]/apps/orchestrator-server/src/events.rs
// Purpose: Lifecycle and run events, fanned out to /ws/events subscribers.
// Architecture: Domain Event Layer
// Dependencies: Serde, Chrono, Uuid, tokio broadcast

use assembly_core::AgentType;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    AgentStarting,
    AgentStarted,
    AgentStopped,
    /// The child exited without being asked to
    AgentExited,
    AgentFailed,
    AgentRestarting,
    ManualInterventionRequired,
    TokenRecycle,
    RunStarted,
    StageCompleted,
    StageFailed,
    RunCompleted,
    /// The orchestrator's own token ceiling was crossed.
    OrchestratorHandoffRecommended,
    OrchestratorRestored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyEvent {
    pub id: String,
    pub event_type: EventType,
    pub agent: Option<AgentType>,
    pub run_id: Option<String>,
    pub timestamp: String,
    pub payload: Value,
}

impl AssemblyEvent {
    pub fn agent(event_type: EventType, agent: AgentType, payload: Value) -> Self {
        Self::build(event_type, Some(agent), None, payload)
    }

    pub fn run(event_type: EventType, run_id: &str, agent: Option<AgentType>, payload: Value) -> Self {
        Self::build(event_type, agent, Some(run_id.to_string()), payload)
    }

    pub fn system(event_type: EventType, payload: Value) -> Self {
        Self::build(event_type, None, None, payload)
    }

    fn build(event_type: EventType, agent: Option<AgentType>, run_id: Option<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            agent,
            run_id,
            timestamp: Utc::now().to_rfc3339(),
            payload,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AssemblyEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Fire and forget. Having no subscribers is normal.
    pub fn publish(&self, event: AssemblyEvent) {
        tracing::debug!("event {:?} agent={:?}", event.event_type, event.agent);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AssemblyEvent> {
        self.tx.subscribe()
    }
}
