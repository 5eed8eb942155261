// [[ASSEMBLY]]/apps/orchestrator-server/src/handoff.rs
// Purpose: Snapshot an orchestrator hands to its successor, and what the
//          successor restores from it.
// Architecture: Domain Model Layer
// Dependencies: serde, chrono

use assembly_core::AgentType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agents up longer than this are listed for a restart after handoff.
pub const DEGRADED_UPTIME_HOURS: i64 = 4;

/// More critical errors than this mark the orchestrator as degraded.
pub const DEGRADED_CRITICAL_ERRORS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveAgent {
    pub pid: Option<u32>,
    pub port: u16,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CriticalState {
    #[serde(default)]
    pub active_agents: BTreeMap<String, ActiveAgent>,
    /// `running` or `stopped`: continuous mode at handoff time.
    #[serde(default)]
    pub pipeline_status: String,
    #[serde(default)]
    pub error_count: usize,
    #[serde(default)]
    pub performance_degradation_detected: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EssentialMetrics {
    #[serde(default)]
    pub total_processed: u64,
    #[serde(default)]
    pub orchestration_runs: u64,
    #[serde(default)]
    pub active_agent_count: usize,
    /// Share of logged errors that were critical.
    #[serde(default)]
    pub error_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MissionCriticalInfo {
    #[serde(default)]
    pub must_restart_agents_if_degraded: Vec<AgentType>,
    #[serde(default)]
    pub pipeline_continuation_ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandoffReport {
    pub handoff_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub orchestrator_restart_count: u32,
    #[serde(default)]
    pub previous_uptime_hours: i64,
    #[serde(default)]
    pub orchestrator_tokens_used: u64,
    #[serde(default)]
    pub critical_state: CriticalState,
    #[serde(default)]
    pub essential_metrics: EssentialMetrics,
    #[serde(default)]
    pub mission_critical_info: MissionCriticalInfo,
}

impl HandoffReport {
    pub fn pipeline_was_running(&self) -> bool {
        self.critical_state.pipeline_status == "running"
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RestoredState {
    pub restart_count: u32,
    pub total_processed: u64,
    pub orchestration_runs: u64,
    pub pipeline_running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_report_is_accepted() {
        let report: HandoffReport = serde_json::from_value(json!({
            "handoff_timestamp": "2026-10-18T08:00:00Z",
            "orchestrator_restart_count": 2,
            "critical_state": { "pipeline_status": "running" },
            "essential_metrics": { "total_processed": 120, "orchestration_runs": 9 }
        }))
        .unwrap();

        assert!(report.pipeline_was_running());
        assert_eq!(report.essential_metrics.orchestration_runs, 9);
        assert!(report.critical_state.active_agents.is_empty());
        assert!(report.mission_critical_info.must_restart_agents_if_degraded.is_empty());
    }
}
