// [[ASSEMBLY]]/apps/orchestrator-server/src/observability.rs
// Purpose: Bounded in-memory log of recent system errors (/system-errors).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

pub const MAX_ERROR_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
}

impl Severity {
    /// Startup failures and port clashes are critical; timeouts and health
    /// check failures are warnings.
    pub fn classify(component: &str, error: &str) -> Severity {
        let lowered = error.to_lowercase();
        if component == "agent_startup"
            || lowered.contains("address already in use")
            || lowered.contains("eaddrinuse")
        {
            Severity::Critical
        } else if component == "health_check"
            || lowered.contains("timeout")
            || lowered.contains("timed out")
            || lowered.contains("unreachable")
        {
            Severity::Warning
        } else {
            Severity::Error
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemError {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub error: String,
    pub action: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ErrorBreakdown {
    pub critical: usize,
    pub error: usize,
    pub warning: usize,
}

pub struct ErrorLog {
    entries: Mutex<VecDeque<SystemError>>,
    capacity: usize,
}

impl Default for ErrorLog {
    fn default() -> Self {
        ErrorLog::new(MAX_ERROR_HISTORY)
    }
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        ErrorLog {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, VecDeque<SystemError>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, component: &str, error: impl ToString, action: &str) -> SystemError {
        let error = error.to_string();
        let entry = SystemError {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            component: component.to_string(),
            severity: Severity::classify(component, &error),
            error,
            action: action.to_string(),
        };

        match entry.severity {
            Severity::Critical => tracing::error!(
                component = %entry.component,
                action = %entry.action,
                "CRITICAL: {}",
                entry.error
            ),
            Severity::Warning => tracing::warn!("{}: {}", entry.component, entry.error),
            Severity::Error => tracing::error!("{}: {}", entry.component, entry.error),
        }

        let mut entries = self.entries();
        entries.push_front(entry.clone());
        entries.truncate(self.capacity);
        entry
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize, severity: Option<Severity>) -> Vec<SystemError> {
        self.entries()
            .iter()
            .filter(|e| severity.map_or(true, |s| e.severity == s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn breakdown(&self) -> ErrorBreakdown {
        let mut counts = ErrorBreakdown::default();
        for entry in self.entries().iter() {
            match entry.severity {
                Severity::Critical => counts.critical += 1,
                Severity::Error => counts.error += 1,
                Severity::Warning => counts.warning += 1,
            }
        }
        counts
    }

    /// Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_bounded_and_newest_first() {
        let log = ErrorLog::new(3);
        for i in 0..5 {
            log.record("pipeline_stage", format!("failure {}", i), "none");
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(10, None);
        assert_eq!(recent[0].error, "failure 4");
        assert_eq!(recent[2].error, "failure 2");
    }

    #[test]
    fn test_severity_classification() {
        assert_eq!(Severity::classify("agent_startup", "boom"), Severity::Critical);
        assert_eq!(
            Severity::classify("supervisor", "bind: Address already in use"),
            Severity::Critical
        );
        assert_eq!(Severity::classify("health_check", "refused"), Severity::Warning);
        assert_eq!(Severity::classify("pipeline_stage", "operation timed out"), Severity::Warning);
        assert_eq!(Severity::classify("pipeline_stage", "HTTP 500"), Severity::Error);

        let log = ErrorLog::default();
        log.record("agent_startup", "spawn failed", "restart_agent_flowchart");
        log.record("health_check", "unreachable", "none");
        let breakdown = log.breakdown();
        assert_eq!((breakdown.critical, breakdown.warning, breakdown.error), (1, 1, 0));
        assert_eq!(log.recent(10, Some(Severity::Warning)).len(), 1);
        assert_eq!(log.clear(), 2);
        assert_eq!(log.len(), 0);
    }
}
