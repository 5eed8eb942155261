// [[ASSEMBLY]]/apps/orchestrator-server/src/error.rs
// Purpose: Error taxonomy of the orchestrator and its HTTP rendering.
// Architecture: Domain Error Layer
// Dependencies: thiserror, axum

use assembly_core::{AgentType, CatalogError, ReservoirError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failure talking to an agent's HTTP API.
#[derive(Error, Debug)]
pub enum AgentCallError {
    #[error("agent unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("agent answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("agent sent an unreadable body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl AgentCallError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentCallError::Transport(e) if e.is_timeout())
    }
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("{0} is not a configured agent")]
    NotConfigured(AgentType),
    #[error("failed to spawn {agent}: {source}")]
    Spawn {
        agent: AgentType,
        #[source]
        source: std::io::Error,
    },
    #[error("{agent} failed its startup health check: {reason}")]
    Unhealthy { agent: AgentType, reason: String },
    #[error("{agent} could not be stopped: {reason}")]
    Stop { agent: AgentType, reason: String },
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("pipeline not ready: {}", issues.join("; "))]
    NotReady { issues: Vec<String> },
}

/// Anything a handler can fail with. Rendered as `{error, component}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    BadRequest(#[from] CatalogError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Reservoir(#[from] ReservoirError),
    #[error("Handoff report required for context restoration")]
    MissingHandoffReport,
}

impl ApiError {
    pub fn component(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "request",
            ApiError::Supervisor(_) => "process_supervisor",
            ApiError::Coordinator(_) => "pipeline_coordinator",
            ApiError::Reservoir(_) => "reservoir",
            ApiError::MissingHandoffReport => "orchestrator_context",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::MissingHandoffReport => StatusCode::BAD_REQUEST,
            ApiError::Supervisor(SupervisorError::NotConfigured(_)) => StatusCode::BAD_REQUEST,
            ApiError::Coordinator(CoordinatorError::NotReady { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Reservoir(ReservoirError::NotConfigured) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.to_string(),
            "component": self.component(),
        });
        if let ApiError::Coordinator(CoordinatorError::NotReady { issues }) = &self {
            body["issues"] = json!(issues);
        }
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let unknown = ApiError::from(CatalogError::UnknownAgent("quantum".into()));
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
        assert_eq!(unknown.component(), "request");

        let not_ready = ApiError::from(CoordinatorError::NotReady {
            issues: vec!["network: unreachable".into()],
        });
        assert_eq!(not_ready.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(not_ready.to_string().contains("network: unreachable"));

        let spawn = ApiError::from(SupervisorError::Unhealthy {
            agent: AgentType::Metadata,
            reason: "status degraded".into(),
        });
        assert_eq!(spawn.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let missing = ApiError::MissingHandoffReport;
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        assert_eq!(missing.component(), "orchestrator_context");
    }
}
