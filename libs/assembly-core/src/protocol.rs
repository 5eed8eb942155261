// [[ASSEMBLY]]/libs/assembly-core/src/protocol.rs
// Purpose: Request/response bodies of the uniform agent HTTP API.
// Architecture: Wire Layer
// Dependencies: serde, serde_json, chrono

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tokens::TokenUsage;

/// `GET /health` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub agent: String,
    pub status: String,
    #[serde(default)]
    pub mission: Option<String>,
    #[serde(default)]
    pub methodology: Option<String>,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.as_str(), "healthy" | "active")
    }
}

/// `POST /process` body: coordination metadata only, never book content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    #[serde(default)]
    pub coordination: serde_json::Value,
    #[serde(default)]
    pub enhanced_processing: bool,
    #[serde(default)]
    pub orchestrator_request: bool,
}

impl ProcessRequest {
    pub fn coordinated(coordination: serde_json::Value) -> Self {
        ProcessRequest {
            coordination,
            enhanced_processing: true,
            orchestrator_request: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookOutcome {
    pub book_id: String,
    pub title: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /process` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub success: bool,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub results: Vec<BookOutcome>,
    #[serde(default)]
    pub total_processed: u64,
    #[serde(default)]
    pub total_errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `POST /reset-tokens` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetTokensResponse {
    pub success: bool,
    pub message: String,
    pub new_usage: TokenUsage,
}
