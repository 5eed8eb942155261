// [[ASSEMBLY]]/apps/orchestrator-server/src/agent_client.rs
// Purpose: HTTP client for the uniform agent API.
// Architecture: Infrastructure Layer
// Dependencies: reqwest

use assembly_core::{HealthReport, ProcessRequest, ResetTokensResponse, TokenUsage};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use crate::error::AgentCallError;

/// A `/process` answer kept in both forms: raw text for overhead
/// estimation, parsed JSON for the run result.
#[derive(Debug, Clone)]
pub struct StageReply {
    pub text: String,
    pub body: Value,
}

#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    host: String,
    health_timeout: Duration,
    stage_timeout: Duration,
}

impl AgentClient {
    pub fn new(host: impl Into<String>, health_timeout: Duration, stage_timeout: Duration) -> Self {
        AgentClient {
            http: reqwest::Client::new(),
            host: host.into(),
            health_timeout,
            stage_timeout,
        }
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.host, port, path)
    }

    async fn read(response: reqwest::Response) -> Result<String, AgentCallError> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(AgentCallError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    async fn get_json<T: DeserializeOwned>(&self, port: u16, path: &str) -> Result<T, AgentCallError> {
        let response = self
            .http
            .get(self.url(port, path))
            .timeout(self.health_timeout)
            .send()
            .await?;
        let text = Self::read(response).await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn health(&self, port: u16) -> Result<HealthReport, AgentCallError> {
        self.get_json(port, "/health").await
    }

    pub async fn tokens(&self, port: u16) -> Result<TokenUsage, AgentCallError> {
        self.get_json(port, "/agent-tokens").await
    }

    pub async fn reset_tokens(&self, port: u16) -> Result<ResetTokensResponse, AgentCallError> {
        let response = self
            .http
            .post(self.url(port, "/reset-tokens"))
            .timeout(self.health_timeout)
            .send()
            .await?;
        let text = Self::read(response).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// POSTs one coordination envelope. Bounded by the stage timeout since
    /// the agent answers only after its whole batch is done.
    pub async fn process(&self, port: u16, request: &ProcessRequest) -> Result<StageReply, AgentCallError> {
        let response = self
            .http
            .post(self.url(port, "/process"))
            .json(request)
            .timeout(self.stage_timeout)
            .send()
            .await?;
        let text = Self::read(response).await?;
        let body = serde_json::from_str(&text)?;
        Ok(StageReply { text, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Router};

    #[tokio::test]
    async fn test_error_status_is_surfaced() {
        let app = Router::new().route(
            "/process",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "claim failed") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = AgentClient::new("127.0.0.1", Duration::from_secs(1), Duration::from_secs(1));
        let err = client
            .process(port, &ProcessRequest::coordinated(Value::Null))
            .await
            .unwrap_err();
        match err {
            AgentCallError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "claim failed");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
