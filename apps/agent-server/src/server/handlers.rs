// [[ASSEMBLY]]/apps/agent-server/src/server/handlers.rs
// Purpose: Agent API handlers. /process runs a full batch before answering.
// Architecture: API Layer
// Dependencies: Axum, AgentRuntime

use assembly_core::{HealthReport, ProcessRequest, ProcessResponse, ResetTokensResponse, TokenUsage};
use axum::{
    extract::{Json, State},
    http::StatusCode,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::worker::AgentRuntime;

pub async fn health(State(runtime): State<Arc<AgentRuntime>>) -> Json<HealthReport> {
    Json(HealthReport {
        agent: runtime.descriptor.name.clone(),
        status: "healthy".to_string(),
        mission: Some(runtime.descriptor.expertise.clone()),
        methodology: Some(runtime.descriptor.methodology.clone()),
        processed: runtime.processed(),
        errors: runtime.errors(),
        timestamp: Utc::now(),
    })
}

pub async fn process(
    State(runtime): State<Arc<AgentRuntime>>,
    body: Option<Json<ProcessRequest>>,
) -> Result<Json<ProcessResponse>, (StatusCode, Json<Value>)> {
    if let Some(Json(request)) = &body {
        if request.orchestrator_request {
            tracing::debug!("{}: coordinated request {}", runtime.agent_type(), request.coordination);
        }
    }

    match runtime.process_batch().await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            tracing::error!("{}: batch failed: {}", runtime.agent_type(), e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "agent": runtime.descriptor.name,
                    "error": e.to_string(),
                })),
            ))
        }
    }
}

pub async fn agent_tokens(State(runtime): State<Arc<AgentRuntime>>) -> Json<TokenUsage> {
    Json(runtime.tracker.usage())
}

pub async fn reset_tokens(State(runtime): State<Arc<AgentRuntime>>) -> Json<ResetTokensResponse> {
    let new_usage = runtime.reset_tokens();
    Json(ResetTokensResponse {
        success: true,
        message: format!("{} token usage reset", runtime.agent_type().agent_name()),
        new_usage,
    })
}

#[cfg(test)]
mod tests {
    use crate::server::router;
    use crate::worker::tests::{book, runtime, MemoryReservoir};
    use assembly_core::{ProcessResponse, ResetTokensResponse, TokenUsage};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_descriptor() {
        let app = router(Arc::new(runtime(Arc::new(MemoryReservoir::default()), Vec::new())));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: Value = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert!(body["agent"].as_str().unwrap().contains("Flowchart Mapper"));
        assert_eq!(body["processed"], 0);
    }

    #[tokio::test]
    async fn test_process_then_tokens_then_reset() {
        let reservoir = Arc::new(MemoryReservoir::default());
        *reservoir.ready.lock().unwrap() = vec![book("1", "Ihya Ulum al-Din")];
        let app = router(Arc::new(runtime(reservoir, Vec::new())));

        let response = app
            .clone()
            .oneshot(
                Request::post("/process")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"coordination": {"stage": "flowchart"}, "orchestrator_request": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let processed: ProcessResponse = body_json(response).await;
        assert!(processed.success);
        assert_eq!(processed.processed, 1);

        let response = app
            .clone()
            .oneshot(Request::get("/agent-tokens").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let usage: TokenUsage = body_json(response).await;
        assert_eq!(usage.total_tokens, 500);
        assert_eq!(usage.api_calls, 1);
        assert!(!usage.restart_recommended);

        let response = app
            .oneshot(Request::post("/reset-tokens").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let reset: ResetTokensResponse = body_json(response).await;
        assert!(reset.success);
        assert_eq!(reset.new_usage.total_tokens, 0);
        assert!(reset.new_usage.last_reset > usage.last_reset);
    }

    #[tokio::test]
    async fn test_process_without_body_still_runs() {
        let app = router(Arc::new(runtime(Arc::new(MemoryReservoir::default()), Vec::new())));
        let response = app
            .oneshot(Request::post("/process").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
