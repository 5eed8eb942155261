// [[ASSEMBLY]]/libs/assembly-core/src/reservoir.rs
// Purpose: Access to the hosted reservoir table that tracks each book's stage.
// Architecture: Infrastructure Layer
// Dependencies: reqwest, async-trait, serde_json

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::catalog::AgentType;

const RESERVOIR_TABLE: &str = "book_enrichment_reservoir";

#[derive(Error, Debug)]
pub enum ReservoirError {
    #[error("Reservoir credentials not configured (SUPABASE_URL / SUPABASE_SERVICE_KEY)")]
    NotConfigured,
    #[error("Reservoir request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Reservoir returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// A row handed to an agent by `get_books_ready_for_agent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReservoirBook {
    pub reservoir_id: String,
    pub book_id: String,
    pub title: String,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub processing_stage: Option<String>,
    #[serde(default)]
    pub agents_completed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReservoirInit {
    #[serde(default)]
    pub processed_count: u64,
    #[serde(default)]
    pub reservoir_entries: u64,
}

/// The shared mutable resource of the assembly line. Writes are plain
/// read-then-update; each agent only touches its own stage's columns.
#[async_trait]
pub trait Reservoir: Send + Sync {
    /// Cheap reachability check used by the readiness gate.
    async fn ping(&self) -> Result<(), ReservoirError>;

    async fn books_ready_for(&self, agent: AgentType) -> Result<Vec<ReservoirBook>, ReservoirError>;

    async fn update_entry(&self, reservoir_id: &str, patch: Value) -> Result<(), ReservoirError>;

    async fn initialize_from_queue(&self) -> Result<ReservoirInit, ReservoirError>;

    /// Number of rows per `processing_stage`.
    async fn stage_counts(&self) -> Result<BTreeMap<String, u64>, ReservoirError>;
}

#[derive(Debug, Clone)]
struct Credentials {
    base_url: String,
    service_key: String,
}

/// PostgREST-backed reservoir.
pub struct PostgrestReservoir {
    credentials: Option<Credentials>,
    http_client: reqwest::Client,
}

impl PostgrestReservoir {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self::build(Some(Credentials {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        }))
    }

    /// Reads `SUPABASE_URL` and `SUPABASE_SERVICE_KEY`. Missing values leave the
    /// client unconfigured: every call then fails with `NotConfigured`.
    pub fn from_env() -> Self {
        match (env::var("SUPABASE_URL"), env::var("SUPABASE_SERVICE_KEY")) {
            (Ok(url), Ok(key)) if !url.is_empty() && !key.is_empty() => {
                tracing::info!("Reservoir client initialized: {}", url);
                Self::new(url, key)
            }
            _ => {
                tracing::warn!("SUPABASE_URL / SUPABASE_SERVICE_KEY not set. Reservoir unavailable.");
                Self::build(None)
            }
        }
    }

    fn build(credentials: Option<Credentials>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        PostgrestReservoir {
            credentials,
            http_client,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, ReservoirError> {
        let creds = self.credentials.as_ref().ok_or(ReservoirError::NotConfigured)?;
        let url = format!("{}/rest/v1/{}", creds.base_url, path);

        Ok(self
            .http_client
            .request(method, url)
            .header("apikey", &creds.service_key)
            .bearer_auth(&creds.service_key))
    }

    async fn send(builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ReservoirError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ReservoirError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl Reservoir for PostgrestReservoir {
    async fn ping(&self) -> Result<(), ReservoirError> {
        let builder = self
            .request(reqwest::Method::GET, RESERVOIR_TABLE)?
            .query(&[("select", "id"), ("limit", "1")]);
        Self::send(builder).await.map(|_| ())
    }

    async fn books_ready_for(&self, agent: AgentType) -> Result<Vec<ReservoirBook>, ReservoirError> {
        let builder = self
            .request(reqwest::Method::POST, "rpc/get_books_ready_for_agent")?
            .json(&json!({ "agent_type": agent.as_str() }));
        let response = Self::send(builder).await?;
        Ok(response.json::<Vec<ReservoirBook>>().await?)
    }

    async fn update_entry(&self, reservoir_id: &str, patch: Value) -> Result<(), ReservoirError> {
        let builder = self
            .request(reqwest::Method::PATCH, RESERVOIR_TABLE)?
            .query(&[("id", format!("eq.{}", reservoir_id))])
            .header("Prefer", "return=minimal")
            .json(&patch);
        Self::send(builder).await.map(|_| ())
    }

    async fn initialize_from_queue(&self) -> Result<ReservoirInit, ReservoirError> {
        let builder = self
            .request(reqwest::Method::POST, "rpc/initialize_reservoir_from_queue")?
            .json(&json!({}));
        let response = Self::send(builder).await?;
        let rows = response.json::<Vec<ReservoirInit>>().await?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }

    async fn stage_counts(&self) -> Result<BTreeMap<String, u64>, ReservoirError> {
        #[derive(Deserialize)]
        struct StageRow {
            processing_stage: Option<String>,
        }

        let builder = self
            .request(reqwest::Method::GET, RESERVOIR_TABLE)?
            .query(&[("select", "processing_stage")]);
        let rows = Self::send(builder).await?.json::<Vec<StageRow>>().await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let stage = row.processing_stage.unwrap_or_else(|| "unknown".to_string());
            *counts.entry(stage).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Json, Query},
        http::{HeaderMap, StatusCode},
        routing::{get, patch, post},
        Router,
    };
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_unconfigured_client_refuses_every_call() {
        let reservoir = PostgrestReservoir::build(None);
        assert!(!reservoir.is_configured());
        assert!(matches!(reservoir.ping().await, Err(ReservoirError::NotConfigured)));
        assert!(matches!(
            reservoir.books_ready_for(AgentType::Network).await,
            Err(ReservoirError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_books_ready_for_posts_agent_type() {
        let app = Router::new().route(
            "/rest/v1/rpc/get_books_ready_for_agent",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers.get("apikey").unwrap(), "service-key");
                assert_eq!(body["agent_type"], "metadata");
                Json(json!([{
                    "reservoir_id": "r-1",
                    "book_id": "b-1",
                    "title": "Ihya Ulum al-Din",
                    "author_name": "al-Ghazali"
                }]))
            }),
        );
        let base = serve(app).await;

        let reservoir = PostgrestReservoir::new(base, "service-key");
        let books = reservoir.books_ready_for(AgentType::Metadata).await.unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].author_name.as_deref(), Some("al-Ghazali"));
        assert!(books[0].agents_completed.is_empty());
    }

    #[tokio::test]
    async fn test_update_entry_encodes_id_filter() {
        let app = Router::new().route(
            "/rest/v1/book_enrichment_reservoir",
            patch(
                |headers: HeaderMap, Query(q): Query<HashMap<String, String>>, Json(body): Json<Value>| async move {
                    assert_eq!(headers.get("prefer").unwrap(), "return=minimal");
                    // Only one pair: the id must not leak into a second parameter.
                    assert_eq!(q.len(), 1);
                    assert_eq!(q.get("id").map(String::as_str), Some("eq.r-1&stage=done"));
                    assert_eq!(body["processing_stage"], "network");
                    StatusCode::NO_CONTENT
                },
            ),
        );
        let base = serve(app).await;
        let reservoir = PostgrestReservoir::new(base, "k");

        reservoir
            .update_entry("r-1&stage=done", json!({ "processing_stage": "network" }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stage_counts_and_error_status() {
        let app = Router::new().route(
            "/rest/v1/book_enrichment_reservoir",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                if q.get("select").map(String::as_str) == Some("processing_stage") {
                    Ok(Json(json!([
                        {"processing_stage": "network"},
                        {"processing_stage": "network"},
                        {"processing_stage": "completed"},
                        {"processing_stage": null}
                    ])))
                } else {
                    Err((StatusCode::SERVICE_UNAVAILABLE, "down"))
                }
            }),
        );
        let base = serve(app).await;
        let reservoir = PostgrestReservoir::new(format!("{}/", base), "k");

        let counts = reservoir.stage_counts().await.unwrap();
        assert_eq!(counts.get("network"), Some(&2));
        assert_eq!(counts.get("completed"), Some(&1));
        assert_eq!(counts.get("unknown"), Some(&1));

        match reservoir.ping().await {
            Err(ReservoirError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "down");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }
}
