// [[ASSEMBLY]]/apps/agent-server/src/worker.rs
// Purpose: One stage agent: claims books, analyzes them, writes results back.
// Architecture: Domain Logic Layer
// Dependencies: assembly-core, serde_json, chrono

use assembly_core::{
    AgentDescriptor, AgentType, BookOutcome, ProcessResponse, ProcessingStage, Reservoir,
    ReservoirBook, ReservoirError, TokenTracker, TokenUsage,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::analyzer::{AnalysisRequest, AnalyzeError, Analyzer};
use crate::prompts;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Could not claim work: {0}")]
    Claim(#[source] ReservoirError),
}

#[derive(Error, Debug)]
enum BookError {
    #[error(transparent)]
    Analyze(#[from] AnalyzeError),
    #[error("Database update failed: {0}")]
    Update(#[from] ReservoirError),
}

pub struct AgentRuntime {
    pub descriptor: AgentDescriptor,
    pub tracker: Arc<TokenTracker>,
    reservoir: Arc<dyn Reservoir>,
    analyzer: Arc<dyn Analyzer>,
    processed: AtomicU64,
    errors: AtomicU64,
    // One batch at a time, so two /process calls never claim the same rows.
    batch_gate: Mutex<()>,
}

impl AgentRuntime {
    pub fn new(
        descriptor: AgentDescriptor,
        tracker: Arc<TokenTracker>,
        reservoir: Arc<dyn Reservoir>,
        analyzer: Arc<dyn Analyzer>,
    ) -> Self {
        AgentRuntime {
            descriptor,
            tracker,
            reservoir,
            analyzer,
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            batch_gate: Mutex::new(()),
        }
    }

    pub fn agent_type(&self) -> AgentType {
        self.descriptor.agent_type
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Recycle hook: counters and CLI session start over.
    pub fn reset_tokens(&self) -> TokenUsage {
        self.analyzer.reset_session();
        self.tracker.reset()
    }

    /// Processes every book currently ready for this stage. Per-book failures
    /// land in `results` and the error counter; only a failed claim aborts.
    pub async fn process_batch(&self) -> Result<ProcessResponse, AgentError> {
        let _batch = self.batch_gate.lock().await;
        let agent = self.agent_type();
        let books = self.reservoir.books_ready_for(agent).await.map_err(|e| {
            self.errors.fetch_add(1, Ordering::Relaxed);
            AgentError::Claim(e)
        })?;

        if books.is_empty() {
            tracing::info!("{}: no books ready", agent);
            return Ok(self.response(Vec::new(), Some(format!("No books ready for {} analysis", agent))));
        }

        tracing::info!("{}: found {} books ready", agent, books.len());
        let mut results = Vec::with_capacity(books.len());

        for book in &books {
            match self.process_book(book).await {
                Ok(summary) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("{}: completed \"{}\"", agent, book.title);
                    results.push(BookOutcome {
                        book_id: book.book_id.clone(),
                        title: book.title.clone(),
                        success: true,
                        summary,
                        error: None,
                    });
                }
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("{}: failed \"{}\": {}", agent, book.title, e);
                    results.push(BookOutcome {
                        book_id: book.book_id.clone(),
                        title: book.title.clone(),
                        success: false,
                        summary: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(self.response(results, None))
    }

    async fn process_book(&self, book: &ReservoirBook) -> Result<Option<String>, BookError> {
        let agent = self.agent_type();
        let request = AnalysisRequest {
            system_prompt: prompts::system_prompt(agent),
            prompt: prompts::analysis_prompt(agent, book),
        };

        let analysis = self.analyzer.analyze(&request).await?;
        tracing::debug!(
            "{}: \"{}\" used {}/{} tokens",
            agent,
            book.title,
            analysis.input_tokens,
            analysis.output_tokens
        );

        let missing: Vec<&str> = prompts::required_fields(agent)
            .iter()
            .copied()
            .filter(|field| analysis.document.get(field).is_none())
            .collect();
        if !missing.is_empty() {
            tracing::warn!("{}: analysis of \"{}\" lacks {:?}", agent, book.title, missing);
        }

        let patch = stage_patch(agent, book, &analysis.document);
        self.reservoir.update_entry(&book.reservoir_id, patch).await?;

        Ok(summarize(&analysis.document))
    }

    fn response(&self, results: Vec<BookOutcome>, message: Option<String>) -> ProcessResponse {
        ProcessResponse {
            success: true,
            agent: self.descriptor.name.clone(),
            processed: results.iter().filter(|r| r.success).count() as u64,
            results,
            total_processed: self.processed(),
            total_errors: self.errors(),
            message,
        }
    }
}

/// Reservoir update for one finished book. The stage marker only ever moves
/// forward from this agent's own stage.
fn stage_patch(agent: AgentType, book: &ReservoirBook, document: &Value) -> Value {
    let now = Utc::now().to_rfc3339();
    let next_stage: ProcessingStage = agent.stage().next();

    let mut agents_completed = book.agents_completed.clone();
    if !agents_completed.iter().any(|a| a == agent.as_str()) {
        agents_completed.push(agent.as_str().to_string());
    }

    let mut patch = serde_json::Map::new();
    patch.insert(agent.output_column().to_string(), document.clone());
    patch.insert(format!("{}_completed", agent), Value::Bool(true));
    patch.insert(format!("{}_completed_at", agent), Value::String(now.clone()));
    patch.insert("processing_stage".to_string(), json!(next_stage.as_str()));
    patch.insert("agents_completed".to_string(), json!(agents_completed));
    patch.insert("updated_at".to_string(), Value::String(now));
    Value::Object(patch)
}

fn summarize(document: &Value) -> Option<String> {
    let candidates = [
        "/concept/central_thesis",
        "/conceptual_network/central_node",
        "/description",
    ];
    candidates
        .iter()
        .find_map(|pointer| document.pointer(pointer).and_then(Value::as_str))
        .map(|s| s.chars().take(160).collect())
}
