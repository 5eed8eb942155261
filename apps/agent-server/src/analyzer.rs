// [[ASSEMBLY]]/apps/agent-server/src/analyzer.rs
// Purpose: Runs the external LLM CLI for one book and returns its JSON answer.
// Architecture: Infrastructure Layer
// Dependencies: tokio::process, serde_json, async-trait

use assembly_core::TokenTracker;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::parse::{parse_json_document, ParseError};

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Failed to spawn LLM CLI '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("LLM CLI I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("LLM CLI timed out after {0:?}")]
    Timeout(Duration),
    #[error("LLM CLI exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("LLM CLI reported an error: {0}")]
    Reported(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub system_prompt: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub document: Value,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, AnalyzeError>;

    /// Drop any conversational state kept between calls.
    fn reset_session(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Argument,
    Stdin,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// `--output-format json` envelope printed by the CLI.
#[derive(Debug, Deserialize)]
struct CliEnvelope {
    result: Value,
    #[serde(default)]
    usage: CliUsage,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    is_error: bool,
}

pub struct CliAnalyzer {
    program: String,
    base_args: Vec<String>,
    prompt_mode: PromptMode,
    timeout: Duration,
    resume_sessions: bool,
    session_id: Mutex<Option<String>>,
    tracker: Arc<TokenTracker>,
}

impl CliAnalyzer {
    pub fn new(program: impl Into<String>, tracker: Arc<TokenTracker>) -> Self {
        CliAnalyzer {
            program: program.into(),
            base_args: Vec::new(),
            prompt_mode: PromptMode::Argument,
            timeout: Duration::from_secs(300),
            resume_sessions: true,
            session_id: Mutex::new(None),
            tracker,
        }
    }

    pub fn with_base_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    pub fn with_prompt_mode(mut self, mode: PromptMode) -> Self {
        self.prompt_mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fresh-context agents never resume a previous CLI session.
    pub fn with_session_resume(mut self, resume: bool) -> Self {
        self.resume_sessions = resume;
        self
    }

    fn current_session(&self) -> Option<String> {
        if !self.resume_sessions {
            return None;
        }
        self.session_id.lock().ok().and_then(|s| s.clone())
    }

    fn build_args(&self, request: &AnalysisRequest) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend([
            "-p".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
            "--system-prompt".to_string(),
            request.system_prompt.clone(),
        ]);
        if let Some(session) = self.current_session() {
            args.push("--resume".to_string());
            args.push(session);
        }
        if self.prompt_mode == PromptMode::Argument {
            args.push(request.prompt.clone());
        }
        args
    }

    fn interpret(&self, stdout: &str) -> Result<Analysis, AnalyzeError> {
        let envelope = match serde_json::from_str::<CliEnvelope>(stdout.trim()) {
            Ok(envelope) => envelope,
            Err(_) => {
                // Plain-text output mode: no envelope, no usage figures.
                let document = parse_json_document(stdout)?;
                self.tracker.record(0, 0);
                return Ok(Analysis {
                    document,
                    input_tokens: 0,
                    output_tokens: 0,
                });
            }
        };

        self.tracker
            .record(envelope.usage.input_tokens, envelope.usage.output_tokens);

        if let Some(session) = envelope.session_id.clone() {
            if self.resume_sessions {
                if let Ok(mut slot) = self.session_id.lock() {
                    *slot = Some(session);
                }
            }
        }

        if envelope.is_error {
            let message = match &envelope.result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(AnalyzeError::Reported(message));
        }

        let document = match envelope.result {
            Value::String(text) => parse_json_document(&text)?,
            value @ Value::Object(_) => value,
            _ => return Err(ParseError::NoJsonObject.into()),
        };

        Ok(Analysis {
            document,
            input_tokens: envelope.usage.input_tokens,
            output_tokens: envelope.usage.output_tokens,
        })
    }
}

#[async_trait]
impl Analyzer for CliAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Analysis, AnalyzeError> {
        let args = self.build_args(request);
        tracing::debug!("{}: invoking {} ({} args)", self.tracker.owner(), self.program, args.len());

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(if self.prompt_mode == PromptMode::Stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the child on timeout delivers SIGKILL.
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| AnalyzeError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // The prompt write runs under the same deadline as the wait. A CLI that
        // never drains stdin must not hold the call past the timeout.
        let stdin = child.stdin.take();
        let owner = self.tracker.owner();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            let written = match stdin.write_all(request.prompt.as_bytes()).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            };
            match written {
                // The CLI exited or closed stdin early; its exit status tells the story.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    tracing::debug!("{}: LLM CLI closed stdin early", owner);
                    Ok(())
                }
                other => other,
            }
        };
        let run = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            let output = output?;
            fed?;
            Ok::<_, std::io::Error>(output)
        };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!("{}: LLM CLI timeout after {:?}", self.tracker.owner(), self.timeout);
                return Err(AnalyzeError::Timeout(self.timeout));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::error!("{}: LLM CLI failed ({:?}): {}", self.tracker.owner(), output.status.code(), stderr);
            return Err(AnalyzeError::Exit {
                code: output.status.code(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        self.interpret(&stdout)
    }

    fn reset_session(&self) {
        if let Ok(mut slot) = self.session_id.lock() {
            *slot = None;
        }
    }
}
