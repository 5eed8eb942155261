// [[ASSEMBLY]]/apps/agent-server/src/config.rs
// Purpose: Agent process settings, read once from the environment.

use assembly_core::{AgentDescriptor, AgentType, AGENT_TOKEN_LIMIT};
use std::env;
use std::time::Duration;

use crate::analyzer::PromptMode;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_type: AgentType,
    pub descriptor: AgentDescriptor,
    pub port: u16,
    pub cli_path: String,
    pub cli_args: Vec<String>,
    pub prompt_mode: PromptMode,
    pub cli_timeout: Duration,
    pub token_limit: u64,
    pub context: ContextFlags,
}

/// Restart markers the orchestrator sets on a supervised (re)start.
///
/// `clear_context` (also implied by `token_reset`) turns CLI session resumption
/// off for the whole process lifetime, so every book starts a new
/// conversation. `fresh_start` alone only marks the process as a supervised
/// restart; sessions the new process opens may still be resumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextFlags {
    pub clear_context: bool,
    pub fresh_start: bool,
    pub token_reset: bool,
}

impl ContextFlags {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| matches!(lookup(key).as_deref(), Some("true") | Some("1"));
        ContextFlags {
            clear_context: flag("CLEAR_CONTEXT"),
            fresh_start: flag("FRESH_START"),
            token_reset: flag("TOKEN_RESET"),
        }
    }

    pub fn resume_sessions(&self) -> bool {
        !(self.clear_context || self.token_reset)
    }
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let agent_type: AgentType = env::var("AGENT_TYPE")
            .map_err(|_| anyhow::anyhow!("AGENT_TYPE must be set (flowchart|network|metadata|synthesis|pipeline)"))?
            .parse()?;
        let descriptor = AgentDescriptor::default_for(agent_type);

        let port = match env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid PORT '{}': {}", raw, e))?,
            Err(_) => descriptor.port,
        };

        let prompt_mode = match env::var("LLM_PROMPT_MODE").as_deref() {
            Ok("stdin") => PromptMode::Stdin,
            _ => PromptMode::Argument,
        };

        Ok(AgentConfig {
            agent_type,
            port,
            cli_path: env::var("LLM_CLI_PATH").unwrap_or_else(|_| "claude".to_string()),
            cli_args: env::var("LLM_CLI_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            prompt_mode,
            cli_timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS", 300)),
            token_limit: env_parse("AGENT_TOKEN_LIMIT", AGENT_TOKEN_LIMIT),
            context: ContextFlags::from_lookup(|key| env::var(key).ok()),
            descriptor: descriptor.with_port(port),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}='{}'", key, raw);
            default
        }),
        Err(_) => default,
    }
}
