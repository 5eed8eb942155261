// [[ASSEMBLY]]/apps/orchestrator-server/src/config.rs
// Purpose: Orchestrator settings. Read once from the environment at boot.
// Architecture: Application Boot

use assembly_core::{AgentDescriptor, AgentType, AGENT_TOKEN_LIMIT, ORCHESTRATOR_TOKEN_LIMIT, PIPELINE_ORDER};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Variables an agent child may inherit. Everything else is cleared.
const DEFAULT_PASSTHROUGH: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "SUPABASE_URL",
    "SUPABASE_SERVICE_KEY",
    "LLM_CLI_PATH",
    "LLM_CLI_ARGS",
    "LLM_PROMPT_MODE",
    "LLM_TIMEOUT_SECS",
    "AGENT_TOKEN_LIMIT",
    "ANTHROPIC_API_KEY",
];

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub port: u16,
    pub agent_host: String,
    /// Program spawned for every agent; `AGENT_TYPE` and `PORT` pick the stage.
    pub agent_command: String,
    pub agent_args: Vec<String>,
    /// Configured stages, always in pipeline order.
    pub agents: Vec<AgentDescriptor>,
    pub env_passthrough: Vec<String>,

    pub health_check_interval: Duration,
    pub health_timeout: Duration,
    pub settle_delay: Duration,
    pub stop_grace: Duration,
    pub restart_delay: Duration,
    pub max_auto_restarts: u32,
    pub token_recycle_delay: Duration,
    pub refresh_delay: Duration,
    pub refresh_delay_staggered: Duration,

    pub stage_timeout: Duration,
    pub stage_pacing: bool,
    pub continuous_interval: Duration,

    pub agent_token_limit: u64,
    pub orchestrator_token_limit: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            port: 4000,
            agent_host: "127.0.0.1".to_string(),
            agent_command: "assembly-agent".to_string(),
            agent_args: Vec::new(),
            agents: AgentDescriptor::defaults(),
            env_passthrough: DEFAULT_PASSTHROUGH.iter().map(|s| s.to_string()).collect(),
            health_check_interval: Duration::from_secs(10),
            health_timeout: Duration::from_secs(2),
            settle_delay: Duration::from_secs(3),
            stop_grace: Duration::from_secs(5),
            restart_delay: Duration::from_secs(2),
            max_auto_restarts: 3,
            token_recycle_delay: Duration::from_secs(1),
            refresh_delay: Duration::from_secs(1),
            refresh_delay_staggered: Duration::from_secs(2),
            stage_timeout: Duration::from_secs(300),
            stage_pacing: true,
            continuous_interval: Duration::from_secs(30),
            agent_token_limit: AGENT_TOKEN_LIMIT,
            orchestrator_token_limit: ORCHESTRATOR_TOKEN_LIMIT,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = OrchestratorConfig::default();

        let selected: Vec<AgentType> = match env::var("PIPELINE_AGENTS") {
            Ok(raw) if !raw.trim().is_empty() => {
                let mut picked = raw
                    .split(',')
                    .map(|s| s.parse::<AgentType>())
                    .collect::<Result<Vec<_>, _>>()?;
                picked.sort_by_key(|t| pipeline_position(*t));
                picked.dedup();
                picked
            }
            _ => PIPELINE_ORDER.to_vec(),
        };

        let agents = selected
            .into_iter()
            .map(|agent_type| {
                let descriptor = AgentDescriptor::default_for(agent_type);
                let key = format!("AGENT_PORT_{}", agent_type.as_str().to_uppercase());
                let port = env_parse(&key, descriptor.port);
                descriptor.with_port(port)
            })
            .collect();

        let mut env_passthrough = defaults.env_passthrough.clone();
        if let Ok(extra) = env::var("AGENT_ENV_PASSTHROUGH") {
            env_passthrough.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }

        Ok(OrchestratorConfig {
            port: env_parse("ORCHESTRATOR_PORT", defaults.port),
            agent_host: env::var("AGENT_HOST").unwrap_or(defaults.agent_host),
            agent_command: env::var("AGENT_COMMAND").unwrap_or(defaults.agent_command),
            agent_args: env::var("AGENT_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            agents,
            env_passthrough,
            health_check_interval: env_millis("HEALTH_CHECK_INTERVAL_MS", defaults.health_check_interval),
            health_timeout: env_millis("HEALTH_TIMEOUT_MS", defaults.health_timeout),
            settle_delay: env_millis("AGENT_SETTLE_MS", defaults.settle_delay),
            stop_grace: env_millis("AGENT_STOP_GRACE_MS", defaults.stop_grace),
            restart_delay: env_millis("AGENT_RESTART_DELAY_MS", defaults.restart_delay),
            max_auto_restarts: env_parse("MAX_AUTO_RESTARTS", defaults.max_auto_restarts),
            token_recycle_delay: defaults.token_recycle_delay,
            refresh_delay: defaults.refresh_delay,
            refresh_delay_staggered: defaults.refresh_delay_staggered,
            stage_timeout: Duration::from_secs(env_parse("STAGE_TIMEOUT_SECS", defaults.stage_timeout.as_secs())),
            stage_pacing: defaults.stage_pacing,
            continuous_interval: Duration::from_secs(env_parse(
                "CONTINUOUS_INTERVAL_SECS",
                defaults.continuous_interval.as_secs(),
            )),
            agent_token_limit: env_parse("AGENT_TOKEN_LIMIT", defaults.agent_token_limit),
            orchestrator_token_limit: env_parse("ORCHESTRATOR_TOKEN_LIMIT", defaults.orchestrator_token_limit),
        })
    }

    pub fn descriptor(&self, agent: AgentType) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|d| d.agent_type == agent)
    }
}

fn pipeline_position(agent: AgentType) -> usize {
    PIPELINE_ORDER.iter().position(|t| *t == agent).unwrap_or(usize::MAX)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}='{}'", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_stage() {
        let config = OrchestratorConfig::default();
        let ports: Vec<u16> = config.agents.iter().map(|d| d.port).collect();
        assert_eq!(ports, vec![3001, 3002, 3003, 3004, 3006]);
        assert_eq!(config.max_auto_restarts, 3);
        assert_eq!(config.descriptor(AgentType::Pipeline).map(|d| d.port), Some(3006));
        assert!(config.env_passthrough.iter().any(|v| v == "PATH"));
    }
}
