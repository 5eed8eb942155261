// [[ASSEMBLY]]/libs/assembly-core/src/tokens.rs
// Purpose: Cumulative LLM token accounting with a recycle ceiling.
// Architecture: Domain Logic Layer
// Dependencies: chrono, serde, tracing

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Ceiling past which a stage agent should be recycled.
pub const AGENT_TOKEN_LIMIT: u64 = 100_000;
/// Ceiling for the orchestrator's own communication tracker.
pub const ORCHESTRATOR_TOKEN_LIMIT: u64 = 150_000;

#[derive(Debug, Clone)]
struct Counters {
    input_tokens: u64,
    output_tokens: u64,
    api_calls: u64,
    last_reset: DateTime<Utc>,
}

impl Counters {
    fn zeroed(last_reset: DateTime<Utc>) -> Self {
        Counters {
            input_tokens: 0,
            output_tokens: 0,
            api_calls: 0,
            last_reset,
        }
    }
}

/// Point-in-time view of a tracker. This is also the `/agent-tokens` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub agent: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub api_calls: u64,
    pub last_reset: DateTime<Utc>,
    #[serde(default)]
    pub token_limit: u64,
    pub restart_recommended: bool,
    pub usage_percentage: f64,
    #[serde(default)]
    pub tokens_remaining: u64,
}

impl TokenUsage {
    /// Placeholder used when an agent cannot be reached.
    pub fn empty(agent: &str, token_limit: u64) -> Self {
        TokenUsage {
            agent: agent.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            api_calls: 0,
            last_reset: Utc::now(),
            token_limit,
            restart_recommended: false,
            usage_percentage: 0.0,
            tokens_remaining: token_limit,
        }
    }
}

pub struct TokenTracker {
    owner: String,
    ceiling: u64,
    counters: Mutex<Counters>,
}

impl TokenTracker {
    pub fn new(owner: impl Into<String>, ceiling: u64) -> Self {
        TokenTracker {
            owner: owner.into(),
            ceiling,
            counters: Mutex::new(Counters::zeroed(Utc::now())),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Adds one completed call's usage. Never fails.
    pub fn record(&self, input_tokens: u64, output_tokens: u64) -> TokenUsage {
        {
            let mut counters = self.lock();
            counters.input_tokens = counters.input_tokens.saturating_add(input_tokens);
            counters.output_tokens = counters.output_tokens.saturating_add(output_tokens);
            counters.api_calls += 1;
        }

        let usage = self.usage();
        tracing::debug!(
            "{} tokens: +{}/{} (total: {}/{})",
            self.owner,
            input_tokens,
            output_tokens,
            usage.total_tokens,
            self.ceiling
        );
        if usage.restart_recommended {
            tracing::warn!(
                "{} exceeded token limit: {}/{} - restart recommended",
                self.owner,
                usage.total_tokens,
                self.ceiling
            );
        }
        usage
    }

    pub fn usage(&self) -> TokenUsage {
        let counters = self.lock().clone();
        let total_tokens = counters.input_tokens + counters.output_tokens;
        let usage_percentage = if self.ceiling == 0 {
            0.0
        } else {
            total_tokens as f64 / self.ceiling as f64 * 100.0
        };

        TokenUsage {
            agent: self.owner.clone(),
            input_tokens: counters.input_tokens,
            output_tokens: counters.output_tokens,
            total_tokens,
            api_calls: counters.api_calls,
            last_reset: counters.last_reset,
            token_limit: self.ceiling,
            restart_recommended: total_tokens > self.ceiling,
            usage_percentage,
            tokens_remaining: self.ceiling.saturating_sub(total_tokens),
        }
    }

    /// Zeroes the counters. The new `last_reset` is always later than the
    /// previous one, even when two resets land on the same clock tick.
    pub fn reset(&self) -> TokenUsage {
        let previous_total = {
            let mut counters = self.lock();
            let previous_total = counters.input_tokens + counters.output_tokens;
            let mut stamp = Utc::now();
            if stamp <= counters.last_reset {
                stamp = counters.last_reset + Duration::microseconds(1);
            }
            *counters = Counters::zeroed(stamp);
            previous_total
        };

        tracing::info!("{} token usage reset (was: {} tokens)", self.owner, previous_total);
        self.usage()
    }

    pub fn should_restart(&self) -> bool {
        self.usage().restart_recommended
    }

    // The lock is never held across an await or a panic-prone call, so a
    // poisoned mutex still holds consistent counters.
    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Rough text-to-token estimate (3.5 chars per token) for communication
/// overhead. Never used for recycle decisions.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as f64 / 3.5).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates_totals_and_calls() {
        let tracker = TokenTracker::new("flowchart_mapper", AGENT_TOKEN_LIMIT);
        let calls = [(120, 40), (3_000, 900), (7, 0)];
        for (input, output) in calls {
            tracker.record(input, output);
        }

        let usage = tracker.usage();
        assert_eq!(usage.input_tokens, 3_127);
        assert_eq!(usage.output_tokens, 940);
        assert_eq!(usage.total_tokens, usage.input_tokens + usage.output_tokens);
        assert_eq!(usage.api_calls, 3);
        assert!(!usage.restart_recommended);
    }

    #[test]
    fn test_reset_zeroes_and_advances_stamp() {
        let tracker = TokenTracker::new("network_mapper", AGENT_TOKEN_LIMIT);
        tracker.record(10, 10);
        let first = tracker.reset();
        let second = tracker.reset();

        assert_eq!(second.total_tokens, 0);
        assert_eq!(second.api_calls, 0);
        assert!(second.last_reset > first.last_reset);
    }

    #[test]
    fn test_restart_flag_is_derived_from_ceiling() {
        let tracker = TokenTracker::new("metadata_hunter", 1_000);
        tracker.record(600, 400);
        assert!(!tracker.should_restart(), "exactly at the ceiling is still fine");

        tracker.record(1_000, 500);
        let usage = tracker.usage();
        assert!(usage.restart_recommended);
        assert_eq!(usage.usage_percentage, 250.0);
        assert_eq!(usage.tokens_remaining, 0);

        tracker.reset();
        assert!(!tracker.should_restart());
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 3);
    }
}
