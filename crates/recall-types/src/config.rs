//! Configuration types for Recall.
//!
//! `RecallConfig` represents the top-level `config.toml`. Every section and
//! field has a default, so an empty file (or no file at all) yields a working
//! configuration. `validate()` rejects values that would make the memory layer
//! misbehave; it runs once at construction time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for the conversation memory layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub durability: DurabilityConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
}

impl RecallConfig {
    /// Check every section, returning the first invalid value found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.conversation.validate()?;
        self.durability.validate()?;
        self.breaker.validate()?;
        self.outbox.validate()
    }
}

/// Sliding-window and prompt-rendering parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Turns (user + assistant pairs) kept in the context window.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Token budget for prompt assembly.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Older messages are cut to this many characters when rendered.
    #[serde(default = "default_compact_length")]
    pub compact_length: usize,
    /// Trailing messages rendered in full.
    #[serde(default = "default_full_recent_messages")]
    pub full_recent_messages: usize,
}

fn default_max_turns() -> u32 {
    3
}

fn default_max_tokens() -> u32 {
    2_000
}

fn default_compact_length() -> usize {
    150
}

fn default_full_recent_messages() -> usize {
    2
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_tokens: default_max_tokens(),
            compact_length: default_compact_length(),
            full_recent_messages: default_full_recent_messages(),
        }
    }
}

impl ConversationConfig {
    /// Maximum number of messages a context window may hold.
    pub fn window_messages(&self) -> usize {
        self.max_turns as usize * 2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_turns == 0 {
            return Err(ConfigError::invalid("conversation.max_turns", "must be at least 1"));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::invalid("conversation.max_tokens", "must be at least 1"));
        }
        if self.compact_length < 4 {
            return Err(ConfigError::invalid(
                "conversation.compact_length",
                "must leave room for the ellipsis (at least 4)",
            ));
        }
        Ok(())
    }
}

/// Durable write path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurabilityConfig {
    /// When false the memory layer runs in memory-only mode.
    #[serde(default = "default_durability_enabled")]
    pub enabled: bool,
    /// Upper bound on a single durable write attempt.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// SQLite database file name inside the data directory.
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

fn default_durability_enabled() -> bool {
    true
}

fn default_write_timeout_ms() -> u64 {
    2_000
}

fn default_database_file() -> String {
    "recall.db".to_string()
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            enabled: default_durability_enabled(),
            write_timeout_ms: default_write_timeout_ms(),
            database_file: default_database_file(),
        }
    }
}

impl DurabilityConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::invalid("durability.write_timeout_ms", "must be positive"));
        }
        if self.database_file.trim().is_empty() {
            return Err(ConfigError::invalid("durability.database_file", "must not be empty"));
        }
        Ok(())
    }
}

/// Circuit breaker thresholds for the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("breaker.failure_threshold", "must be at least 1"));
        }
        Ok(())
    }
}

/// Outbox replay and retry policy.
///
/// Retry delay for attempt `n` is `min(backoff_cap, backoff_base * 2^(n-1))`
/// scaled by a random factor in `[0.5, 1.0]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Replay attempts before an entry is moved to the dead-letter log.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Period of the background replay loop.
    #[serde(default = "default_replay_interval_ms")]
    pub replay_interval_ms: u64,
    /// Directory (inside the data directory) holding the outbox logs.
    #[serde(default = "default_outbox_dir")]
    pub dir: String,
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_cap_ms() -> u64 {
    300_000
}

fn default_replay_interval_ms() -> u64 {
    10_000
}

fn default_outbox_dir() -> String {
    "outbox".to_string()
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            replay_interval_ms: default_replay_interval_ms(),
            dir: default_outbox_dir(),
        }
    }
}

impl OutboxConfig {
    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::invalid("outbox.max_retries", "must be at least 1"));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(ConfigError::invalid(
                "outbox.backoff_base_ms",
                format!("exceeds backoff_cap_ms ({})", self.backoff_cap_ms),
            ));
        }
        if self.replay_interval_ms == 0 {
            return Err(ConfigError::invalid("outbox.replay_interval_ms", "must be positive"));
        }
        Ok(())
    }
}
