//! Replay backoff: exponential with equal jitter.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

use recall_types::config::OutboxConfig;

/// Lower bound of the jitter factor applied to the exponential delay.
pub const JITTER_FLOOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed replay attempts before an entry is dead-lettered.
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&OutboxConfig::default())
    }
}

impl From<&OutboxConfig> for RetryPolicy {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based):
    /// `min(cap, base * 2^(attempt - 1))`.
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Delay for `attempt` scaled by `jitter`, clamped to `[0.5, 1.0]`.
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        self.ceiling_for(attempt)
            .mul_f64(jitter.clamp(JITTER_FLOOR, 1.0))
    }

    /// Delay for `attempt` with a random jitter factor.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_FLOOR..=1.0);
        self.delay_for(attempt, jitter)
    }

    /// Wall-clock time of the next attempt after failure number `attempt`.
    pub fn next_attempt_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.next_delay(attempt)).unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }
}
