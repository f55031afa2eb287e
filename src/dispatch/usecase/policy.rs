//! Retry and wait policies, kept free of I/O and of operator prompts.

use std::time::Duration;

use tokio::time::Instant;

use crate::dispatch::core::config::{OrchestratorConfig, PlcConfig, WaitReadFailure};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissVerdict {
    /// Try again once the back-off has elapsed.
    RetryAfter(Instant),
    GiveUp,
}

/// One bounded counter per process for transport errors and "mission not
/// found" answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_misses: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_misses: config.max_poll_misses.max(1),
            backoff: config.retry_backoff(),
        }
    }

    /// Counts one miss; gives up when the count reaches the bound.
    pub fn record_miss(&self, misses: &mut u32, now: Instant) -> MissVerdict {
        *misses = misses.saturating_add(1);
        if *misses >= self.max_misses {
            MissVerdict::GiveUp
        } else {
            MissVerdict::RetryAfter(now + self.backoff)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub on_read_failure: WaitReadFailure,
}

impl WaitPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            interval: config.wait_interval(),
            timeout: Duration::from_millis(config.wait_timeout_ms),
            on_read_failure: config.wait_read_failure,
        }
    }

    /// Per-operation timeout, falling back to the configured default.
    pub fn timeout_for(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms.map_or(self.timeout, Duration::from_millis)
    }
}

/// Local retry of a PLC sub-operation after a transient error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlcRetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for PlcRetryPolicy {
    fn default() -> Self {
        Self::from_config(&PlcConfig::default())
    }
}

impl PlcRetryPolicy {
    pub fn from_config(config: &PlcConfig) -> Self {
        Self {
            retries: config.retry_count,
            delay: config.retry_delay(),
        }
    }

    /// Whether a failed attempt number `attempt` (0-based) may be followed by another.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.retries
    }
}
