use std::time::Duration;

use serde::Serialize;

use crate::config::BackoffConfig;

/// Exponential reconnect policy: `delay = min(base * 2^attempt, cap)`,
/// giving up after `max_attempts` consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Calculate exponential backoff delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(20));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_ms),
            Duration::from_millis(config.cap_ms),
            config.max_attempts,
        )
    }
}

/// Published state of one stream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub connected: bool,
    /// Consecutive failed attempts since the last successful open.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Page hidden: transport closed, no reconnect attempts.
    pub suspended: bool,
    /// Retries exhausted; only a manual reconnect leaves this state.
    pub lost: bool,
}

impl ConnectionState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            connected: false,
            attempt: 0,
            max_attempts,
            suspended: false,
            lost: false,
        }
    }

    /// True when the driver is neither connected nor going to retry on its own.
    pub fn is_idle(&self) -> bool {
        self.suspended || self.lost
    }
}
