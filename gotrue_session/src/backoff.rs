//! Retry backoff for refresh requests

use std::time::Duration;

use crate::session::AUTO_REFRESH_TICK_DURATION;

/// Configuration for how to back off when a refresh fails with a retryable
/// error
#[derive(Clone, Debug)]
pub struct RefreshBackoffConfig {
    initial_delay: Duration,
    multiplier: u32,
    budget: Duration,
}

impl Default for RefreshBackoffConfig {
    /// Default backoff configuration
    ///
    /// Starts at 200 ms and doubles on every failure. Retries stop once the
    /// next attempt would start more than one auto-refresh tick (30 seconds)
    /// after the first.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            multiplier: 2,
            budget: AUTO_REFRESH_TICK_DURATION,
        }
    }
}

impl RefreshBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// The delay before retry `n` (counting from 1) is
    /// `initial_delay * multiplier^(n-1)`. A retry is only attempted if it
    /// would start within `budget` of the first attempt.
    pub fn new(initial_delay: Duration, multiplier: u32, budget: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            budget,
        }
    }

    /// The delay to wait after failed attempt `attempt` (counting from 0)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }
}

/// A stateful handler counting the attempts of one refresh
#[derive(Debug)]
pub struct RefreshBackoffHandler {
    config: RefreshBackoffConfig,
    attempt: u32,
}

impl RefreshBackoffHandler {
    /// Constructs a new handler from a [`RefreshBackoffConfig`]
    pub fn new(config: RefreshBackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// The attempt about to be made, counting from 0
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reports a retryable failure `elapsed` after the first attempt started
    ///
    /// Returns how long to wait before the next attempt, or `None` when the
    /// retry budget is spent.
    pub fn error(&mut self, elapsed: Duration) -> Option<Duration> {
        let delay = self.config.delay_after(self.attempt);
        if elapsed.saturating_add(delay) < self.config.budget {
            self.attempt += 1;
            Some(delay)
        } else {
            None
        }
    }
}

impl From<RefreshBackoffConfig> for RefreshBackoffHandler {
    fn from(config: RefreshBackoffConfig) -> Self {
        Self::new(config)
    }
}
