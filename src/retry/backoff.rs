//! # Backoff Calculator
//!
//! Exponential backoff with additive jitter and a hard cap:
//!
//! ```text
//! delay = min(base_delay * 2^attempts + jitter, max_delay)
//! ```
//!
//! `jitter` is drawn uniformly from `[0, max_jitter]` to spread retries of
//! jobs that failed together.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BackoffConfig;

/// Configuration for backoff calculation behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffCalculatorConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for BackoffCalculatorConfig {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for BackoffCalculatorConfig {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            max_jitter: config.max_jitter(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffCalculator {
    config: BackoffCalculatorConfig,
}

impl BackoffCalculator {
    pub fn new(config: BackoffCalculatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffCalculatorConfig {
        &self.config
    }

    /// Delay before the retry that follows `attempts` recorded attempts
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let jitter_ms = self.config.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        };
        self.delay_with_jitter(attempts, jitter)
    }

    /// Deterministic form of [`Self::delay_for`] with a caller-chosen jitter
    pub fn delay_with_jitter(&self, attempts: u32, jitter: Duration) -> Duration {
        self.exponential(attempts)
            .saturating_add(jitter)
            .min(self.config.max_delay)
    }

    /// `base_delay * 2^attempts`, saturating instead of overflowing
    fn exponential(&self, attempts: u32) -> Duration {
        match 1u32.checked_shl(attempts) {
            Some(factor) => self
                .config
                .base_delay
                .checked_mul(factor)
                .unwrap_or(Duration::MAX),
            None => Duration::MAX,
        }
    }
}
