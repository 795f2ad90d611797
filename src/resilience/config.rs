//! # Circuit Breaker Configuration
//!
//! Per-target breaker settings with validation and presets for the external
//! dependencies the engine talks to.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Well-known breaker targets
pub mod targets {
    pub const PAYMENT_PROVIDER: &str = "payment_provider";
    pub const BROWSER_ENGINE: &str = "browser_engine";
    pub const LLM_PROVIDER: &str = "llm_provider";
}

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within `rolling_window` that open the circuit
    pub failure_threshold: u32,

    /// Trailing window failures are counted over (seconds)
    pub rolling_window_seconds: u64,

    /// Time to stay open before probing recovery (seconds)
    pub recovery_timeout_seconds: u64,

    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,

    /// Probe calls admitted concurrently while half-open
    ///
    /// Defaults to `success_threshold` when unset.
    pub half_open_max_calls: Option<u32>,
}

impl CircuitBreakerConfig {
    /// Payment provider: slow to recover, give it a full minute
    pub fn for_payment_provider() -> Self {
        Self {
            recovery_timeout_seconds: 60,
            ..Self::default()
        }
    }

    /// Headless-browser automation engine
    pub fn for_browser_engine() -> Self {
        Self {
            recovery_timeout_seconds: 30,
            ..Self::default()
        }
    }

    /// LLM provider
    pub fn for_llm_provider() -> Self {
        Self {
            recovery_timeout_seconds: 45,
            ..Self::default()
        }
    }

    pub fn rolling_window(&self) -> Duration {
        Duration::from_secs(self.rolling_window_seconds)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }

    pub fn half_open_max_calls(&self) -> u32 {
        self.half_open_max_calls.unwrap_or(self.success_threshold)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.rolling_window_seconds == 0 {
            return Err("rolling_window_seconds must be greater than 0".to_string());
        }

        if self.recovery_timeout_seconds == 0 {
            return Err("recovery_timeout_seconds must be greater than 0".to_string());
        }

        if self.recovery_timeout_seconds > 300 {
            return Err("recovery_timeout_seconds should not exceed 300".to_string());
        }

        if self.success_threshold == 0 {
            return Err("success_threshold must be greater than 0".to_string());
        }

        if self.half_open_max_calls() == 0 {
            return Err("half_open_max_calls must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            rolling_window_seconds: 60,
            recovery_timeout_seconds: 30,
            success_threshold: 2,
            half_open_max_calls: None,
        }
    }
}

/// Breaker settings for every target: one default plus per-target overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub default: CircuitBreakerConfig,
    pub targets: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerSettings {
    /// Configuration a breaker named `target` is created with
    pub fn config_for_target(&self, target: &str) -> CircuitBreakerConfig {
        self.targets
            .get(target)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn validate(&self) -> Result<(), String> {
        self.default
            .validate()
            .map_err(|e| format!("circuit_breakers.default: {e}"))?;
        for (target, config) in &self.targets {
            config
                .validate()
                .map_err(|e| format!("circuit_breakers.targets.{target}: {e}"))?;
        }
        Ok(())
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let targets = HashMap::from([
            (
                targets::PAYMENT_PROVIDER.to_string(),
                CircuitBreakerConfig::for_payment_provider(),
            ),
            (
                targets::BROWSER_ENGINE.to_string(),
                CircuitBreakerConfig::for_browser_engine(),
            ),
            (
                targets::LLM_PROVIDER.to_string(),
                CircuitBreakerConfig::for_llm_provider(),
            ),
        ]);
        Self {
            default: CircuitBreakerConfig::default(),
            targets,
        }
    }
}
