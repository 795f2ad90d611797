//! # Circuit Breaker Snapshots
//!
//! In-process counters behind [`CircuitBreaker::metrics`] and the registry's
//! health score. Exported instruments (state gauge, rejection counter) live
//! in [`crate::metrics::resilience`].
//!
//! [`CircuitBreaker::metrics`]: crate::resilience::CircuitBreaker::metrics

use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Closed breakers above this failure rate count as degraded
const DEGRADED_FAILURE_RATE: f64 = 0.1;

/// Counters for one breaker since it was created
///
/// Rejected calls never reached the target and are excluded from
/// `total_calls` and `failure_rate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rejected_count: u64,
    /// Failures still inside the rolling window at snapshot time
    pub window_failures: u64,
    pub half_open_successes: u64,
    /// Times the circuit has tripped open
    pub open_count: u64,
    pub total_duration: Duration,
    pub current_state: CircuitState,
    pub failure_rate: f64,
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
            window_failures: 0,
            half_open_successes: 0,
            open_count: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Open is unhealthy, half-open is given the benefit of the doubt
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.failure_rate < DEGRADED_FAILURE_RATE,
        }
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of every breaker held by a registry, keyed by target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,
    pub collected_at: chrono::DateTime<chrono::Utc>,
}

impl SystemCircuitBreakerMetrics {
    /// Targets currently failing fast, sorted
    pub fn open_circuits(&self) -> Vec<&str> {
        let mut open: Vec<&str> = self
            .circuit_breakers
            .iter()
            .filter_map(|(target, m)| (m.current_state == CircuitState::Open).then_some(target.as_str()))
            .collect();
        open.sort_unstable();
        open
    }

    /// Share of healthy breakers; 1.0 for an empty registry
    pub fn health_score(&self) -> f64 {
        let total = self.circuit_breakers.len();
        if total == 0 {
            return 1.0;
        }
        let healthy = self.circuit_breakers.values().filter(|m| m.is_healthy()).count();
        healthy as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_state(state: CircuitState, failure_rate: f64) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            current_state: state,
            failure_rate,
            ..CircuitBreakerMetrics::new()
        }
    }

    #[test]
    fn test_health_by_state_and_rate() {
        assert!(with_state(CircuitState::Closed, 0.05).is_healthy());
        assert!(!with_state(CircuitState::Closed, 0.5).is_healthy());
        assert!(with_state(CircuitState::HalfOpen, 1.0).is_healthy());
        assert!(!with_state(CircuitState::Open, 0.0).is_healthy());
    }

    #[test]
    fn test_system_snapshot() {
        let empty = SystemCircuitBreakerMetrics {
            circuit_breakers: HashMap::new(),
            collected_at: chrono::Utc::now(),
        };
        assert!((empty.health_score() - 1.0).abs() < f64::EPSILON);

        let snapshot = SystemCircuitBreakerMetrics {
            circuit_breakers: HashMap::from([
                ("payment_provider".to_string(), with_state(CircuitState::Open, 1.0)),
                ("llm_provider".to_string(), with_state(CircuitState::Closed, 0.0)),
                ("browser_engine".to_string(), with_state(CircuitState::Open, 0.9)),
                ("search".to_string(), with_state(CircuitState::Closed, 0.0)),
            ]),
            collected_at: chrono::Utc::now(),
        };
        assert_eq!(snapshot.open_circuits(), vec!["browser_engine", "payment_provider"]);
        assert!((snapshot.health_score() - 0.5).abs() < f64::EPSILON);
    }
}
