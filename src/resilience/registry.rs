//! # Circuit Breaker Registry
//!
//! Explicit owner of every breaker in the process, keyed by target name.
//! Components that call external dependencies receive an
//! `Arc<CircuitBreakerRegistry>` at construction and look their breaker up
//! by target, so all call sites for one target share one state machine.

use crate::resilience::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerSettings, CircuitState,
    SystemCircuitBreakerMetrics,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: CircuitBreakerSettings,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        info!(
            configured_targets = settings.targets.len(),
            "Initializing circuit breaker registry"
        );
        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    /// Get or create the breaker for `target`
    ///
    /// Created on first use from the target's configured settings.
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return Arc::clone(existing.value());
        }
        // shard lock is held by the entry; release it before calling len()
        let (breaker, created) = match self.breakers.entry(target.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let breaker = Arc::new(CircuitBreaker::new(
                    target,
                    self.settings.config_for_target(target),
                ));
                entry.insert(Arc::clone(&breaker));
                (breaker, true)
            }
        };
        if created {
            info!(
                target_name = target,
                total_circuit_breakers = self.breakers.len(),
                "Created new circuit breaker"
            );
        }
        breaker
    }

    /// Existing breaker for `target`, without creating one
    pub fn find(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(target).map(|b| Arc::clone(b.value()))
    }

    /// Names of all breakers created so far
    pub fn list_targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    pub fn states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect()
    }

    pub fn target_metrics(&self, target: &str) -> Option<CircuitBreakerMetrics> {
        self.find(target).map(|b| b.metrics())
    }

    pub fn system_metrics(&self) -> SystemCircuitBreakerMetrics {
        SystemCircuitBreakerMetrics {
            circuit_breakers: self
                .breakers
                .iter()
                .map(|e| (e.key().clone(), e.value().metrics()))
                .collect(),
            collected_at: chrono::Utc::now(),
        }
    }

    /// Operator override; returns false when the target has no breaker yet
    pub fn force_open(&self, target: &str) -> bool {
        match self.find(target) {
            Some(breaker) => {
                breaker.force_open();
                true
            }
            None => false,
        }
    }

    /// Operator override; returns false when the target has no breaker yet
    pub fn force_closed(&self, target: &str) -> bool {
        match self.find(target) {
            Some(breaker) => {
                breaker.force_closed();
                true
            }
            None => false,
        }
    }

    /// Force open all circuit breakers (emergency stop)
    pub fn force_open_all(&self) {
        warn!("🚨 Forcing all circuit breakers open (emergency stop)");
        for entry in self.breakers.iter() {
            entry.value().force_open();
        }
    }

    /// Force close all circuit breakers (emergency recovery)
    pub fn force_close_all(&self) {
        warn!("🚨 Forcing all circuit breakers closed (emergency recovery)");
        for entry in self.breakers.iter() {
            entry.value().force_closed();
        }
    }

    /// Fraction of healthy breakers (1.0 when none exist)
    pub fn health_score(&self) -> f64 {
        self.system_metrics().health_score()
    }
}
