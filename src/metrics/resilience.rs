//! # Circuit Breaker Metrics
//!
//! State gauge (0=closed, 1=open, 2=half-open) and rejection counter,
//! labeled by target name.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

use super::labels;
use crate::resilience::CircuitState;

/// Looked up per call; the global provider changes at `init_metrics`
fn meter() -> Meter {
    opentelemetry::global::meter("jobrelay-resilience")
}

pub fn circuit_state() -> Gauge<u64> {
    meter()
        .u64_gauge("jobrelay.circuit.state")
        .with_description("Circuit breaker state (0=closed, 1=open, 2=half-open)")
        .build()
}

pub fn circuit_rejections_total() -> Counter<u64> {
    meter()
        .u64_counter("jobrelay.circuit.rejections.total")
        .with_description("Calls rejected by an open circuit breaker")
        .build()
}

pub fn record_circuit_state(target: &str, state: CircuitState) {
    circuit_state().record(
        state.as_gauge(),
        &labels(&[KeyValue::new("target", target.to_string())]),
    );
}

pub fn record_circuit_rejection(target: &str) {
    circuit_rejections_total().add(1, &labels(&[KeyValue::new("target", target.to_string())]));
}
