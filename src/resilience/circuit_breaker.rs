//! # Circuit Breaker
//!
//! Fault isolation for calls to unreliable external dependencies, following
//! the classic three-state pattern: Closed (normal operation), Open (failing
//! fast) and Half-Open (probing recovery).
//!
//! Failures are counted over a trailing time window rather than as a
//! consecutive streak. All bookkeeping and state transitions for one breaker
//! happen under a single lock, so concurrent callers can neither double count
//! a failure nor race two transitions; the state is mirrored into an atomic
//! for lock-free reads.

use crate::metrics::resilience as breaker_metrics;
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Breaker state; the discriminant is the exported gauge value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls reach the target; failures are counted
    Closed = 0,
    /// Calls are rejected until the recovery timeout elapses
    Open = 1,
    /// A bounded number of probe calls decide between Closed and Open
    HalfOpen = 2,
}

impl CircuitState {
    /// Gauge encoding: 0=closed, 1=open, 2=half-open
    pub const fn as_gauge(self) -> u64 {
        self as u64
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by a breaker-protected call
///
/// `CircuitOpen` means the target was never contacted.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open for {target}")]
    CircuitOpen { target: String },

    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Permit {
    epoch: u64,
    half_open: bool,
}

/// An admitted call in flight
///
/// Dropped before an outcome is recorded (the caller's future was cancelled,
/// typically by a timeout), it counts as a failure so a half-open slot is
/// never left occupied.
struct AdmittedCall<'a> {
    breaker: &'a CircuitBreaker,
    permit: Option<Permit>,
    started: Instant,
}

impl AdmittedCall<'_> {
    fn succeeded(mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.on_success(permit, self.started.elapsed());
        }
    }

    fn failed(mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.on_failure(permit, self.started.elapsed());
        }
    }

    fn ignored(mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.on_ignored(permit, self.started.elapsed());
        }
    }
}

impl Drop for AdmittedCall<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            warn!(
                target_name = %self.breaker.name,
                half_open_probe = permit.half_open,
                "⏱️ Protected call abandoned before completing"
            );
            self.breaker.on_failure(permit, self.started.elapsed());
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

#[derive(Debug)]
struct BreakerInner {
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
    /// Bumped on every transition so late results from an earlier phase are ignored
    epoch: u64,
    metrics: CircuitBreakerMetrics,
}

impl BreakerInner {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-target circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            target_name = %name,
            failure_threshold = config.failure_threshold,
            rolling_window_seconds = config.rolling_window_seconds,
            recovery_timeout_seconds = config.recovery_timeout_seconds,
            success_threshold = config.success_threshold,
            "🛡️ Circuit breaker initialized"
        );
        breaker_metrics::record_circuit_state(&name, CircuitState::Closed);

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            inner: Mutex::new(BreakerInner {
                failures: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
                half_open_in_flight: 0,
                epoch: 0,
                metrics: CircuitBreakerMetrics::new(),
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` if the breaker admits it
    ///
    /// Every error returned by the operation counts as a target failure.
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(operation, |_| true).await
    }

    /// Execute an operation, counting only errors matched by `is_failure`
    ///
    /// Errors that say nothing about the target's health (bad input, for
    /// instance) are passed through without touching the failure window.
    pub async fn call_filtered<F, T, E, Fut, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let Some(permit) = self.admit() else {
            return Err(CircuitBreakerError::CircuitOpen {
                target: self.name.clone(),
            });
        };

        let call = AdmittedCall {
            breaker: self,
            permit: Some(permit),
            started: Instant::now(),
        };
        let result = operation().await;

        match &result {
            Ok(_) => call.succeeded(),
            Err(e) if is_failure(e) => call.failed(),
            Err(_) => call.ignored(),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Decide whether a call may reach the target
    fn admit(&self) -> Option<Permit> {
        let now = Instant::now();
        let mut transition = None;
        let permit = {
            let mut inner = self.inner.lock();
            match self.state() {
                CircuitState::Closed => Some(Permit {
                    epoch: inner.epoch,
                    half_open: false,
                }),
                CircuitState::Open => {
                    let recovered = inner.opened_at.map_or(true, |opened| {
                        now.saturating_duration_since(opened) >= self.config.recovery_timeout()
                    });
                    if recovered {
                        transition = Some(self.transition(&mut inner, CircuitState::HalfOpen, now));
                        inner.half_open_in_flight = 1;
                        Some(Permit {
                            epoch: inner.epoch,
                            half_open: true,
                        })
                    } else {
                        inner.metrics.rejected_count += 1;
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.config.half_open_max_calls() {
                        inner.half_open_in_flight += 1;
                        Some(Permit {
                            epoch: inner.epoch,
                            half_open: true,
                        })
                    } else {
                        inner.metrics.rejected_count += 1;
                        None
                    }
                }
            }
        };

        if let Some(t) = transition {
            self.emit_transition(t);
        }
        if permit.is_none() {
            warn!(
                target_name = %self.name,
                state = %self.state(),
                "⛔ Call rejected by circuit breaker"
            );
            breaker_metrics::record_circuit_rejection(&self.name);
        }
        permit
    }

    fn on_success(&self, permit: Permit, duration: Duration) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            inner.metrics.total_calls += 1;
            inner.metrics.success_count += 1;
            inner.metrics.total_duration += duration;
            inner.prune(now, self.config.rolling_window());

            if permit.half_open
                && permit.epoch == inner.epoch
                && self.state() == CircuitState::HalfOpen
            {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    Some(self.transition(&mut inner, CircuitState::Closed, now))
                } else {
                    None
                }
            } else {
                None
            }
        };

        debug!(
            target_name = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🟢 Operation succeeded"
        );
        if let Some(t) = transition {
            self.emit_transition(t);
        }
    }

    fn on_failure(&self, permit: Permit, duration: Duration) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            inner.metrics.total_calls += 1;
            inner.metrics.failure_count += 1;
            inner.metrics.total_duration += duration;
            inner.prune(now, self.config.rolling_window());
            inner.failures.push_back(now);

            match self.state() {
                CircuitState::Closed => {
                    if inner.failures.len() >= self.config.failure_threshold as usize {
                        Some(self.transition(&mut inner, CircuitState::Open, now))
                    } else {
                        None
                    }
                }
                // any probe failure re-opens and restarts the recovery timer
                CircuitState::HalfOpen if permit.epoch == inner.epoch => {
                    Some(self.transition(&mut inner, CircuitState::Open, now))
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };

        debug!(
            target_name = %self.name,
            duration_ms = duration.as_millis() as u64,
            half_open_probe = permit.half_open,
            "🔴 Operation failed"
        );
        if let Some(t) = transition {
            self.emit_transition(t);
        }
    }

    fn on_ignored(&self, permit: Permit, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.total_duration += duration;
        if permit.half_open && permit.epoch == inner.epoch {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Move to `to`, resetting the per-phase counters; caller holds the lock
    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) -> Transition {
        let from = self.state();
        self.state.store(to as u8, Ordering::Release);
        inner.epoch += 1;
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                inner.metrics.open_count += 1;
            }
            CircuitState::Closed => {
                inner.failures.clear();
                inner.opened_at = None;
            }
            CircuitState::HalfOpen => {}
        }
        Transition { from, to }
    }

    fn emit_transition(&self, t: Transition) {
        breaker_metrics::record_circuit_state(&self.name, t.to);
        match t.to {
            CircuitState::Open => error!(
                target_name = %self.name,
                from = %t.from,
                to = %t.to,
                failure_threshold = self.config.failure_threshold,
                recovery_timeout_seconds = self.config.recovery_timeout_seconds,
                "🔴 Circuit breaker opened (failing fast)"
            ),
            CircuitState::HalfOpen => info!(
                target_name = %self.name,
                from = %t.from,
                to = %t.to,
                success_threshold = self.config.success_threshold,
                "🟡 Circuit breaker half-open (testing recovery)"
            ),
            CircuitState::Closed => info!(
                target_name = %self.name,
                from = %t.from,
                to = %t.to,
                "🟢 Circuit breaker closed (recovered)"
            ),
        }
    }

    /// Force circuit to open state (operator override)
    pub fn force_open(&self) {
        warn!(target_name = %self.name, "🚨 Circuit breaker forced open");
        let t = {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, CircuitState::Open, Instant::now())
        };
        self.emit_transition(t);
    }

    /// Force circuit to closed state (operator override)
    pub fn force_closed(&self) {
        warn!(target_name = %self.name, "🚨 Circuit breaker forced closed");
        let t = {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, CircuitState::Closed, Instant::now())
        };
        self.emit_transition(t);
    }

    /// Counters plus the current window occupancy
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.config.rolling_window());

        let mut snapshot = inner.metrics.clone();
        snapshot.current_state = self.state();
        snapshot.window_failures = inner.failures.len() as u64;
        snapshot.half_open_successes = u64::from(inner.half_open_successes);
        if snapshot.total_calls > 0 {
            snapshot.failure_rate = snapshot.failure_count as f64 / snapshot.total_calls as f64;
            snapshot.average_duration = snapshot.total_duration / snapshot.total_calls as u32;
        }
        snapshot
    }

    /// Closed with a low failure rate
    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed && self.metrics().is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            rolling_window_seconds: 60,
            recovery_timeout_seconds: 30,
            success_threshold: 2,
            half_open_max_calls: None,
        }
    }

    async fn fail(circuit: &CircuitBreaker) {
        let _ = circuit.call(|| async { Err::<(), _>("boom") }).await;
    }

    #[tokio::test]
    async fn test_circuit_breaker_normal_operation() {
        let circuit = CircuitBreaker::new("test", config());
        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());

        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let circuit = CircuitBreaker::new("payment_provider", config());
        for _ in 0..4 {
            fail(&circuit).await;
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        assert_eq!(circuit.state(), CircuitState::Closed);
        fail(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        let reached = AtomicUsize::new(0);
        let result = circuit
            .call(|| async {
                reached.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
        assert_eq!(circuit.metrics().rejected_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let circuit = CircuitBreaker::new("browser_engine", config());
        for _ in 0..4 {
            fail(&circuit).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().window_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_through_half_open() {
        let circuit = CircuitBreaker::new("llm_provider", config());
        for _ in 0..5 {
            fail(&circuit).await;
        }
        assert_eq!(circuit.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        let early = circuit.call(|| async { Ok::<_, String>(()) }).await;
        assert!(early.unwrap_err().is_circuit_open());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(circuit.call(|| async { Ok::<_, String>(()) }).await.is_ok());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        assert!(circuit.call(|| async { Ok::<_, String>(()) }).await.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().window_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_resets_timer() {
        let circuit = CircuitBreaker::new("test", config());
        for _ in 0..5 {
            fail(&circuit).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        fail(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        // recovery timer restarted at the failed probe
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(circuit
            .call(|| async { Ok::<_, String>(()) })
            .await
            .unwrap_err()
            .is_circuit_open());
        assert_eq!(circuit.metrics().open_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_probes() {
        let circuit = Arc::new(CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                half_open_max_calls: Some(1),
                ..config()
            },
        ));
        circuit.force_open();
        tokio::time::advance(Duration::from_secs(31)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let circuit = Arc::clone(&circuit);
            tokio::spawn(async move {
                circuit
                    .call(|| async move {
                        let _ = release_rx.await;
                        Ok::<_, String>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        let second = circuit.call(|| async { Ok::<_, String>(()) }).await;
        assert!(second.unwrap_err().is_circuit_open());

        release_tx.send(()).unwrap();
        assert!(probe.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_half_open_call_counts_as_failure() {
        let circuit = CircuitBreaker::new(
            "browser_engine",
            CircuitBreakerConfig {
                half_open_max_calls: Some(1),
                ..config()
            },
        );
        circuit.force_open();
        tokio::time::advance(Duration::from_secs(31)).await;

        let hung = tokio::time::timeout(
            Duration::from_secs(1),
            circuit.call(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, String>(())
            }),
        )
        .await;
        assert!(hung.is_err());
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.metrics().failure_count, 1);

        // slot released: the next recovery window admits a fresh call
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(circuit.call(|| async { Ok::<_, String>(()) }).await.is_ok());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_closed_call_enters_window() {
        let circuit = CircuitBreaker::new("llm_provider", config());
        let hung = tokio::time::timeout(
            Duration::from_millis(100),
            circuit.call(|| std::future::pending::<Result<(), String>>()),
        )
        .await;
        assert!(hung.is_err());
        assert_eq!(circuit.metrics().window_failures, 1);
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_filtered_errors_do_not_trip() {
        let circuit = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..config()
            },
        );
        let result = circuit
            .call_filtered(|| async { Err::<(), _>("bad input") }, |_| false)
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::OperationFailed(_))));
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_force_operations() {
        let circuit = CircuitBreaker::new("test", config());
        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);
        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }
}
