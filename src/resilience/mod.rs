//! # Resilience Module
//!
//! Circuit breakers isolating the engine from failing external dependencies
//! (payment provider, browser-automation engine, LLM provider).
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: rolling-window failure counting with Closed, Open
//!   and Half-Open states
//! - **Registry**: explicit, injectable owner of one breaker per target
//! - **Metrics**: per-breaker snapshots plus the state gauge and rejection counter
//!
//! ## Usage
//!
//! ```rust,no_run
//! use jobrelay_core::resilience::{CircuitBreakerRegistry, CircuitBreakerSettings, targets};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = CircuitBreakerRegistry::new(CircuitBreakerSettings::default());
//! let breaker = registry.get(targets::PAYMENT_PROVIDER);
//!
//! let charge = breaker
//!     .call(|| async { Ok::<&str, std::io::Error>("charged") })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod metrics;
pub mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::{targets, CircuitBreakerConfig, CircuitBreakerSettings};
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
pub use registry::CircuitBreakerRegistry;
