#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # JobRelay Core
//!
//! Job-queueing and worker-execution engine: moves units of work from
//! producers to workers with at-least-once delivery on durable logs, bounded
//! retries, per-target circuit breaking and a dead-letter path that never
//! drops work.
//!
//! ## Data Flow
//!
//! ```text
//! JobProducer ─encode─▶ JobQueue ─claim─▶ Dispatcher ─▶ TaskHandler (breaker-guarded)
//!                          ▲                  │
//!                          │                  ├─ ok: persist result, then ack
//!              DeferredPromoter               ├─ retryable: RetryScheduler ─▶ deferred set
//!                          ▲                  └─ permanent / exhausted: DeadLetterRouter ─▶ {queue}:dlq
//!                          └──── deferred set ◀───┘
//! ```
//!
//! ## Module Organization
//!
//! - [`messaging`] - Envelope codec, queue store trait, in-memory and PostgreSQL stores
//! - [`worker`] - Handler contract, registry, result store, dispatcher
//! - [`retry`] - Backoff calculation, retry scheduling, deferred promotion
//! - [`dead_letter`] - Dead-letter entries and routing
//! - [`resilience`] - Circuit breakers and their registry
//! - [`features`] - Per-task-type feature gate
//! - [`producer`] - Admission and routing of new jobs
//! - [`bootstrap`] - Engine wiring and worker lifecycle
//! - [`config`] - Layered configuration
//! - [`metrics`] / [`logging`] - Observability
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests (in-memory store)
//! DATABASE_URL=postgres://localhost/jobrelay_test cargo test -- --ignored
//! ```

pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod dead_letter;
pub mod error;
pub mod features;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod producer;
pub mod resilience;
pub mod retry;
pub mod worker;

pub use bootstrap::{EngineBuilder, EngineHandle, JobEngine};
pub use config::{ConfigLoader, EngineConfig};
pub use dead_letter::{DeadLetterEntry, DeadLetterRouter, FailureReason};
pub use error::{EngineError, Result};
pub use features::{FeatureGate, FeatureSnapshot};
pub use messaging::{
    DeliveryMode, EnvelopeCodec, JobEnvelope, JobMeta, JobQueue, QueueName, QueueStore, TaskType,
};
pub use producer::{JobProducer, SubmitReceipt, SubmitRejection};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use retry::{BackoffCalculator, RetryScheduler};
pub use worker::{Dispatcher, HandlerContext, HandlerError, HandlerRegistry, TaskHandler};
