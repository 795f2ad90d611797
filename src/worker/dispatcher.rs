//! # Dispatcher
//!
//! One dispatcher is one consumer in its queue's group. Each iteration it:
//!
//! 1. reclaims messages whose claim went stale (crash recovery), when due
//! 2. block-waits for new messages
//! 3. per message: decode, gate by feature flag, invoke the handler under a
//!    timeout (and its breaker, if registered with one), then either
//!    persist the result and ack, or hand the failure to retry/dead-letter
//!
//! Result persistence always happens-before ack. Handler failures never
//! escape; only infrastructure failures (queue store, dead-letter
//! destination) end the loop with an error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{DispatcherConfig, QueueConfig};
use crate::constants::{error_types, job_results};
use crate::dead_letter::FailureReason;
use crate::error::EngineError;
use crate::features::FeatureGate;
use crate::messaging::{EnvelopeCodec, JobEnvelope, JobQueue, StoredMessage, TaskType};
use crate::metrics::jobs as job_metrics;
use crate::resilience::CircuitBreakerRegistry;
use crate::retry::{RetryOutcome, RetryScheduler};

use super::error_classifier::{
    ErrorCategory, ErrorClassifier, JobFailure, StandardErrorClassifier,
};
use super::handler::{HandlerContext, HandlerError};
use super::registry::HandlerRegistry;
use super::result_store::{JobResult, ResultStore};

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Result persisted and delivery acknowledged
    Completed,
    /// Re-enqueued through the deferred set
    Retried { attempts: u32, delay: Duration },
    DeadLettered(FailureReason),
}

/// Per-queue loop settings
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub claim_batch: usize,
    pub block_timeout: Duration,
    pub staleness_threshold: Duration,
    pub handler_timeout: Duration,
    pub reclaim_interval: Duration,
    pub max_consecutive_store_errors: u32,
    pub store_error_backoff: Duration,
}

impl DispatcherSettings {
    pub fn from_config(queue: &QueueConfig, dispatcher: &DispatcherConfig) -> Self {
        Self {
            claim_batch: queue.claim_batch.max(1),
            block_timeout: queue.block_timeout(),
            staleness_threshold: queue.staleness_threshold(),
            handler_timeout: dispatcher.handler_timeout(),
            reclaim_interval: dispatcher.reclaim_interval(),
            max_consecutive_store_errors: dispatcher.max_consecutive_store_errors.max(1),
            store_error_backoff: dispatcher.store_error_backoff(),
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default(), &DispatcherConfig::default())
    }
}

/// Collaborators shared by every dispatcher of an engine
#[derive(Debug, Clone)]
pub struct DispatchServices {
    pub codec: EnvelopeCodec,
    pub handlers: Arc<HandlerRegistry>,
    pub features: Arc<FeatureGate>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub results: Arc<dyn ResultStore>,
    pub retry: RetryScheduler,
    pub classifier: Arc<dyn ErrorClassifier>,
}

impl DispatchServices {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        results: Arc<dyn ResultStore>,
        features: Arc<FeatureGate>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryScheduler,
    ) -> Self {
        Self {
            codec: EnvelopeCodec::default(),
            handlers,
            features,
            breakers,
            results,
            retry,
            classifier: Arc::new(StandardErrorClassifier),
        }
    }

    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    queue: JobQueue,
    consumer: String,
    settings: DispatcherSettings,
    services: DispatchServices,
    last_reclaim: Option<Instant>,
}

impl Dispatcher {
    pub fn new(
        queue: JobQueue,
        consumer: impl Into<String>,
        settings: DispatcherSettings,
        services: DispatchServices,
    ) -> Self {
        Self {
            queue,
            consumer: consumer.into(),
            settings,
            services,
            last_reclaim: None,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Run until `shutdown` flips to `true` or an infrastructure failure
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        info!(
            queue = %self.queue.name(),
            group = ?self.queue.group(),
            consumer = %self.consumer,
            "🚀 Starting dispatcher"
        );
        let mut consecutive_errors = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Only the wait for work is interruptible; a claimed batch is always
            // processed to completion
            let batch = tokio::select! {
                batch = self.next_batch() => batch,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let polled = match batch {
                Ok(batch) => self.process_batch(&batch).await,
                Err(e) => Err(e),
            };

            match polled {
                Ok(_) => consecutive_errors = 0,
                Err(EngineError::Queue(e)) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.settings.max_consecutive_store_errors {
                        error!(
                            queue = %self.queue.name(),
                            consumer = %self.consumer,
                            consecutive_failures = consecutive_errors,
                            error = %e,
                            "❌ Queue store unavailable, stopping dispatcher"
                        );
                        return Err(EngineError::StoreUnavailable {
                            queue: self.queue.name().to_string(),
                            consecutive_failures: consecutive_errors,
                            source: e,
                        });
                    }
                    warn!(
                        queue = %self.queue.name(),
                        consumer = %self.consumer,
                        consecutive_failures = consecutive_errors,
                        error = %e,
                        "Queue store error, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.store_error_backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(
                        queue = %self.queue.name(),
                        consumer = %self.consumer,
                        error = %e,
                        "❌ Dispatcher stopped on fatal error"
                    );
                    return Err(e);
                }
            }
        }

        info!(queue = %self.queue.name(), consumer = %self.consumer, "Dispatcher stopped");
        Ok(())
    }

    /// One loop iteration: reclaim or claim, process, refresh gauges
    ///
    /// Returns the number of messages handled.
    pub async fn poll_once(&mut self) -> Result<usize, EngineError> {
        let batch = self.next_batch().await?;
        self.process_batch(&batch).await
    }

    /// Stale pending messages when a reclaim is due and finds any, otherwise
    /// new messages (waiting up to the block timeout)
    async fn next_batch(&mut self) -> Result<Vec<StoredMessage>, EngineError> {
        if self.reclaim_due() {
            self.last_reclaim = Some(Instant::now());
            let reclaimed = self
                .queue
                .reclaim(
                    &self.consumer,
                    self.settings.staleness_threshold,
                    self.settings.claim_batch,
                )
                .await?;
            if !reclaimed.is_empty() {
                info!(
                    queue = %self.queue.name(),
                    consumer = %self.consumer,
                    count = reclaimed.len(),
                    "♻️ Reclaimed stale messages"
                );
                return Ok(reclaimed);
            }
        }

        Ok(self
            .queue
            .claim(
                &self.consumer,
                self.settings.claim_batch,
                self.settings.block_timeout,
            )
            .await?)
    }

    async fn process_batch(&self, batch: &[StoredMessage]) -> Result<usize, EngineError> {
        for message in batch {
            self.process_message(message).await?;
        }
        self.refresh_gauges().await?;
        Ok(batch.len())
    }

    fn reclaim_due(&self) -> bool {
        self.queue.group().is_some()
            && self
                .last_reclaim
                .map_or(true, |at| at.elapsed() >= self.settings.reclaim_interval)
    }

    async fn refresh_gauges(&self) -> Result<(), EngineError> {
        let stats = self.queue.stats().await?;
        let name = self.queue.name().to_string();
        job_metrics::record_queue_depth(&name, self.queue.mode().kind_label(), stats.depth);
        if let Some(group) = self.queue.group() {
            job_metrics::record_queue_pending(&name, group, stats.pending);
        }
        Ok(())
    }

    /// Decode and fully handle one delivery
    pub async fn process_message(
        &self,
        message: &StoredMessage,
    ) -> Result<DispatchOutcome, EngineError> {
        let envelope = match self.services.codec.decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                let failure = JobFailure::MalformedEnvelope(e.to_string());
                warn!(
                    queue = %self.queue.name(),
                    message_id = %message.id,
                    error = %e,
                    "Undecodable message, dead-lettering raw payload"
                );
                job_metrics::record_error("unknown", error_types::MALFORMED_ENVELOPE);
                self.services
                    .retry
                    .dead_letters()
                    .route_raw(&self.queue, &message.id, &message.payload, &failure.to_string())
                    .await?;
                return Ok(DispatchOutcome::DeadLettered(
                    FailureReason::PermanentValidationError,
                ));
            }
        };

        let span = info_span!(
            "job",
            job_id = %envelope.job_id,
            correlation_id = %envelope.meta.correlation_id,
            task_type = %envelope.task_type,
            attempts = envelope.attempts,
            queue = %self.queue.name(),
        );
        self.process_envelope(message, envelope).instrument(span).await
    }

    async fn process_envelope(
        &self,
        message: &StoredMessage,
        envelope: JobEnvelope,
    ) -> Result<DispatchOutcome, EngineError> {
        debug!(
            message_id = %message.id,
            delivery_count = message.delivery_count,
            "Processing job"
        );

        if message.delivery_count > envelope.max_attempts {
            let failure = JobFailure::PoisonMessage {
                delivery_count: message.delivery_count,
                max_attempts: envelope.max_attempts,
            };
            return self.handle_failure(message, envelope, failure).await;
        }

        let task_type = match envelope.task_kind() {
            Ok(task_type) => task_type,
            Err(e) => {
                let failure = JobFailure::UnknownTaskType(e.0);
                return self.handle_failure(message, envelope, failure).await;
            }
        };

        if !self.services.features.is_enabled(task_type) {
            return self
                .handle_failure(message, envelope, JobFailure::FeatureDisabled(task_type))
                .await;
        }

        match self.invoke(message, &envelope, task_type).await {
            Ok(value) => self.complete(message, envelope, value).await,
            Err(failure) => self.handle_failure(message, envelope, failure).await,
        }
    }

    /// Run the handler under its timeout and, if configured, its breaker
    async fn invoke(
        &self,
        message: &StoredMessage,
        envelope: &JobEnvelope,
        task_type: TaskType,
    ) -> Result<serde_json::Value, JobFailure> {
        let Some(registered) = self.services.handlers.get(task_type) else {
            error!(task_type = %task_type, "No handler registered for routed task type");
            return Err(JobFailure::UnknownTaskType(task_type.to_string()));
        };

        let ctx = HandlerContext::new(
            self.queue.name().to_string(),
            self.consumer.clone(),
            message.id.clone(),
            message.delivery_count,
            Arc::clone(&self.services.breakers),
        );
        let handler_timeout = self.settings.handler_timeout;
        let invocation = async {
            match tokio::time::timeout(handler_timeout, registered.handler.handle(&ctx, envelope)).await {
                Ok(result) => result,
                Err(_) => Err(HandlerError::Timeout(handler_timeout)),
            }
        };

        let started = Instant::now();
        let result = match &registered.breaker_target {
            Some(target) => self
                .services
                .breakers
                .get(target)
                .call_filtered(|| invocation, HandlerError::counts_against_target)
                .await
                .map_err(HandlerError::from),
            None => invocation.await,
        };
        let outcome = if result.is_ok() {
            job_results::SUCCESS
        } else {
            job_results::FAILED
        };
        job_metrics::record_processing(&envelope.task_type, outcome, started.elapsed().as_secs_f64());

        result.map_err(JobFailure::Handler)
    }

    /// Persist, then ack
    async fn complete(
        &self,
        message: &StoredMessage,
        envelope: JobEnvelope,
        value: serde_json::Value,
    ) -> Result<DispatchOutcome, EngineError> {
        let record = JobResult::new(envelope.job_id, envelope.task_type.clone(), value, envelope.attempts);
        if let Err(e) = self.services.results.upsert(&record).await {
            let failure = JobFailure::ResultPersistence(e.to_string());
            return self.handle_failure(message, envelope, failure).await;
        }

        if !self.queue.ack(&message.id).await? {
            // Reclaimed by another consumer meanwhile; the result upsert is idempotent
            warn!(message_id = %message.id, "Acked message was no longer pending");
        }
        info!(message_id = %message.id, "✅ Job completed");
        Ok(DispatchOutcome::Completed)
    }

    async fn handle_failure(
        &self,
        message: &StoredMessage,
        envelope: JobEnvelope,
        failure: JobFailure,
    ) -> Result<DispatchOutcome, EngineError> {
        let classification = self.services.classifier.classify(&failure);
        job_metrics::record_error(&envelope.task_type, classification.error_type);
        let description = failure.to_string();

        match classification.category {
            ErrorCategory::Retryable => {
                warn!(
                    error_type = classification.error_type,
                    error = %description,
                    "Job attempt failed"
                );
                let outcome = self
                    .services
                    .retry
                    .schedule(&self.queue, &message.id, &envelope, &description)
                    .await?;
                Ok(match outcome {
                    RetryOutcome::Scheduled { attempts, delay } => {
                        DispatchOutcome::Retried { attempts, delay }
                    }
                    RetryOutcome::DeadLettered { .. } => {
                        DispatchOutcome::DeadLettered(FailureReason::MaxAttemptsExceeded)
                    }
                })
            }
            ErrorCategory::Permanent(reason) => {
                warn!(
                    error_type = classification.error_type,
                    reason = %reason,
                    error = %description,
                    "Job failed permanently"
                );
                self.services
                    .retry
                    .dead_letters()
                    .route(&self.queue, &message.id, envelope, reason, &description)
                    .await?;
                Ok(DispatchOutcome::DeadLettered(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeadLetterConfig;
    use crate::dead_letter::DeadLetterRouter;
    use crate::features::FeatureSnapshot;
    use crate::messaging::{DeliveryMode, InMemoryQueueStore, JobMeta, QueueName};
    use crate::resilience::{CircuitBreakerConfig, CircuitBreakerSettings, CircuitState};
    use crate::retry::{BackoffCalculator, BackoffCalculatorConfig};
    use crate::worker::handler::TaskHandler;
    use crate::worker::result_store::InMemoryResultStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct ScriptedHandler {
        calls: AtomicU32,
        error: Option<HandlerError>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl TaskHandler for ScriptedHandler {
        async fn handle(
            &self,
            _ctx: &HandlerContext,
            job: &JobEnvelope,
        ) -> Result<serde_json::Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(json!({"echo": job.payload})),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct Fixture {
        queue: JobQueue,
        results: Arc<InMemoryResultStore>,
        features: Arc<FeatureGate>,
        breakers: Arc<CircuitBreakerRegistry>,
        dead_letters: DeadLetterRouter,
        dispatcher: Dispatcher,
    }

    async fn fixture(handler: Arc<ScriptedHandler>, breaker_target: Option<&str>) -> Fixture {
        let store = Arc::new(InMemoryQueueStore::new());
        let queue = JobQueue::durable(
            QueueName::new("ns", "test", DeliveryMode::Stream, "jobs.browser"),
            "browser-workers",
            store,
        );
        queue.ensure().await.unwrap();

        let mut handlers = HandlerRegistry::new();
        match breaker_target {
            Some(target) => handlers.register_guarded(TaskType::Browser, handler, target),
            None => handlers.register(TaskType::Browser, handler),
        };

        let results = Arc::new(InMemoryResultStore::new());
        let features = Arc::new(FeatureGate::default());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerSettings {
            default: CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            },
            targets: HashMap::new(),
        }));
        let dead_letters = DeadLetterRouter::new(DeadLetterConfig::default());
        let retry = RetryScheduler::new(
            BackoffCalculator::new(BackoffCalculatorConfig {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                max_jitter: Duration::ZERO,
            }),
            EnvelopeCodec::default(),
            dead_letters.clone(),
        );
        let services = DispatchServices::new(
            Arc::new(handlers),
            results.clone(),
            features.clone(),
            breakers.clone(),
            retry,
        );
        let settings = DispatcherSettings {
            block_timeout: Duration::from_secs(1),
            handler_timeout: Duration::from_secs(5),
            ..DispatcherSettings::default()
        };
        let dispatcher = Dispatcher::new(queue.clone(), "worker-1", settings, services);

        Fixture {
            queue,
            results,
            features,
            breakers,
            dead_letters,
            dispatcher,
        }
    }

    async fn enqueue(queue: &JobQueue, max_attempts: u32) -> JobEnvelope {
        let envelope = JobEnvelope::new(
            TaskType::Browser,
            json!({"url": "https://example.com"}),
            max_attempts,
            JobMeta::new("test"),
        );
        queue
            .enqueue(EnvelopeCodec::default().encode(&envelope).unwrap())
            .await
            .unwrap();
        envelope
    }

    async fn claim_one(f: &Fixture) -> StoredMessage {
        f.queue
            .claim("worker-1", 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_success_persists_then_acks() {
        let handler = Arc::new(ScriptedHandler::default());
        let f = fixture(handler.clone(), None).await;
        let envelope = enqueue(&f.queue, 3).await;

        let message = claim_one(&f).await;
        let outcome = f.dispatcher.process_message(&message).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let stored = f.results.get(envelope.job_id).await.unwrap().unwrap();
        assert_eq!(stored.result["echo"]["url"], json!("https://example.com"));
        assert_eq!(f.queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_leaves_job_for_retry() {
        let handler = Arc::new(ScriptedHandler::default());
        let f = fixture(handler, None).await;
        enqueue(&f.queue, 3).await;
        f.results.fail_next_writes(1);

        let message = claim_one(&f).await;
        let outcome = f.dispatcher.process_message(&message).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Retried { attempts: 1, .. }));
        assert!(f.results.is_empty());
        assert_eq!(f.queue.stats().await.unwrap().deferred, 1);
    }

    #[tokio::test]
    async fn test_validation_error_dead_letters_without_retry() {
        let handler = Arc::new(ScriptedHandler {
            error: Some(HandlerError::validation("url is not absolute")),
            ..ScriptedHandler::default()
        });
        let f = fixture(handler.clone(), None).await;
        enqueue(&f.queue, 3).await;

        let message = claim_one(&f).await;
        let outcome = f.dispatcher.process_message(&message).await.unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::DeadLettered(FailureReason::PermanentValidationError)
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.queue.stats().await.unwrap().deferred, 0);
        let entries = f.dead_letters.list(&f.queue, 10).await.unwrap();
        assert_eq!(entries[0].last_error, "Validation failed: url is not absolute");
    }

    #[tokio::test]
    async fn test_disabled_feature_never_invokes_handler() {
        let handler = Arc::new(ScriptedHandler::default());
        let f = fixture(handler.clone(), None).await;
        f.features
            .reload(FeatureSnapshot::all_enabled().with_task(TaskType::Browser, false));
        enqueue(&f.queue, 3).await;

        let message = claim_one(&f).await;
        let outcome = f.dispatcher.process_message(&message).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::DeadLettered(FailureReason::FeatureDisabled));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.queue.stats().await.unwrap().deferred, 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered_raw() {
        let f = fixture(Arc::new(ScriptedHandler::default()), None).await;
        f.queue.enqueue(b"not an envelope".to_vec()).await.unwrap();

        let message = claim_one(&f).await;
        let outcome = f.dispatcher.process_message(&message).await.unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::DeadLettered(FailureReason::PermanentValidationError)
        );
        let entries = f.dead_letters.list(&f.queue, 10).await.unwrap();
        assert_eq!(entries[0].raw_payload.as_deref(), Some("not an envelope"));
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_permanent() {
        let f = fixture(Arc::new(ScriptedHandler::default()), None).await;
        let mut envelope = JobEnvelope::new(TaskType::Browser, json!({}), 3, JobMeta::new("test"));
        envelope.task_type = "teleport".to_string();
        f.queue
            .enqueue(serde_json::to_vec(&envelope).unwrap())
            .await
            .unwrap();

        let message = claim_one(&f).await;
        let outcome = f.dispatcher.process_message(&message).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::DeadLettered(FailureReason::PermanentValidationError)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_is_retried() {
        let handler = Arc::new(ScriptedHandler {
            delay: Some(Duration::from_secs(60)),
            ..ScriptedHandler::default()
        });
        let f = fixture(handler, None).await;
        enqueue(&f.queue, 3).await;

        let message = claim_one(&f).await;
        let outcome = f.dispatcher.process_message(&message).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Retried { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_guarded_handler_opens_breaker_and_fails_fast() {
        let handler = Arc::new(ScriptedHandler {
            error: Some(HandlerError::transient("browser crashed")),
            ..ScriptedHandler::default()
        });
        let f = fixture(handler.clone(), Some("browser_engine")).await;
        for _ in 0..3 {
            enqueue(&f.queue, 5).await;
        }

        for _ in 0..3 {
            let message = claim_one(&f).await;
            let outcome = f.dispatcher.process_message(&message).await.unwrap();
            assert!(matches!(outcome, DispatchOutcome::Retried { .. }));
        }

        // Threshold 2: the third job is rejected without reaching the handler
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            f.breakers.find("browser_engine").unwrap().state(),
            CircuitState::Open
        );
    }

    #[tokio::test]
    async fn test_poison_message_is_dead_lettered() {
        let handler = Arc::new(ScriptedHandler::default());
        let f = fixture(handler.clone(), None).await;
        enqueue(&f.queue, 1).await;

        let mut message = claim_one(&f).await;
        message.delivery_count = 2;
        let outcome = f.dispatcher.process_message(&message).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::DeadLettered(FailureReason::MaxAttemptsExceeded));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(Arc::new(ScriptedHandler::default()), None).await;
        let Fixture {
            queue, dispatcher, ..
        } = f;
        enqueue(&queue, 3).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(dispatcher.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.stats().await.unwrap().depth, 0);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
