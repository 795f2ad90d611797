//! Shared fixtures for integration tests (in-memory backend)

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobrelay_core::config::DeadLetterConfig;
use jobrelay_core::dead_letter::DeadLetterRouter;
use jobrelay_core::features::FeatureGate;
use jobrelay_core::messaging::{
    DeliveryMode, EnvelopeCodec, InMemoryQueueStore, JobEnvelope, JobMeta, JobQueue, QueueName,
    TaskType,
};
use jobrelay_core::resilience::CircuitBreakerRegistry;
use jobrelay_core::retry::{BackoffCalculator, BackoffCalculatorConfig, DeferredPromoter, RetryScheduler};
use jobrelay_core::worker::{
    DispatchServices, Dispatcher, DispatcherSettings, HandlerContext, HandlerError,
    HandlerRegistry, InMemoryResultStore, TaskHandler,
};
use serde_json::json;

/// Handler that counts calls and fails transiently until told otherwise
#[derive(Debug, Default)]
pub struct CountingHandler {
    pub calls: AtomicU32,
    pub fail_with: Option<HandlerError>,
}

impl CountingHandler {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(error: HandlerError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_with: Some(error),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for CountingHandler {
    async fn handle(
        &self,
        _ctx: &HandlerContext,
        job: &JobEnvelope,
    ) -> Result<serde_json::Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(error) => Err(error.clone()),
            // Derived only from the job itself, so redelivery yields the same record
            None => Ok(json!({ "job_id": job.job_id, "input": job.payload })),
        }
    }

    fn name(&self) -> &str {
        "counting"
    }
}

pub struct Harness {
    pub store: Arc<InMemoryQueueStore>,
    pub queue: JobQueue,
    pub results: Arc<InMemoryResultStore>,
    pub features: Arc<FeatureGate>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub dead_letters: DeadLetterRouter,
    pub services: DispatchServices,
    pub settings: DispatcherSettings,
}

impl Harness {
    /// Durable `jobs.browser` queue with `handler` registered for browser jobs
    pub async fn new(handler: Arc<CountingHandler>) -> Self {
        let store = Arc::new(InMemoryQueueStore::new());
        let queue = JobQueue::durable(
            QueueName::new("jobrelay", "test", DeliveryMode::Stream, "jobs.browser"),
            "browser-workers",
            store.clone(),
        );
        queue.ensure().await.expect("ensure queue");

        let mut handlers = HandlerRegistry::new();
        handlers.register(TaskType::Browser, handler);

        let results = Arc::new(InMemoryResultStore::new());
        let features = Arc::new(FeatureGate::default());
        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let dead_letters = DeadLetterRouter::new(DeadLetterConfig {
            write_attempts: 3,
            write_base_delay_ms: 50,
            write_max_delay_ms: 200,
            ..DeadLetterConfig::default()
        });
        let retry = RetryScheduler::new(
            BackoffCalculator::new(BackoffCalculatorConfig {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(300),
                max_jitter: Duration::from_millis(250),
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
            claim_batch: 10,
            block_timeout: Duration::from_millis(100),
            staleness_threshold: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(5),
            reclaim_interval: Duration::from_secs(15),
            max_consecutive_store_errors: 3,
            store_error_backoff: Duration::from_millis(100),
        };

        Self {
            store,
            queue,
            results,
            features,
            breakers,
            dead_letters,
            services,
            settings,
        }
    }

    pub fn dispatcher(&self, consumer: &str) -> Dispatcher {
        Dispatcher::new(
            self.queue.clone(),
            consumer,
            self.settings.clone(),
            self.services.clone(),
        )
    }

    pub fn promoter(&self) -> DeferredPromoter {
        DeferredPromoter::new(self.queue.clone(), Duration::from_secs(1), 100, 3)
    }

    pub async fn enqueue(&self, max_attempts: u32) -> JobEnvelope {
        let envelope = JobEnvelope::new(
            TaskType::Browser,
            json!({ "url": "https://example.com/report" }),
            max_attempts,
            JobMeta::new("integration-test"),
        );
        self.queue
            .enqueue(EnvelopeCodec::default().encode(&envelope).expect("encode"))
            .await
            .expect("enqueue");
        envelope
    }

    pub fn dead_letter_len(&self) -> usize {
        self.store.len(&self.queue.dead_letter_name())
    }

    pub fn live_len(&self) -> usize {
        self.store.len(self.queue.name())
    }
}
