//! # Engine Bootstrap
//!
//! Wires a complete engine from an [`EngineConfig`]:
//!
//! - queue store and result store for the configured backend
//! - one [`JobQueue`] per configured logical queue (plus its group and
//!   dead-letter log)
//! - shared feature gate, breaker registry and retry scheduler
//! - a [`JobProducer`] routing each task type to its queue
//!
//! [`JobEngine::start`] then spawns `workers` dispatchers per queue and one
//! deferred promoter per queue. The returned [`EngineHandle`] stops them via
//! a watch channel and surfaces the first fatal error.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use jobrelay_core::bootstrap::EngineBuilder;
//! # use jobrelay_core::config::ConfigLoader;
//! # use jobrelay_core::worker::HandlerRegistry;
//! # async fn example(handlers: HandlerRegistry) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new().load()?;
//! jobrelay_core::bootstrap::init_telemetry(&config);
//!
//! let engine = EngineBuilder::new(config).with_handlers(handlers).build().await?;
//! let producer = engine.producer().clone();
//! let mut handle = engine.start();
//! handle.wait().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigurationError, EngineConfig, QueueConfig, StoreBackend};
use crate::dead_letter::DeadLetterRouter;
use crate::error::EngineError;
use crate::features::FeatureGate;
use crate::logging::init_structured_logging;
use crate::messaging::{
    DeliveryMode, EnvelopeCodec, InMemoryQueueStore, JobQueue, QueueError, QueueStats, QueueStore,
    TaskType,
};
use crate::metrics::init_metrics;
use crate::producer::JobProducer;
use crate::resilience::CircuitBreakerRegistry;
use crate::retry::{BackoffCalculator, DeferredPromoter, RetryScheduler};
use crate::worker::{
    DispatchServices, Dispatcher, DispatcherSettings, HandlerRegistry, InMemoryResultStore,
    ResultStore,
};

/// Initialize logging and metrics from configuration
pub fn init_telemetry(config: &EngineConfig) {
    init_structured_logging(&config.telemetry, &config.service.environment);
    init_metrics(&config.service, &config.telemetry);
}

pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn QueueStore>>,
    results: Option<Arc<dyn ResultStore>>,
    handlers: HandlerRegistry,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            results: None,
            handlers: HandlerRegistry::new(),
        }
    }

    /// Use this queue store instead of the configured backend
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this result store instead of the configured backend
    pub fn with_result_store(mut self, results: Arc<dyn ResultStore>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub async fn build(self) -> Result<JobEngine, EngineError> {
        let Self {
            mut config,
            store,
            results,
            handlers,
        } = self;

        if config.queues.is_empty() {
            config.queues = QueueConfig::defaults();
        }
        config.validate()?;

        for queue in &config.queues {
            for task_type in &queue.task_types {
                if !handlers.handler_available(*task_type) {
                    return Err(EngineError::MissingHandler {
                        task_type: task_type.to_string(),
                        queue: queue.name.clone(),
                    });
                }
            }
        }

        let (store, results) = match (store, results) {
            (Some(store), Some(results)) => (store, results),
            (store, results) => {
                let (default_store, default_results) = connect_backend(&config).await?;
                (store.unwrap_or(default_store), results.unwrap_or(default_results))
            }
        };

        let mut queues = Vec::with_capacity(config.queues.len());
        for queue_config in &config.queues {
            let name = config.queue_name(queue_config);
            let queue = match queue_config.mode {
                DeliveryMode::List => JobQueue::simple(name, Arc::clone(&store)),
                DeliveryMode::Stream => {
                    let group = queue_config.group.clone().ok_or_else(|| {
                        ConfigurationError::invalid_value("queues.group", "stream queues need a consumer group")
                    })?;
                    JobQueue::durable(name, group, Arc::clone(&store))
                }
            };
            queue.ensure().await?;
            queues.push((queue_config.clone(), queue));
        }

        let features = Arc::new(FeatureGate::from_config(&config.features));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breakers.clone()));
        let codec = EnvelopeCodec::default();
        let retry = RetryScheduler::new(
            BackoffCalculator::new((&config.backoff).into()),
            codec,
            DeadLetterRouter::new(config.dead_letter.clone()),
        );

        let mut producer = JobProducer::new(Arc::clone(&features)).with_codec(codec);
        for (queue_config, queue) in &queues {
            for task_type in &queue_config.task_types {
                producer = producer.with_route(
                    *task_type,
                    queue.clone(),
                    config.max_attempts_for(queue_config),
                    queue_config.max_depth,
                );
            }
        }

        let services = DispatchServices::new(
            Arc::new(handlers),
            results,
            Arc::clone(&features),
            Arc::clone(&breakers),
            retry,
        )
        .with_codec(codec);

        info!(
            backend = store.backend_name(),
            namespace = %config.service.namespace,
            environment = %config.service.environment,
            queues = queues.len(),
            "🏗️ Job engine built"
        );

        Ok(JobEngine {
            config,
            queues,
            services,
            producer,
        })
    }
}

#[cfg(feature = "postgres")]
async fn connect_backend(
    config: &EngineConfig,
) -> Result<(Arc<dyn QueueStore>, Arc<dyn ResultStore>), EngineError> {
    use crate::messaging::PgQueueStore;
    use crate::worker::PgResultStore;

    match config.store.backend {
        StoreBackend::InMemory => Ok(in_memory_backend()),
        StoreBackend::Postgres => {
            let url = config.store.database_url.as_deref().ok_or_else(|| {
                ConfigurationError::invalid_value("store.database_url", "required for the postgres backend")
            })?;
            let store = PgQueueStore::connect(url, config.store.max_connections)
                .await?
                .with_poll_interval(config.store.poll_interval());
            let results = PgResultStore::new(store.pool().clone());
            results.migrate().await?;
            Ok((Arc::new(store), Arc::new(results)))
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn connect_backend(
    config: &EngineConfig,
) -> Result<(Arc<dyn QueueStore>, Arc<dyn ResultStore>), EngineError> {
    match config.store.backend {
        StoreBackend::InMemory => Ok(in_memory_backend()),
        StoreBackend::Postgres => Err(ConfigurationError::invalid_value(
            "store.backend",
            "postgres support is not compiled in (enable the `postgres` feature)",
        )
        .into()),
    }
}

fn in_memory_backend() -> (Arc<dyn QueueStore>, Arc<dyn ResultStore>) {
    (
        Arc::new(InMemoryQueueStore::new()),
        Arc::new(InMemoryResultStore::new()),
    )
}

/// A built, not yet running engine
#[derive(Debug)]
pub struct JobEngine {
    config: EngineConfig,
    queues: Vec<(QueueConfig, JobQueue)>,
    services: DispatchServices,
    producer: JobProducer,
}

impl JobEngine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn producer(&self) -> &JobProducer {
        &self.producer
    }

    pub fn features(&self) -> &Arc<FeatureGate> {
        &self.services.features
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.services.breakers
    }

    pub fn results(&self) -> &Arc<dyn ResultStore> {
        &self.services.results
    }

    pub fn dead_letters(&self) -> &DeadLetterRouter {
        self.services.retry.dead_letters()
    }

    pub fn queues(&self) -> impl Iterator<Item = &JobQueue> {
        self.queues.iter().map(|(_, queue)| queue)
    }

    /// Queue a task type is routed to
    pub fn queue_for(&self, task_type: TaskType) -> Option<&JobQueue> {
        self.producer.queue_for(task_type)
    }

    /// Depth, pending and deferred counts of every queue
    pub async fn queue_stats(&self) -> Result<Vec<(String, QueueStats)>, QueueError> {
        collect_stats(self.queues()).await
    }

    /// Spawn dispatchers and promoters
    pub fn start(self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let dispatcher_config = &self.config.dispatcher;

        for (queue_config, queue) in &self.queues {
            let settings = DispatcherSettings::from_config(queue_config, dispatcher_config);
            for index in 0..queue_config.workers {
                let consumer = consumer_name(&queue_config.name, index);
                let dispatcher = Dispatcher::new(
                    queue.clone(),
                    consumer,
                    settings.clone(),
                    self.services.clone(),
                );
                tasks.spawn(dispatcher.run(shutdown_rx.clone()));
            }

            let promoter = DeferredPromoter::new(
                queue.clone(),
                dispatcher_config.promote_interval(),
                dispatcher_config.promote_batch,
                dispatcher_config.max_consecutive_store_errors,
            );
            tasks.spawn(promoter.run(shutdown_rx.clone()));
        }

        info!(tasks = tasks.len(), "🚀 Job engine started");
        EngineHandle {
            shutdown_tx,
            tasks,
            producer: self.producer,
            queues: self.queues.into_iter().map(|(_, queue)| queue).collect(),
        }
    }
}

/// `{logical}-{index}-{8 hex chars}`, unique across processes
fn consumer_name(logical: &str, index: usize) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{logical}-{index}-{}", &suffix[..8])
}

async fn collect_stats<'a>(
    queues: impl Iterator<Item = &'a JobQueue>,
) -> Result<Vec<(String, QueueStats)>, QueueError> {
    try_join_all(queues.map(|queue| async move {
        let stats = queue.stats().await?;
        Ok::<_, QueueError>((queue.name().to_string(), stats))
    }))
    .await
}

/// Running engine
#[derive(Debug)]
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<Result<(), EngineError>>,
    producer: JobProducer,
    queues: Vec<JobQueue>,
}

impl EngineHandle {
    pub fn producer(&self) -> &JobProducer {
        &self.producer
    }

    pub async fn queue_stats(&self) -> Result<Vec<(String, QueueStats)>, QueueError> {
        collect_stats(self.queues.iter()).await
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow() && !self.tasks.is_empty()
    }

    /// Ask every worker to stop after its current batch
    pub fn request_shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("🛑 Job engine shutdown requested");
        }
    }

    /// Wait until all workers exit
    ///
    /// The first worker failure triggers shutdown of the rest and is
    /// returned once they have stopped.
    pub async fn wait(&mut self) -> Result<(), EngineError> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.map_err(|e| EngineError::Worker(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                if first_error.is_none() {
                    error!(error = %e, "❌ Worker failed, shutting down engine");
                    self.request_shutdown();
                    first_error = Some(e);
                } else {
                    warn!(error = %e, "Additional worker failure during shutdown");
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Job engine stopped");
                Ok(())
            }
        }
    }

    /// Request shutdown and wait for all workers
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        self.request_shutdown();
        self.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{JobEnvelope, JobMeta};
    use crate::worker::{HandlerContext, HandlerError, TaskHandler};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        async fn handle(
            &self,
            _ctx: &HandlerContext,
            _job: &JobEnvelope,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(serde_json::Value::Null)
        }

        fn name(&self) -> &str {
            "noop"
        }
    }

    fn all_handlers() -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        for task_type in TaskType::ALL {
            handlers.register(task_type, Arc::new(Noop));
        }
        handlers
    }

    #[tokio::test]
    async fn test_build_requires_handlers_for_routed_types() {
        let mut handlers = HandlerRegistry::new();
        handlers.register(TaskType::Generic, Arc::new(Noop));
        let err = EngineBuilder::new(EngineConfig::with_default_queues())
            .with_handlers(handlers)
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingHandler { .. }));
    }

    #[tokio::test]
    async fn test_build_wires_default_layout() {
        let engine = EngineBuilder::new(EngineConfig::with_default_queues())
            .with_handlers(all_handlers())
            .build()
            .await
            .unwrap();

        assert_eq!(engine.queues().count(), 4);
        let browser = engine.queue_for(TaskType::Browser).unwrap();
        assert_eq!(browser.group(), Some("browser-workers"));
        assert!(browser.name().to_string().ends_with(":stream:jobs.browser"));
        assert_eq!(
            engine.queue_for(TaskType::Generic).unwrap().mode(),
            DeliveryMode::List
        );
    }

    #[tokio::test]
    async fn test_queue_stats_cover_every_queue() {
        let engine = EngineBuilder::new(EngineConfig::with_default_queues())
            .with_handlers(all_handlers())
            .build()
            .await
            .unwrap();
        let receipt = tokio_test::assert_ok!(
            engine
                .producer()
                .submit(TaskType::Browser, serde_json::json!({}), JobMeta::new("test"))
                .await
        );

        let stats = tokio_test::assert_ok!(engine.queue_stats().await);
        assert_eq!(stats.len(), 4);
        let (_, browser) = stats
            .iter()
            .find(|(name, _)| name == &receipt.queue)
            .unwrap();
        assert_eq!(browser.depth, 1);
        assert_eq!(
            stats.iter().map(|(_, s)| s.depth).sum::<u64>(),
            1
        );
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut config = EngineConfig::with_default_queues();
        for queue in &mut config.queues {
            queue.block_timeout_ms = 50;
        }
        let engine = EngineBuilder::new(config)
            .with_handlers(all_handlers())
            .build()
            .await
            .unwrap();

        let handle = engine.start();
        assert!(handle.is_running());
        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_consumer_names_are_unique() {
        let a = consumer_name("jobs.browser", 0);
        let b = consumer_name("jobs.browser", 0);
        assert!(a.starts_with("jobs.browser-0-"));
        assert_ne!(a, b);
    }
}
