//! Whole-engine runs on the in-memory backend: build, submit, process, stop

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use jobrelay_core::config::{EngineConfig, StoreBackend};
use jobrelay_core::dead_letter::FailureReason;
use jobrelay_core::messaging::{InMemoryQueueStore, JobEnvelope, JobMeta, TaskType};
use jobrelay_core::producer::SubmitRejection;
use jobrelay_core::resilience::targets;
use jobrelay_core::worker::{
    HandlerContext, HandlerError, HandlerRegistry, InMemoryResultStore, ResultStore, TaskHandler,
};
use jobrelay_core::{EngineBuilder, EngineError, FeatureSnapshot};
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Default)]
struct EchoHandler {
    calls: AtomicU32,
}

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, _ctx: &HandlerContext, job: &JobEnvelope) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "echo": job.payload }))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Rejects payloads without a `url` field
#[derive(Debug)]
struct StrictBrowserHandler;

#[async_trait]
impl TaskHandler for StrictBrowserHandler {
    async fn handle(&self, _ctx: &HandlerContext, job: &JobEnvelope) -> Result<Value, HandlerError> {
        match job.payload.get("url").and_then(Value::as_str) {
            Some(url) => Ok(json!({ "visited": url })),
            None => Err(HandlerError::validation("payload.url is required")),
        }
    }

    fn name(&self) -> &str {
        "strict_browser"
    }
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::with_default_queues();
    config.service.environment = "test".to_string();
    config.store.backend = StoreBackend::InMemory;
    config.dispatcher.promote_interval_ms = 20;
    config.backoff.base_delay_ms = 10;
    config.backoff.max_jitter_ms = 0;
    for queue in &mut config.queues {
        queue.block_timeout_ms = 20;
        queue.workers = 2;
    }
    config
}

fn handlers(echo: Arc<EchoHandler>) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers
        .register(TaskType::Generic, echo.clone())
        .register(TaskType::AgentWorkflow, echo.clone())
        .register(TaskType::UsageReconciliation, echo)
        .register_guarded(
            TaskType::Browser,
            Arc::new(StrictBrowserHandler),
            targets::BROWSER_ENGINE,
        );
    handlers
}

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_engine_processes_mixed_workload() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt::try_init();
    info!("🧪 Running mixed workload through the engine");

    let echo = Arc::new(EchoHandler::default());
    let results = Arc::new(InMemoryResultStore::new());
    let engine = EngineBuilder::new(fast_config())
        .with_store(Arc::new(InMemoryQueueStore::new()))
        .with_result_store(results.clone())
        .with_handlers(handlers(echo.clone()))
        .build()
        .await?;
    let browser_queue = engine
        .queue_for(TaskType::Browser)
        .expect("browser route")
        .clone();
    let dead_letters = engine.dead_letters().clone();

    let handle = engine.start();
    let producer = handle.producer().clone();

    let submissions = (0..5).map(|n| {
        producer.submit(TaskType::Generic, json!({ "n": n }), JobMeta::new("engine-test"))
    });
    let mut accepted = Vec::new();
    for receipt in join_all(submissions).await {
        accepted.push(receipt?.job_id);
    }
    let agent = producer
        .submit(TaskType::AgentWorkflow, json!({ "goal": "summarize" }), JobMeta::new("engine-test"))
        .await?;
    accepted.push(agent.job_id);
    let visited = producer
        .submit(TaskType::Browser, json!({ "url": "https://example.com" }), JobMeta::new("engine-test"))
        .await?;
    let rejected = producer
        .submit(TaskType::Browser, json!({ "selector": "#main" }), JobMeta::new("engine-test"))
        .await?;

    let all_done = wait_for(|| {
        let results = results.clone();
        let expected = accepted.len() + 1;
        async move { results.len() == expected }
    })
    .await;
    assert!(all_done, "results were not persisted in time");
    assert_eq!(echo.calls.load(Ordering::SeqCst), 6);

    let stored = results.get(visited.job_id).await?.expect("browser result");
    assert_eq!(stored.result, json!({ "visited": "https://example.com" }));
    for job_id in &accepted {
        assert!(results.get(*job_id).await?.is_some());
    }

    let dead_lettered = wait_for(|| {
        let dead_letters = dead_letters.clone();
        let queue = browser_queue.clone();
        async move {
            dead_letters
                .list(&queue, 10)
                .await
                .map(|entries| entries.len() == 1)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(dead_lettered, "invalid browser job was not dead-lettered");
    let entry = dead_letters.list(&browser_queue, 10).await?.remove(0);
    assert_eq!(entry.job_id(), Some(rejected.job_id));
    assert_eq!(entry.failure_reason, FailureReason::PermanentValidationError);
    assert!(results.get(rejected.job_id).await?.is_none());

    handle.shutdown().await?;
    info!("✅ Engine drained and stopped cleanly");
    Ok(())
}

#[tokio::test]
async fn test_disabled_task_type_is_rejected_at_submission() -> Result<(), Box<dyn std::error::Error>> {
    let engine = EngineBuilder::new(fast_config())
        .with_handlers(handlers(Arc::new(EchoHandler::default())))
        .build()
        .await?;
    engine
        .features()
        .reload(FeatureSnapshot::all_enabled().with_task(TaskType::UsageReconciliation, false));

    let rejection = engine
        .producer()
        .submit(TaskType::UsageReconciliation, json!({}), JobMeta::new("engine-test"))
        .await
        .unwrap_err();
    assert!(matches!(rejection, SubmitRejection::FeatureDisabled(TaskType::UsageReconciliation)));
    assert_eq!(rejection.code(), "feature_disabled");

    let billing = engine.queue_for(TaskType::UsageReconciliation).expect("route");
    assert_eq!(billing.stats().await?.depth, 0);
    Ok(())
}

#[tokio::test]
async fn test_queue_quota_rejects_when_full() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = fast_config();
    for queue in &mut config.queues {
        queue.max_depth = Some(2);
    }
    // Not started: nothing drains the queue
    let engine = EngineBuilder::new(config)
        .with_handlers(handlers(Arc::new(EchoHandler::default())))
        .build()
        .await?;
    let producer = engine.producer();

    for n in 0..2 {
        producer
            .submit(TaskType::AgentWorkflow, json!({ "n": n }), JobMeta::new("engine-test"))
            .await?;
    }
    let rejection = producer
        .submit(TaskType::AgentWorkflow, json!({ "n": 2 }), JobMeta::new("engine-test"))
        .await
        .unwrap_err();
    assert!(matches!(
        rejection,
        SubmitRejection::QueueAtCapacity {
            depth: 2,
            max_depth: 2,
            ..
        }
    ));
    assert_eq!(rejection.code(), "quota_exceeded");
    Ok(())
}

#[tokio::test]
async fn test_build_rejects_invalid_configuration() {
    let mut config = fast_config();
    config.queues[1].block_timeout_ms = 0;

    let err = EngineBuilder::new(config)
        .with_handlers(handlers(Arc::new(EchoHandler::default())))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}
