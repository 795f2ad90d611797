//! # Configuration
//!
//! Typed engine configuration. Every section has complete defaults, so an
//! empty file (or no file at all) yields a runnable development setup; see
//! [`loader`] for how files and environment variables are layered on top.

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

use crate::messaging::{DeliveryMode, QueueName, TaskType};
use crate::resilience::CircuitBreakerSettings;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Deployment environment: `JOBRELAY_ENV`, then `APP_ENV`, else `development`
pub fn detect_environment() -> String {
    std::env::var("JOBRELAY_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
        .to_lowercase()
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub service: ServiceConfig,
    pub store: StoreConfig,
    pub queues: Vec<QueueConfig>,
    pub backoff: BackoffConfig,
    pub dispatcher: DispatcherConfig,
    pub dead_letter: DeadLetterConfig,
    pub circuit_breakers: CircuitBreakerSettings,
    pub features: FeatureConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Reported as the `service` metric label
    pub name: String,
    /// First segment of every queue name
    pub namespace: String,
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: crate::constants::DEFAULT_SERVICE_NAME.to_string(),
            namespace: crate::constants::DEFAULT_NAMESPACE.to_string(),
            environment: detect_environment(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    InMemory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Idle poll interval for stores without push notification
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::InMemory,
            database_url: None,
            max_connections: 10,
            poll_interval_ms: 250,
        }
    }
}

impl StoreConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// One logical queue and the task types routed to it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Logical name, e.g. `jobs.browser`
    pub name: String,
    pub mode: DeliveryMode,
    /// Consumer group (stream mode only)
    pub group: Option<String>,
    pub task_types: Vec<TaskType>,
    /// Dispatcher tasks spawned for this queue
    pub workers: usize,
    /// Messages claimed per call
    pub claim_batch: usize,
    pub block_timeout_ms: u64,
    /// Claim idle time after which a pending message may be reclaimed
    pub staleness_threshold_ms: u64,
    /// Producer admission limit on live depth
    pub max_depth: Option<u64>,
    /// Overrides `backoff.default_max_attempts` for jobs submitted here
    pub max_attempts: Option<u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            mode: DeliveryMode::Stream,
            group: None,
            task_types: Vec::new(),
            workers: 1,
            claim_batch: 10,
            block_timeout_ms: 5_000,
            staleness_threshold_ms: 60_000,
            max_depth: None,
            max_attempts: None,
        }
    }
}

impl QueueConfig {
    fn stream(name: &str, group: &str, task_type: TaskType) -> Self {
        Self {
            name: name.to_string(),
            mode: DeliveryMode::Stream,
            group: Some(group.to_string()),
            task_types: vec![task_type],
            ..Self::default()
        }
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    /// The built-in queue layout: generic work on a list, everything else on logs
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                name: "jobs.generic".to_string(),
                mode: DeliveryMode::List,
                task_types: vec![TaskType::Generic],
                ..Self::default()
            },
            Self::stream("jobs.browser", "browser-workers", TaskType::Browser),
            Self::stream("jobs.agents", "agent-workers", TaskType::AgentWorkflow),
            Self::stream("jobs.billing", "billing-workers", TaskType::UsageReconciliation),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound of the uniform random jitter added to each delay
    pub max_jitter_ms: u64,
    pub default_max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            max_jitter_ms: 1_000,
            default_max_attempts: 3,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub handler_timeout_ms: u64,
    pub reclaim_interval_ms: u64,
    /// Consecutive queue-store failures after which a dispatcher gives up
    pub max_consecutive_store_errors: u32,
    pub store_error_backoff_ms: u64,
    pub promote_interval_ms: u64,
    pub promote_batch: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: 30_000,
            reclaim_interval_ms: 15_000,
            max_consecutive_store_errors: 5,
            store_error_backoff_ms: 500,
            promote_interval_ms: 1_000,
            promote_batch: 100,
        }
    }
}

impl DispatcherConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }

    pub fn store_error_backoff(&self) -> Duration {
        Duration::from_millis(self.store_error_backoff_ms)
    }

    pub fn promote_interval(&self) -> Duration {
        Duration::from_millis(self.promote_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Attempts at writing one dead-letter entry before escalating
    pub write_attempts: u32,
    pub write_base_delay_ms: u64,
    pub write_max_delay_ms: u64,
    pub last_error_max_len: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            write_attempts: 5,
            write_base_delay_ms: 200,
            write_max_delay_ms: 5_000,
            last_error_max_len: 512,
        }
    }
}

impl DeadLetterConfig {
    pub fn write_base_delay(&self) -> Duration {
        Duration::from_millis(self.write_base_delay_ms)
    }

    pub fn write_max_delay(&self) -> Duration {
        Duration::from_millis(self.write_max_delay_ms)
    }
}

/// Feature flags per task type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Applies to task types without an explicit entry
    pub default_enabled: bool,
    /// Keyed by wire task type name (`browser`, `agent_workflow`, ...)
    pub tasks: HashMap<String, bool>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            default_enabled: true,
            tasks: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Falls back to an environment-derived level; `RUST_LOG` wins over both
    pub log_level: Option<String>,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub otlp_endpoint: String,
    pub export_interval_seconds: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            otlp_endpoint: "http://localhost:4317".to_string(),
            export_interval_seconds: 60,
        }
    }
}

impl EngineConfig {
    /// Defaults with the built-in queue layout
    pub fn with_default_queues() -> Self {
        Self {
            queues: QueueConfig::defaults(),
            ..Self::default()
        }
    }

    /// Fully qualified name for a configured queue
    pub fn queue_name(&self, queue: &QueueConfig) -> QueueName {
        QueueName::new(
            self.service.namespace.clone(),
            self.service.environment.clone(),
            queue.mode,
            queue.name.clone(),
        )
    }

    /// Queue a task type is routed to
    pub fn route_for(&self, task_type: TaskType) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.task_types.contains(&task_type))
    }

    /// Attempt budget for jobs submitted to `queue`
    pub fn max_attempts_for(&self, queue: &QueueConfig) -> u32 {
        queue.max_attempts.unwrap_or(self.backoff.default_max_attempts)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.service.namespace.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "service.namespace",
                "must not be empty",
            ));
        }
        if self.service.environment.trim().is_empty() {
            return Err(ConfigurationError::invalid_value(
                "service.environment",
                "must not be empty",
            ));
        }
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(ConfigurationError::invalid_value(
                "store.database_url",
                "required for the postgres backend",
            ));
        }

        let mut seen_names = HashSet::new();
        let mut routed = HashSet::new();
        for (i, queue) in self.queues.iter().enumerate() {
            let field = |f: &str| format!("queues[{i}].{f}");
            if queue.name.trim().is_empty() {
                return Err(ConfigurationError::invalid_value(field("name"), "must not be empty"));
            }
            if !seen_names.insert(queue.name.as_str()) {
                return Err(ConfigurationError::invalid_value(
                    field("name"),
                    format!("duplicate queue '{}'", queue.name),
                ));
            }
            if queue.mode == DeliveryMode::Stream
                && queue.group.as_deref().map_or(true, |g| g.trim().is_empty())
            {
                return Err(ConfigurationError::invalid_value(
                    field("group"),
                    "stream queues need a consumer group",
                ));
            }
            if queue.workers == 0 {
                return Err(ConfigurationError::invalid_value(field("workers"), "must be at least 1"));
            }
            if queue.claim_batch == 0 {
                return Err(ConfigurationError::invalid_value(
                    field("claim_batch"),
                    "must be at least 1",
                ));
            }
            if queue.block_timeout_ms == 0 {
                return Err(ConfigurationError::invalid_value(
                    field("block_timeout_ms"),
                    "must be greater than 0",
                ));
            }
            if queue.staleness_threshold_ms == 0 {
                return Err(ConfigurationError::invalid_value(
                    field("staleness_threshold_ms"),
                    "must be greater than 0",
                ));
            }
            if queue.max_attempts == Some(0) {
                return Err(ConfigurationError::invalid_value(
                    field("max_attempts"),
                    "must be at least 1",
                ));
            }
            for task_type in &queue.task_types {
                if !routed.insert(*task_type) {
                    return Err(ConfigurationError::invalid_value(
                        field("task_types"),
                        format!("task type '{task_type}' is routed to more than one queue"),
                    ));
                }
            }
        }

        if self.backoff.default_max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.default_max_attempts",
                "must be at least 1",
            ));
        }
        if self.backoff.base_delay_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.base_delay_ms",
                "must be greater than 0",
            ));
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "backoff.max_delay_ms",
                "must not be smaller than base_delay_ms",
            ));
        }
        if self.dispatcher.handler_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.handler_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.dispatcher.max_consecutive_store_errors == 0 {
            return Err(ConfigurationError::invalid_value(
                "dispatcher.max_consecutive_store_errors",
                "must be at least 1",
            ));
        }
        if self.dead_letter.write_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "dead_letter.write_attempts",
                "must be at least 1",
            ));
        }
        self.circuit_breakers
            .validate()
            .map_err(|reason| ConfigurationError::invalid_value("circuit_breakers", reason))?;

        Ok(())
    }
}
