//! # Job Envelope
//!
//! The canonical unit of work in transit. An envelope is created by a
//! producer, mutated only by the dispatcher and retry scheduler (attempt
//! counter, meta enrichment), and ends either acknowledged or converted into
//! a dead-letter entry. `job_id` never changes across retries or queue moves,
//! which is what lets handlers upsert their results idempotently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Known task families
///
/// The wire format carries `task_type` as a plain string so that envelopes
/// with an unrecognised type can still be decoded and dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Low-value generic background work
    Generic,
    /// Headless-browser automation
    Browser,
    /// LLM agent workflow runs
    AgentWorkflow,
    /// Billing usage reconciliation against the payment provider
    UsageReconciliation,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Generic,
        TaskType::Browser,
        TaskType::AgentWorkflow,
        TaskType::UsageReconciliation,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Browser => "browser",
            Self::AgentWorkflow => "agent_workflow",
            Self::UsageReconciliation => "usage_reconciliation",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a wire `task_type` names no known task family
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task type: {0}")]
pub struct UnknownTaskType(pub String);

impl FromStr for TaskType {
    type Err = UnknownTaskType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTaskType(s.to_string()))
    }
}

/// Correlation and provenance metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    pub correlation_id: Uuid,
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    pub enqueue_ts: DateTime<Utc>,
    pub source: String,
    /// Short diagnostic from the most recent failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl JobMeta {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            user_id: None,
            tenant_id: None,
            enqueue_ts: Utc::now(),
            source: source.into(),
            last_error: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

/// A job in transit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: Uuid,
    pub task_type: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub payload: serde_json::Value,
    pub meta: JobMeta,
}

impl JobEnvelope {
    /// Build a fresh envelope with a new job id and zero attempts
    pub fn new(
        task_type: TaskType,
        payload: serde_json::Value,
        max_attempts: u32,
        meta: JobMeta,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            task_type: task_type.as_str().to_string(),
            attempts: 0,
            max_attempts,
            payload,
            meta,
        }
    }

    /// Resolve the wire task type into a known task family
    pub fn task_kind(&self) -> Result<TaskType, UnknownTaskType> {
        self.task_type.parse()
    }

    /// True once the attempt budget is spent
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Copy of this envelope with one more recorded attempt
    ///
    /// Only the attempt counter and `meta.last_error` change; the job id and
    /// payload are carried over untouched.
    pub fn next_attempt(&self, last_error: Option<String>) -> Self {
        let mut next = self.clone();
        next.attempts = self.attempts.saturating_add(1);
        if last_error.is_some() {
            next.meta.last_error = last_error;
        }
        next
    }
}
