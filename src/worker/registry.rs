//! # Handler Registry
//!
//! Maps each [`TaskType`] to its handler and, optionally, the circuit
//! breaker target the dispatcher gates the whole invocation through.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::messaging::TaskType;

use super::handler::TaskHandler;

#[derive(Clone)]
pub struct RegisteredHandler {
    pub handler: Arc<dyn TaskHandler>,
    /// Breaker target guarding the invocation, if any
    pub breaker_target: Option<String>,
}

impl fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("handler", &self.handler.name())
            .field("breaker_target", &self.breaker_target)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a task type
    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.insert(task_type, handler, None)
    }

    /// Register a handler whose every invocation passes through the breaker
    /// for `target`
    pub fn register_guarded(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
        target: impl Into<String>,
    ) -> &mut Self {
        self.insert(task_type, handler, Some(target.into()))
    }

    fn insert(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
        breaker_target: Option<String>,
    ) -> &mut Self {
        debug!(
            task_type = %task_type,
            handler = %handler.name(),
            breaker_target = ?breaker_target,
            "Registered task handler"
        );
        self.handlers.insert(
            task_type,
            RegisteredHandler {
                handler,
                breaker_target,
            },
        );
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<&RegisteredHandler> {
        self.handlers.get(&task_type)
    }

    pub fn handler_available(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    /// Registered task types in declaration order of [`TaskType::ALL`]
    pub fn registered_task_types(&self) -> Vec<TaskType> {
        TaskType::ALL
            .into_iter()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }
}
