//! # Feature Gating
//!
//! Typed capability check per [`TaskType`], backed by an immutable snapshot
//! that can be swapped at runtime. Readers clone the current `Arc` and never
//! observe a half-applied reload.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::FeatureConfig;
use crate::messaging::TaskType;

/// Resolved flags at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSnapshot {
    default_enabled: bool,
    tasks: HashMap<TaskType, bool>,
}

impl FeatureSnapshot {
    pub fn all_enabled() -> Self {
        Self {
            default_enabled: true,
            tasks: HashMap::new(),
        }
    }

    /// Resolve wire names; unknown names are logged and skipped
    pub fn from_config(config: &FeatureConfig) -> Self {
        let mut tasks = HashMap::with_capacity(config.tasks.len());
        for (name, enabled) in &config.tasks {
            match name.parse::<TaskType>() {
                Ok(task_type) => {
                    tasks.insert(task_type, *enabled);
                }
                Err(e) => warn!(flag = %name, error = %e, "Ignoring feature flag for unknown task type"),
            }
        }
        Self {
            default_enabled: config.default_enabled,
            tasks,
        }
    }

    pub fn with_task(mut self, task_type: TaskType, enabled: bool) -> Self {
        self.tasks.insert(task_type, enabled);
        self
    }

    pub fn is_enabled(&self, task_type: TaskType) -> bool {
        self.tasks
            .get(&task_type)
            .copied()
            .unwrap_or(self.default_enabled)
    }
}

impl Default for FeatureSnapshot {
    fn default() -> Self {
        Self::all_enabled()
    }
}

#[derive(Debug, Default)]
pub struct FeatureGate {
    snapshot: RwLock<Arc<FeatureSnapshot>>,
}

impl FeatureGate {
    pub fn new(snapshot: FeatureSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn from_config(config: &FeatureConfig) -> Self {
        Self::new(FeatureSnapshot::from_config(config))
    }

    pub fn is_enabled(&self, task_type: TaskType) -> bool {
        self.snapshot.read().is_enabled(task_type)
    }

    /// Current snapshot, for callers making several checks consistently
    pub fn snapshot(&self) -> Arc<FeatureSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Atomically replace the snapshot
    pub fn reload(&self, snapshot: FeatureSnapshot) {
        let disabled: Vec<&'static str> = TaskType::ALL
            .iter()
            .filter(|t| !snapshot.is_enabled(**t))
            .map(|t| t.as_str())
            .collect();
        *self.snapshot.write() = Arc::new(snapshot);
        info!(disabled = ?disabled, "🚩 Feature flags reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_enabled() {
        let gate = FeatureGate::default();
        for task_type in TaskType::ALL {
            assert!(gate.is_enabled(task_type));
        }
    }

    #[test]
    fn test_from_config_skips_unknown_names() {
        let mut config = FeatureConfig::default();
        config.tasks.insert("browser".to_string(), false);
        config.tasks.insert("teleport".to_string(), false);

        let gate = FeatureGate::from_config(&config);
        assert!(!gate.is_enabled(TaskType::Browser));
        assert!(gate.is_enabled(TaskType::Generic));
        assert_eq!(gate.snapshot().tasks.len(), 1);
    }

    #[test]
    fn test_default_disabled_with_allow_list() {
        let config = FeatureConfig {
            default_enabled: false,
            tasks: HashMap::from([("generic".to_string(), true)]),
        };
        let snapshot = FeatureSnapshot::from_config(&config);
        assert!(snapshot.is_enabled(TaskType::Generic));
        assert!(!snapshot.is_enabled(TaskType::AgentWorkflow));
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let gate = FeatureGate::default();
        let before = gate.snapshot();
        gate.reload(FeatureSnapshot::all_enabled().with_task(TaskType::AgentWorkflow, false));

        assert!(!gate.is_enabled(TaskType::AgentWorkflow));
        // Snapshots handed out earlier stay consistent
        assert!(before.is_enabled(TaskType::AgentWorkflow));
    }
}
