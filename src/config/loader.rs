//! Configuration Loader
//!
//! Layers configuration sources with the `config` crate, lowest precedence
//! first:
//!
//! 1. Built-in defaults ([`EngineConfig::default`])
//! 2. `config/jobrelay.toml`, or an explicit file given to [`ConfigLoader::with_file`]
//! 3. `config/jobrelay.{environment}.toml` next to it, when present
//! 4. Environment variables prefixed `JOBRELAY__`, with `__` between path
//!    segments (`JOBRELAY__DISPATCHER__HANDLER_TIMEOUT_MS=10000`)
//!
//! A configuration without any `[[queues]]` gets the built-in queue layout.

use super::error::{ConfigResult, ConfigurationError};
use super::{detect_environment, EngineConfig, QueueConfig};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_CONFIG_FILE: &str = "config/jobrelay.toml";
const ENV_PREFIX: &str = "JOBRELAY";

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    environment: Option<String>,
    use_env_vars: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            environment: None,
            use_env_vars: true,
        }
    }

    /// Load from this file instead of the default location; it must exist
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Use an explicit environment instead of detecting it
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Skip `JOBRELAY__*` variables (keeps tests hermetic)
    pub fn without_env_vars(mut self) -> Self {
        self.use_env_vars = false;
        self
    }

    /// Build, validate and return the configuration
    pub fn load(&self) -> ConfigResult<EngineConfig> {
        let environment = self
            .environment
            .clone()
            .unwrap_or_else(detect_environment);

        let (base_file, required) = match &self.file {
            Some(path) => {
                if !path.is_file() {
                    return Err(ConfigurationError::FileNotFound { path: path.clone() });
                }
                (path.clone(), true)
            }
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        let overlay = environment_overlay(&base_file, &environment);

        debug!(
            environment = %environment,
            file = %base_file.display(),
            overlay = %overlay.display(),
            "Loading configuration"
        );

        let mut builder = Config::builder()
            .add_source(File::from(base_file.as_path()).format(FileFormat::Toml).required(required))
            .add_source(File::from(overlay.as_path()).format(FileFormat::Toml).required(false));
        if self.use_env_vars {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let mut config: EngineConfig = builder.build()?.try_deserialize()?;
        if config.service.environment.trim().is_empty() || self.environment.is_some() {
            config.service.environment = environment.clone();
        }
        if config.queues.is_empty() {
            config.queues = QueueConfig::defaults();
        }
        config.validate()?;

        info!(
            environment = %config.service.environment,
            namespace = %config.service.namespace,
            queues = config.queues.len(),
            store = ?config.store.backend,
            "Configuration loaded successfully"
        );
        Ok(config)
    }
}

/// `dir/jobrelay.toml` -> `dir/jobrelay.{environment}.toml`
fn environment_overlay(base: &Path, environment: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("jobrelay");
    base.with_file_name(format!("{stem}.{environment}.toml"))
}
