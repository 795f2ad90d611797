//! # Structured Logging Module
//!
//! Environment-aware structured logging on top of `tracing-subscriber`.
//! Level precedence: `RUST_LOG`, then `telemetry.log_level`, then a default
//! derived from the environment name.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, TelemetryConfig};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process
pub fn init_structured_logging(telemetry: &TelemetryConfig, environment: &str) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = build_filter(telemetry, environment);

        let layer = match telemetry.log_format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(false)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .boxed(),
        };

        // Embedding applications may already have installed a subscriber
        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            format = ?telemetry.log_format,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

fn build_filter(telemetry: &TelemetryConfig, environment: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = telemetry
        .log_level
        .clone()
        .unwrap_or_else(|| default_log_level(environment).to_string());
    EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new(default_log_level(environment)))
}

/// Get log level based on environment
pub fn default_log_level(environment: &str) -> &'static str {
    match environment {
        "test" | "development" => "debug",
        _ => "info",
    }
}
