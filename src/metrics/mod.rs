//! # OpenTelemetry Metrics Module
//!
//! Metrics for the job engine, exported via OTLP when enabled.
//!
//! ## Architecture
//!
//! Instruments are organised by domain:
//! - `jobs`: processing duration, errors, retries, dead letters, queue gauges
//! - `resilience`: circuit state gauge and rejection counter
//!
//! Every data point carries the base labels `service` and `env`. Correlation
//! ids are never used as labels; they belong on log lines and spans.
//!
//! Until [`init_metrics`] installs an exporting provider, instruments are
//! served by the global no-op provider, so recording is always safe. Meters
//! are resolved from the global provider on every record, so data points
//! taken after initialisation reach the exporter even when a breaker or
//! queue recorded earlier.

use crate::config::{ServiceConfig, TelemetryConfig};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    runtime, Resource,
};
use parking_lot::RwLock;
use std::sync::OnceLock;
use std::time::Duration;

pub mod jobs;
pub mod resilience;

/// Global metrics initialization state
static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Base labels attached to every data point; defaults until set
static BASE_LABELS: RwLock<Option<[KeyValue; 2]>> = parking_lot::const_rwlock(None);

/// Set the `service`/`env` base labels
///
/// Replaces whatever was in effect, including the defaults picked up by
/// metrics recorded before telemetry was initialised.
pub fn set_base_labels(service: &str, environment: &str) {
    let labels = [
        KeyValue::new("service", service.to_string()),
        KeyValue::new("env", environment.to_string()),
    ];
    if let Some(previous) = BASE_LABELS.write().replace(labels) {
        tracing::debug!(
            previous_service = %previous[0].value,
            previous_env = %previous[1].value,
            service = %service,
            env = %environment,
            "Metric base labels replaced"
        );
    }
}

/// Base labels followed by `extra`
pub(crate) fn labels(extra: &[KeyValue]) -> Vec<KeyValue> {
    let mut all = Vec::with_capacity(2 + extra.len());
    match &*BASE_LABELS.read() {
        Some(base) => all.extend_from_slice(base),
        None => {
            all.push(KeyValue::new("service", crate::constants::DEFAULT_SERVICE_NAME));
            all.push(KeyValue::new("env", crate::config::detect_environment()));
        }
    }
    all.extend_from_slice(extra);
    all
}

fn init_opentelemetry_meter(
    service: &ServiceConfig,
    telemetry: &TelemetryConfig,
) -> anyhow::Result<SdkMeterProvider> {
    let resource = Resource::new(vec![
        KeyValue::new("service.name", service.name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        KeyValue::new("deployment.environment", service.environment.clone()),
    ]);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(telemetry.otlp_endpoint.clone())
        .build()?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio)
        .with_interval(Duration::from_secs(telemetry.export_interval_seconds))
        .build();

    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build())
}

/// Initialize metrics collection
///
/// Safe to call more than once; later calls are no-ops. Export is only set
/// up when `telemetry.metrics_enabled` is true. An exporter that fails to
/// build disables export with a warning rather than failing startup.
pub fn init_metrics(service: &ServiceConfig, telemetry: &TelemetryConfig) {
    set_base_labels(&service.name, &service.environment);

    METRICS_INITIALIZED.get_or_init(|| {
        if !telemetry.metrics_enabled {
            tracing::debug!("Metrics export disabled (telemetry.metrics_enabled=false)");
            return;
        }
        match init_opentelemetry_meter(service, telemetry) {
            Ok(provider) => {
                opentelemetry::global::set_meter_provider(provider);
                tracing::info!(
                    service_name = %service.name,
                    otlp_endpoint = %telemetry.otlp_endpoint,
                    export_interval_seconds = telemetry.export_interval_seconds,
                    "OpenTelemetry metrics initialized"
                );
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Failed to initialize OpenTelemetry metrics - metrics export disabled"
                );
            }
        }
    });
}
