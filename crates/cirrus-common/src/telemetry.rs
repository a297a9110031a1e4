//! Telemetry initialization for OpenTelemetry tracing and metrics
//!
//! Sets up W3C TraceContext propagation, optional OTLP export (enabled when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set), Kubernetes resource detection, and
//! JSON structured logging.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize OpenTelemetry tracer
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize OTLP metrics exporter
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces and metrics (e.g. "cirrus-operator")
    pub service_name: String,

    /// OTLP endpoint for trace and metric export. If None, traces and
    /// metrics are only logged locally.
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "cirrus".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }
}

/// Initialize telemetry with the given configuration
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = build_resource(&config.service_name);

    // Option<Layer> implements Layer, so the OTLP layer composes directly
    let otel_layer = if let Some(endpoint) = &config.otlp_endpoint {
        init_otlp_metrics(endpoint, resource.clone())?;
        let provider = init_otlp_tracer(endpoint, resource)?;
        let tracer = provider.tracer(config.service_name.clone());
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cirrus=debug,kube=info,tower=warn,hyper=warn"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(())
}

/// Build OpenTelemetry resource with service info and K8s detection
fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![KeyValue::new(
        opentelemetry_semantic_conventions::resource::SERVICE_NAME,
        service_name.to_string(),
    )];

    // K8s attributes arrive via the Deployment downward API
    if let Ok(pod_name) = std::env::var("POD_NAME") {
        attributes.push(KeyValue::new("k8s.pod.name", pod_name));
    }
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }
    if let Ok(node_name) = std::env::var("NODE_NAME") {
        attributes.push(KeyValue::new("k8s.node.name", node_name));
    }

    if let Some(version) = option_env!("CARGO_PKG_VERSION") {
        attributes.push(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            version.to_string(),
        ));
    }

    Resource::new(attributes)
}

fn init_otlp_tracer(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());

    Ok(provider)
}

fn init_otlp_metrics(endpoint: &str, resource: Resource) -> Result<(), TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let reader =
        opentelemetry_sdk::metrics::PeriodicReader::builder(exporter, runtime::Tokio).build();

    let meter_provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(meter_provider);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config() {
        let config = TelemetryConfig {
            service_name: "cirrus-operator".to_string(),
            otlp_endpoint: None,
        };
        assert_eq!(config.service_name, "cirrus-operator");
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn test_build_resource() {
        let resource = build_resource("cirrus");
        assert!(!resource.is_empty());
    }
}
