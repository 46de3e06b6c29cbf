//! Logging and OpenTelemetry setup
//!
//! JSON logs always go to stdout. When `OTEL_EXPORTER_OTLP_ENDPOINT` is set,
//! spans and the counters in [`crate::metrics`] are also pushed over OTLP.
//! Keep the returned [`TelemetryGuard`] alive for the life of the process;
//! dropping it flushes whatever the exporters still buffer.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,service_mirror=debug,kube=info,tower=warn,hyper=warn";

/// Pod metadata injected through the downward API, as resource attributes
const POD_ATTRIBUTES: [(&str, &str); 2] = [
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
];

/// Telemetry could not be installed
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {message}")]
    Exporter {
        /// `traces` or `metrics`
        signal: &'static str,
        /// Exporter error
        message: String,
    },

    /// A global subscriber is already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Telemetry settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to spans and metrics
    pub service_name: String,
    /// OTLP collector endpoint (e.g. `http://otel-collector:4317`)
    pub otlp_endpoint: Option<String>,
    /// Link served by this process, attached as a resource attribute
    pub link_name: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "service-mirror".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            link_name: None,
        }
    }
}

/// Owns the OTLP providers, if any, and shuts them down on drop
#[must_use = "dropping the guard shuts the exporters down"]
#[derive(Default)]
pub struct TelemetryGuard {
    tracer: Option<TracerProvider>,
    meter: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(tracer) = self.tracer.take() {
            if let Err(e) = tracer.shutdown() {
                eprintln!("failed to flush spans: {e}");
            }
        }
        if let Some(meter) = self.meter.take() {
            if let Err(e) = meter.shutdown() {
                eprintln!("failed to flush metrics: {e}");
            }
        }
    }
}

/// Install the global tracing subscriber and, if configured, OTLP exporters
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let mut guard = TelemetryGuard::default();

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let resource = build_resource(&config);

            let meter = otlp_meter_provider(endpoint, resource.clone())?;
            global::set_meter_provider(meter.clone());
            guard.meter = Some(meter);

            let tracer = otlp_tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(tracer.clone());
            let layer =
                tracing_opentelemetry::layer().with_tracer(tracer.tracer(config.service_name));
            guard.tracer = Some(tracer);
            Some(layer)
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json_logs = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_logs)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    Ok(guard)
}

fn build_resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    if let Some(link) = &config.link_name {
        attributes.push(KeyValue::new("service_mirror.link", link.clone()));
    }
    attributes.extend(
        POD_ATTRIBUTES
            .iter()
            .filter_map(|(var, key)| Some(KeyValue::new(*key, std::env::var(var).ok()?))),
    );

    Resource::new(attributes)
}

fn otlp_tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "traces",
            message: e.to_string(),
        })?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn otlp_meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metrics",
            message: e.to_string(),
        })?;

    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}
