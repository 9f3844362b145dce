//! OpenTelemetry instrumentation for the molt server.
//!
//! Structured JSON logs always; traces and metrics are exported over OTLP
//! when a collector endpoint is configured.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    trace::SdkTracerProvider,
    Resource,
};
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// The global tracer provider, stored for shutdown.
static TRACER_PROVIDER: std::sync::OnceLock<SdkTracerProvider> = std::sync::OnceLock::new();

/// The global meter provider, stored for shutdown.
static METER_PROVIDER: std::sync::OnceLock<SdkMeterProvider> = std::sync::OnceLock::new();

/// Build the OpenTelemetry resource with service information.
fn build_resource() -> Resource {
    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "molt-server".to_string());
    let service_version = std::env::var("OTEL_SERVICE_VERSION")
        .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", service_name),
            KeyValue::new("service.version", service_version),
        ])
        .build()
}

fn default_filter() -> EnvFilter {
    EnvFilter::new("info,molt_server=debug,molt_ecdysis=debug")
}

fn build_log_filter() -> EnvFilter {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter());
    }

    if let Ok(level_or_filter) = std::env::var("MOLT_LOG_LEVEL") {
        let level_or_filter = level_or_filter.trim();
        if !level_or_filter.is_empty() {
            let filter = if level_or_filter.contains('=') || level_or_filter.contains(',') {
                level_or_filter.to_string()
            } else {
                format!(
                    "{level},molt_server={level},molt_ecdysis={level}",
                    level = level_or_filter
                )
            };
            return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter());
        }
    }

    default_filter()
}

/// Structured JSON log lines carrying the current span and its parents.
fn json_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
}

fn otlp_tracer_provider(
    endpoint: &str,
    resource: Resource,
) -> Result<SdkTracerProvider, Box<dyn std::error::Error + Send + Sync>> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn otlp_meter_provider(
    endpoint: &str,
    resource: Resource,
) -> Result<SdkMeterProvider, Box<dyn std::error::Error + Send + Sync>> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter).build())
        .with_resource(resource)
        .build())
}

/// Initialize logging plus OTLP export of traces and metrics.
///
/// # Configuration
///
/// Environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME`: Service name (default: molt-server)
/// - `OTEL_SERVICE_VERSION`: Service version (default: crate version)
/// - `RUST_LOG`: Log filter
/// - `MOLT_LOG_LEVEL`: Level or filter used when `RUST_LOG` is unset
///
/// # Example
///
/// ```ignore
/// use molt_server::telemetry;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     telemetry::init()?;
///
///     // Serve until drained...
///
///     telemetry::shutdown();
///     Ok(())
/// }
/// ```
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());
    let resource = build_resource();

    let tracer_provider = otlp_tracer_provider(&otlp_endpoint, resource.clone())?;
    let tracer = tracer_provider.tracer("molt-server");
    let _ = TRACER_PROVIDER.set(tracer_provider);

    let meter_provider = otlp_meter_provider(&otlp_endpoint, resource)?;
    let _ = METER_PROVIDER.set(meter_provider.clone());
    opentelemetry::global::set_meter_provider(meter_provider);

    tracing_subscriber::registry()
        .with(build_log_filter())
        .with(json_layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();

    tracing::info!(
        endpoint = %otlp_endpoint,
        "OpenTelemetry initialized with OTLP export"
    );

    Ok(())
}

/// Initialize JSON logging only. Used when no OTLP collector is configured.
pub fn init_local() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(build_log_filter())
        .with(json_layer())
        .init();

    tracing::info!("Local telemetry initialized with JSON logging (no OTLP export)");

    Ok(())
}

/// Shutdown telemetry, flushing any pending spans and metrics.
///
/// Call this before application exit to ensure all telemetry data is sent.
pub fn shutdown() {
    tracing::info!("Shutting down telemetry...");

    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = %e, "Error shutting down tracer provider");
        }
    }

    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = %e, "Error shutting down meter provider");
        }
    }

    tracing::info!("Telemetry shutdown complete");
}

// ============================================================================
// Metrics
// ============================================================================

/// Connection and drain metrics.
///
/// Instruments are no-ops until a meter provider is installed by [`init`].
pub mod metrics {
    use opentelemetry::metrics::{Counter, Gauge, Meter};
    use opentelemetry::KeyValue;
    use std::sync::OnceLock;

    static METER: OnceLock<Meter> = OnceLock::new();

    fn meter() -> &'static Meter {
        METER.get_or_init(|| opentelemetry::global::meter("molt-server"))
    }

    /// Gauge for connections tracked by this generation.
    pub fn connections_active() -> Gauge<i64> {
        meter()
            .i64_gauge("molt.connections.active")
            .with_description("Current number of open websocket connections")
            .with_unit("connection")
            .build()
    }

    /// Counter for upgrades refused because the process is draining.
    pub fn connections_refused() -> Counter<u64> {
        meter()
            .u64_counter("molt.connections.refused")
            .with_description("Connections refused while draining")
            .with_unit("connection")
            .build()
    }

    /// Counter for data frames received from peers.
    pub fn frames_received() -> Counter<u64> {
        meter()
            .u64_counter("molt.frames.received")
            .with_description("Total data frames received")
            .with_unit("frame")
            .build()
    }

    /// Counter for frames queued to peers.
    pub fn frames_sent() -> Counter<u64> {
        meter()
            .u64_counter("molt.frames.sent")
            .with_description("Total frames queued for sending")
            .with_unit("frame")
            .build()
    }

    /// Record how this generation finished draining.
    pub fn record_drain(outcome: &str) {
        meter()
            .u64_counter("molt.drain.completed")
            .with_description("Completed drains by outcome")
            .build()
            .add(1, &[KeyValue::new("outcome", outcome.to_string())]);
    }
}
