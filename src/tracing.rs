//! Logging and span export
//!
//! The agent's own diagnostics go through `tracing`. When an OTLP endpoint
//! is available, the same OpenTelemetry pipeline also becomes the global
//! tracer provider, which is what [`crate::gate::OtelTracer`] starts probe
//! spans on.
//!
//! # Architecture
//!
//! ```text
//! tracing macros ──► EnvFilter ──► fmt layer (stderr)
//!                             └──► tracing-opentelemetry layer ─┐
//!                                                               ├──► OTLP batch exporter
//! probe spans (OtelTracer) ──► global tracer provider ──────────┘
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default OTLP endpoint (OTel collector, gRPC)
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,spotlight=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize logging plus OpenTelemetry export
///
/// Must run inside a tokio runtime (the batch exporter spawns onto it).
///
/// # Arguments
/// * `service_name` - `service.name` resource attribute on every span
/// * `otlp_endpoint` - Collector URL (defaults to localhost:4317)
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let endpoint = otlp_endpoint.unwrap_or(DEFAULT_OTLP_ENDPOINT);

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    // install_batch also registers the global tracer provider
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)?;

    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::info!(
        service = service_name,
        endpoint = endpoint,
        "OpenTelemetry tracing initialized"
    );
    Ok(())
}

/// Console-only logging, for offline commands that export no spans.
///
/// `json` switches the fmt layer to one JSON object per line.
pub fn init_console(json: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = tracing_subscriber::registry().with(env_filter());
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(())
}

/// Flush pending spans and shut the provider down.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
    tracing::info!("OpenTelemetry tracing shutdown complete");
}
