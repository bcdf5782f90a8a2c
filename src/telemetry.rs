//! Tracing setup: stdout logging plus optional OpenTelemetry export

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::{trace, Resource};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVICE_NAME: &str = "capvcd-manager";

/// Install the global tracing subscriber
///
/// OpenTelemetry export is only enabled when `OTEL_EXPORTER_OTLP_ENDPOINT`
/// is set, so local runs need no collector.
pub fn init(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = if json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) => match build_tracer(&endpoint) {
            Ok(tracer) => {
                opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
                registry
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .init();
                info!("OpenTelemetry tracing initialized ({})", endpoint);
            }
            Err(e) => {
                registry.init();
                warn!("OpenTelemetry disabled, failed to build exporter: {}", e);
            }
        },
        Err(_) => {
            registry.init();
            info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
        }
    }
}

fn build_tracer(
    endpoint: &str,
) -> Result<opentelemetry_sdk::trace::Tracer, opentelemetry::trace::TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(trace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
}

/// Flush any buffered spans
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
