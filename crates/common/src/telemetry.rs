//! Tracing and telemetry initialization.
//!
//! Every binary calls `init` once at startup. Log output always goes to
//! stderr via `tracing-subscriber`; OTLP span export is wired in only when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{CommonError, Result};

/// Initialize logging and optional OTLP export for a service.
pub fn init(service_name: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    let otel_layer = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) if !endpoint.is_empty() => {
            let exporter = SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.clone())
                .build()
                .map_err(|e| CommonError::Configuration(format!("otlp exporter: {e}")))?;

            let mut resource = Resource::builder().with_service_name(service_name.to_string());
            if let Ok(instance_id) = std::env::var("CRS_INSTANCE_ID") {
                resource = resource.with_attribute(KeyValue::new("crs.instance.id", instance_id));
            }

            let provider = SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(resource.build())
                .build();
            let tracer = provider.tracer("buttercup");
            Some((endpoint, tracing_opentelemetry::layer().with_tracer(tracer)))
        }
        _ => None,
    };

    let (endpoint, otel_layer) = match otel_layer {
        Some((endpoint, layer)) => (Some(endpoint), Some(layer)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    if let Some(endpoint) = endpoint {
        info!("OTLP span export enabled to {}", endpoint);
    }
    Ok(())
}
