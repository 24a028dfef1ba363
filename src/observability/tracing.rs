use anyhow::{Context, Error, Result};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracer, SdkTracerProvider},
};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Span export settings, taken from the worker configuration.
#[derive(Debug, Clone)]
pub struct TracingSettings {
    /// OTLP collector endpoint. Without one, only the fmt layer is installed.
    pub otlp_endpoint: Option<String>,
    /// Trace sampling ratio (1.0 = every trace).
    pub sampling_ratio: f64,
}

/// Initialize the tracing subscriber exactly once.
///
/// Output is structured JSON with an env-filterable level. When an OTLP
/// endpoint is configured, spans are additionally bridged into an
/// OpenTelemetry exporter at the configured sampling ratio.
///
/// # Errors
/// Returns an error when the exporter cannot be built or subscriber
/// initialization fails.
pub fn init(settings: &TracingSettings) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).json();
        let registry = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer);

        match settings.otlp_endpoint.as_deref() {
            Some(endpoint) => {
                let tracer = init_tracer(endpoint, settings.sampling_ratio)?;
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                registry
                    .with(otel_layer)
                    .try_init()
                    .map_err(|error| Error::msg(error.to_string()))?;
                info!(endpoint, "tracing initialized with OTLP span export");
            }
            None => {
                registry
                    .try_init()
                    .map_err(|error| Error::msg(error.to_string()))?;
                info!("tracing initialized");
            }
        }

        Ok::<(), Error>(())
    })?;
    Ok(())
}

/// Build the OpenTelemetry tracer exporting over OTLP and install its
/// provider globally.
///
/// # Errors
/// Returns an error when the exporter or provider cannot be built.
fn init_tracer(endpoint: &str, sampling_ratio: f64) -> Result<SdkTracer> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", "subflow-worker"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(sampling_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer("subflow-worker");

    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}
