//! Tracing/OpenTelemetry initialization (spec.md §6 "ambient
//! observability").
//!
//! Grounded on the teacher's sibling `core/telemetry.rs::init_telemetry`
//! — the `durable` crate itself declares `opentelemetry`/`opentelemetry_sdk`/
//! `tracing-opentelemetry` in its `Cargo.toml` but never wires them up;
//! `core/telemetry.rs` is where the same workspace actually shows the
//! console-layer + OTLP-layer composition. Dropped the Gen-AI semantic
//! convention constants the source carried — nothing in a dispatcher/
//! ledger/workflow engine emits chat/embeddings spans.

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Where traces/logs go, loaded from environment by [`TelemetryConfig::from_env`].
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`. `None` disables
    /// OTLP export; console logging still runs.
    pub otlp_endpoint: Option<String>,
    pub environment: Option<String>,
    pub enable_console: bool,
    /// `tracing_subscriber::EnvFilter` directive string, e.g. `"info"`
    /// or `"taskforge=debug,tower=warn"`.
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "taskforge".to_string(),
            service_version: None,
            otlp_endpoint: None,
            environment: None,
            enable_console: true,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Environment variables:
    /// - `OTEL_SERVICE_NAME` (default `taskforge`)
    /// - `OTEL_SERVICE_VERSION`
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`
    /// - `OTEL_ENVIRONMENT`
    /// - `RUST_LOG` (falls back to `LOG_LEVEL`)
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "taskforge".to_string()),
            service_version: std::env::var("OTEL_SERVICE_VERSION").ok(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            environment: std::env::var("OTEL_ENVIRONMENT").ok(),
            enable_console: true,
            log_filter: std::env::var("RUST_LOG").ok().or_else(|| std::env::var("LOG_LEVEL").ok()),
        }
    }
}

/// Holds the OTLP tracer provider alive; dropping it flushes and shuts
/// down the exporter.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down tracer provider: {e:?}");
            }
        }
    }
}

/// Initialize the global `tracing` subscriber: always a console
/// (fmt) layer, plus an OTLP layer if `config.otlp_endpoint` is set.
/// Call once at process startup; keep the returned guard alive for the
/// process lifetime.
pub fn init_tracing(config: TelemetryConfig) -> TelemetryGuard {
    let mut resource_attrs = vec![KeyValue::new("service.name", config.service_name.clone())];
    if let Some(version) = &config.service_version {
        resource_attrs.push(KeyValue::new("service.version", version.clone()));
    }
    if let Some(env) = &config.environment {
        resource_attrs.push(KeyValue::new("deployment.environment", env.clone()));
    }
    let resource = Resource::new(resource_attrs);

    let filter = config.log_filter.as_ref().and_then(|f| EnvFilter::try_new(f).ok()).unwrap_or_else(|| EnvFilter::new("info"));

    let console_layer = config.enable_console.then(|| tracing_subscriber::fmt::layer().with_target(true).with_filter(filter));

    let (provider, otel_layer, otel_status) = match &config.otlp_endpoint {
        Some(endpoint) => match build_otlp_tracer(endpoint, resource) {
            Ok((provider, tracer)) => {
                let layer = tracing_opentelemetry::layer().with_tracer(tracer);
                (Some(provider), Some(layer), Some(Ok(endpoint.clone())))
            }
            Err(e) => (None, None, Some(Err(e.to_string()))),
        },
        None => (None, None, None),
    };

    tracing_subscriber::registry().with(console_layer).with(otel_layer).init();

    match otel_status {
        Some(Ok(endpoint)) => tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled"),
        Some(Err(e)) => tracing::warn!(error = %e, "failed to initialize OTLP tracer, continuing without it"),
        None => tracing::debug!("OpenTelemetry tracing disabled: OTEL_EXPORTER_OTLP_ENDPOINT not set"),
    }

    TelemetryGuard { provider }
}

fn build_otlp_tracer(endpoint: &str, resource: Resource) -> Result<(SdkTracerProvider, opentelemetry_sdk::trace::Tracer), opentelemetry::trace::TraceError> {
    use opentelemetry::trace::TracerProvider as _;

    let exporter = SpanExporter::builder().with_tonic().with_endpoint(endpoint).with_timeout(Duration::from_secs(10)).build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("taskforge");
    Ok((provider, tracer))
}
