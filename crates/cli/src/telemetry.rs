//! Subscriber setup: env filter, JSON logs on stderr, optional OTLP export.

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::TelemetrySettings;

pub struct TelemetryBuilder {
    service_name: String,
    service_version: String,
    log_level: String,
    otlp_endpoint: Option<String>,
}

/// Flushes exported spans when dropped.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryBuilder {
    pub fn new(service_name: impl Into<String>, service_version: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
        }
    }

    pub fn from_settings(settings: &TelemetrySettings) -> Self {
        let builder = Self::new(settings.service_name.as_str(), env!("CARGO_PKG_VERSION"))
            .with_log_level(settings.log_level.as_str());
        match settings.otlp_endpoint.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => builder.with_tracing(endpoint),
            _ => builder,
        }
    }

    #[must_use]
    pub fn with_tracing(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Installs the global subscriber. `RUST_LOG` wins over the configured
    /// level.
    pub fn init(self) -> Result<TelemetryGuard> {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level));
        let fmt_layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::CLOSE)
            .boxed();
        let registry = Registry::default().with(env_filter).with(fmt_layer);

        let Some(endpoint) = self.otlp_endpoint else {
            registry.try_init().context("Failed to init subscriber")?;
            return Ok(TelemetryGuard { provider: None });
        };

        let resource = Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes([KeyValue::new("service.version", self.service_version.clone())])
            .build();

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .context("Failed to build OTLP span exporter")?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build();
        opentelemetry::global::set_tracer_provider(provider.clone());

        let tracer = provider.tracer("branchfleet");
        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()
            .context("Failed to init subscriber")?;

        Ok(TelemetryGuard {
            provider: Some(provider),
        })
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush traces: {e}");
            }
        }
    }
}
