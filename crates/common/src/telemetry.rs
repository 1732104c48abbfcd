use crate::Environment;
use crate::config::env_parse;
use crate::logging::{BoxedLayer, env_filter, fmt_layer, setup_logging};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::attribute::{SERVICE_NAME, SERVICE_VERSION};
use std::time::Duration;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

const DEPLOYMENT_ENVIRONMENT: &str = "deployment.environment";

/// OTLP trace and metric export for one service. Providers are flushed and
/// shut down when the guard is dropped, so keep it alive in `main`.
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl TelemetryGuard {
    /// Install OTLP/gRPC exporters towards `endpoint` and the global
    /// `tracing` subscriber bridged to them.
    ///
    /// `OTEL_TRACES_SAMPLER_RATIO` (default 1.0) sets the share of root traces
    /// kept; `OTEL_METRIC_EXPORT_INTERVAL_SECS` (default 10) the metric push
    /// period.
    pub fn init(
        service_name: &str,
        endpoint: &str,
        environment: Environment,
    ) -> anyhow::Result<Self> {
        global::set_text_map_propagator(TraceContextPropagator::new());
        let resource = service_resource(service_name, environment);

        let span_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;
        let ratio = env_parse("OTEL_TRACES_SAMPLER_RATIO", 1.0f64).clamp(0.0, 1.0);
        let tracer_provider = SdkTracerProvider::builder()
            .with_resource(resource.clone())
            .with_sampler(Sampler::ParentBased(Box::new(
                Sampler::TraceIdRatioBased(ratio),
            )))
            .with_batch_exporter(span_exporter)
            .build();
        global::set_tracer_provider(tracer_provider.clone());

        let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;
        let interval = env_parse("OTEL_METRIC_EXPORT_INTERVAL_SECS", 10u64).max(1);
        let meter_provider = SdkMeterProvider::builder()
            .with_resource(resource)
            .with_reader(
                PeriodicReader::builder(metric_exporter)
                    .with_interval(Duration::from_secs(interval))
                    .build(),
            )
            .build();
        global::set_meter_provider(meter_provider.clone());

        let otel_layer: BoxedLayer = tracing_opentelemetry::layer()
            .with_tracer(global::tracer(service_name.to_string()))
            .boxed();
        tracing_subscriber::registry()
            .with(vec![otel_layer, fmt_layer(environment)])
            .with(env_filter())
            .init();

        tracing::info!(service = service_name, endpoint, ratio, "Telemetry export enabled");
        Ok(Self {
            tracer_provider,
            meter_provider,
        })
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(e) = self.tracer_provider.shutdown() {
            eprintln!("Failed to shutdown tracer provider: {:?}", e);
        }
        if let Err(e) = self.meter_provider.shutdown() {
            eprintln!("Failed to shutdown meter provider: {:?}", e);
        }
    }
}

fn service_resource(service_name: &str, environment: Environment) -> Resource {
    Resource::builder()
        .with_attributes([
            KeyValue::new(SERVICE_NAME, service_name.to_string()),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new(DEPLOYMENT_ENVIRONMENT, environment.as_str()),
        ])
        .build()
}

/// Export telemetry when an OTLP endpoint is configured, otherwise only log.
///
/// Either way exactly one global subscriber is installed.
pub fn init_observability(
    service_name: &str,
    otel_endpoint: Option<&str>,
    environment: Environment,
) -> anyhow::Result<Option<TelemetryGuard>> {
    match otel_endpoint {
        Some(endpoint) => TelemetryGuard::init(service_name, endpoint, environment).map(Some),
        None => {
            setup_logging(environment);
            Ok(None)
        }
    }
}

/// Creates an info-level span and enters it.
#[macro_export]
macro_rules! span {
    ($name:literal) => {
        tracing::info_span!($name).entered()
    };
}
