use crate::config::Environment;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

pub(crate) type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// `RUST_LOG` filter, defaulting to `info`.
pub(crate) fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Pretty output for development, JSON lines for production.
pub(crate) fn fmt_layer(environment: Environment) -> BoxedLayer {
    match environment {
        Environment::Production => tracing_subscriber::fmt::layer()
            .json()
            .with_level(true)
            .with_current_span(true)
            .boxed(),
        Environment::Development => tracing_subscriber::fmt::layer()
            .pretty()
            .with_ansi(true)
            .boxed(),
    }
}

/// Initialize tracing subscriber with pretty formatting for development
/// and JSON formatting for production.
///
/// Uses RUST_LOG environment variable for filtering (defaults to "info" if not set).
///
/// Also adds an OpenTelemetry layer so spans reach a global tracer provider if one
/// is installed later. Services exporting telemetry use
/// [`TelemetryGuard::init`](crate::telemetry::TelemetryGuard::init) instead, which
/// installs the subscriber itself.
pub fn setup_logging(environment: Environment) {
    let otel_layer: BoxedLayer = tracing_opentelemetry::layer().boxed();

    tracing_subscriber::registry()
        .with(vec![otel_layer, fmt_layer(environment)])
        .with(env_filter())
        .init();
}
