use common::init_observability;
use inference::{DetectionEngine, InferenceConfig, InferenceServer};
use overlay::Compositor;
use tokio::net::TcpListener;

#[cfg(not(any(feature = "ort-backend", feature = "stub-backend")))]
compile_error!("At least one backend feature must be enabled: 'ort-backend' or 'stub-backend'");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = InferenceConfig::from_env();

    let _telemetry = init_observability(
        "inference",
        config.otel_endpoint.as_deref(),
        config.environment,
    )?;

    tracing::info!(
        config = ?config,
        "Loaded configuration"
    );

    let compositor = Compositor::default().with_alpha(config.overlay_alpha);
    let engine = DetectionEngine::load::<inference::DefaultBackend>(&config.model, compositor)?;

    let listener = TcpListener::bind(&config.bind_addr).await?;
    InferenceServer::new(engine, config.max_message_bytes)
        .serve(listener, shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
