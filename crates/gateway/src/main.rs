use common::{init_observability, wait_for_resource_async};
use dispatcher::{Dispatcher, RemoteDetector};
use gateway::{AppState, BackendMode, GatewayConfig, LocalStore, router};
use inference::DetectionEngine;
use overlay::Compositor;
use std::sync::Arc;
use tokio::net::TcpListener;

#[cfg(not(any(feature = "ort-backend", feature = "stub-backend")))]
compile_error!("At least one backend feature must be enabled: 'ort-backend' or 'stub-backend'");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();

    let _telemetry = init_observability(
        "gateway",
        config.otel_endpoint.as_deref(),
        config.environment,
    )?;

    tracing::info!(
        config = ?config,
        "Loaded configuration"
    );

    let dispatcher = Arc::new(start_dispatcher(&config).await?);
    let store = Arc::new(LocalStore::open(&config.upload_dir)?);
    let state = AppState::new(Arc::clone(&dispatcher), store)
        .with_max_upload_bytes(config.max_message_bytes);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Gateway listening on {}", config.bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.shutdown().await;
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn start_dispatcher(config: &GatewayConfig) -> anyhow::Result<Dispatcher> {
    tracing::info!(mode = config.mode.as_str(), "Starting dispatcher");
    match config.mode {
        BackendMode::Remote => {
            let detector = RemoteDetector::new(config.backend_addr.as_str())?
                .with_max_message_bytes(config.max_message_bytes);
            wait_for_resource_async(
                || detector.connect(),
                config.backend_poll_interval_ms,
                "detection backend",
            )
            .await;
            Ok(Dispatcher::start(detector, config.dispatcher.clone()))
        }
        BackendMode::Local => {
            let compositor = Compositor::default().with_alpha(config.overlay_alpha);
            let engine =
                DetectionEngine::load::<inference::DefaultBackend>(&config.model, compositor)?;
            Ok(Dispatcher::start(engine, config.dispatcher.clone()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
