use registration_server::config::AppConfig;
use registration_server::routes;
use registration_server::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .init();

    tracing::info!("Starting registration server on port {}", config.port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let state = Arc::new(AppState::new(config.clone())?);

    match state.settings.ensure_initialized().await {
        Ok(true) => tracing::info!(path = %config.settings_file.display(), "Settings file created"),
        Ok(false) => {}
        Err(e) => tracing::warn!("Failed to initialize settings: {}", e),
    }

    if let Err(e) = state.backup.prepare_remote_layout().await {
        tracing::warn!("Failed to prepare remote storage: {}", e);
    }

    // Warm the participant cache
    let count = state.participants.list(true).await.len();
    tracing::info!(count, "Participants loaded");

    // Start backup scheduler
    let cancel = CancellationToken::new();
    let scheduler = state
        .scheduler
        .clone()
        .start(config.backup_on_startup, cancel.clone());

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel.clone()))
    .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();
    if let Err(e) = scheduler.await {
        tracing::warn!("Scheduler task ended abnormally: {}", e);
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
