use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use examsathi::{
    api,
    artifact::{ArtifactStore, DriveFetcher},
    config::ServerConfig,
    inference::PhiLoader,
    state::{AppState, ModelSlot},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().context("invalid server configuration")?;
    info!(
        model_path = %config.model_path().display(),
        file_id = config.model_file_id.as_deref().unwrap_or("NOT SET"),
        "starting ExamSathi AI server"
    );

    // -----------------------------
    // Shared state
    // -----------------------------
    let fetcher = Arc::new(DriveFetcher::new(config.drive_url.clone())?);
    let store = ArtifactStore::new(
        config.model_dir.clone(),
        config.model_name.clone(),
        config.model_file_id.clone(),
        fetcher,
    );
    let loader = Arc::new(PhiLoader::new(config.device.clone(), config.generation_seed));
    let state = AppState::new(ModelSlot::new(store, loader), config.max_new_tokens);

    // Requests arriving mid-load queue on the slot.
    if config.model_file_id.is_some() {
        info!("loading model on startup");
        let slot = state.slot.clone();
        tokio::spawn(async move {
            if let Err(err) = slot.ensure_loaded().await {
                warn!(%err, "startup load failed; will retry on first request");
            }
        });
    } else {
        warn!("MODEL_FILE_ID not set; model will load on first request");
    }

    let app = api::router(state);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "HTTP listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
