// Main entry point for the UNet segmentation gateway

use unet_workflow::{
    api::{self, AppState, DATASET_UPLOAD_PATH, PREDICT_PATH},
    core::Config,
    services::{LazyModel, LocalStorage, Storage},
};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let level = match config.log_level() {
        tracing::Level::TRACE => "trace",
        tracing::Level::DEBUG => "debug",
        tracing::Level::INFO => "info",
        tracing::Level::WARN => "warn",
        tracing::Level::ERROR => "error",
    };
    let filter = EnvFilter::new(format!(
        "unet_workflow={level},tower_http={level},ort=off"
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== UNET SEGMENTATION GATEWAY ===");
    info!(
        "Config: model={} backend={} mask_classes={} media_root={} max_upload={}MB",
        config.model.model_path,
        config.model.inference_backend.as_deref().unwrap_or("auto"),
        config.model.mask_values.len(),
        config.media_root().display(),
        config.limits.max_upload_mb
    );

    tokio::fs::create_dir_all(config.media_root())
        .await
        .with_context(|| format!("Failed to create media root {}", config.media_root().display()))?;

    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(
        config.media_root(),
        config.storage.media_url.clone(),
    ));

    // Loaded on the first prediction
    let model = Arc::new(LazyModel::from_config(config.model.clone()));

    let state = AppState::new(Arc::clone(&config), storage, model);
    let app = api::router(state);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /                    - Root endpoint");
    info!("  GET  /health              - Health check");
    info!("  GET  /metrics             - Prometheus metrics");
    info!("  GET  /stats               - Detailed statistics");
    info!("  POST {}   - Segment image, archive or dataset file", PREDICT_PATH);
    info!("  POST {}       - Upload dataset file", DATASET_UPLOAD_PATH);
    info!("  GET  {}*              - Stored files", config.storage.media_url);
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
