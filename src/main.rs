use dotenvy::dotenv;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use transcoder::app;
use transcoder::config::AppConfig;
use transcoder::modules::transcode::service::TranscodeService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting transcoder...");

    let config = AppConfig::new()?;
    let state = app::build_state(config).await?;

    let health = TranscodeService::health(&state).await;
    info!(
        "🩺 Database: {}, queue: {} (depth {:?})",
        health.database, health.queue, health.queue_depth
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = app::spawn_workers(&state, shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, finishing in-flight jobs...");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Worker task ended abnormally: {}", e);
        }
    }

    info!("Transcoder stopped");
    Ok(())
}
