use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::common::Result;
use crate::config::settings::AppConfig;
use crate::infrastructure::db::pool::{connect_to_db, run_migrations};
use crate::infrastructure::queue::RedisJobQueue;
use crate::infrastructure::redis::client::RedisService;
use crate::infrastructure::storage::StorageService;
use crate::modules::transcode::encoder::FfmpegEncoder;
use crate::modules::transcode::repository::PgJobStore;
use crate::state::AppState;
use crate::workers::reaper::run_reaper;
use crate::workers::transcoder::TranscodeConsumer;

/// Connects every external collaborator and assembles the application context.
pub async fn build_state(config: AppConfig) -> Result<AppState> {
    let pool = connect_to_db(&config.database_url).await?;
    if config.run_migrations {
        run_migrations(&pool).await?;
    }

    let redis = RedisService::new(&config.redis_url).await?;
    let storage = StorageService::new(
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_bucket,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .await;

    let encoder = FfmpegEncoder::locate(&config.worker.ffmpeg_path)?
        .with_timeout(config.worker.encode_timeout)
        .with_tail_bytes(config.worker.diagnostic_tail_bytes);

    let store = PgJobStore::new(pool, config.presets.clone());
    let queue = RedisJobQueue::new(redis, config.worker.queue_name.clone());
    info!(
        "🧩 {} consumer(s) on '{}', encode concurrency {}",
        config.worker.consumer_count, config.worker.queue_name, config.worker.encode_concurrency
    );

    Ok(AppState::new(
        config,
        Arc::new(store),
        Arc::new(queue),
        Arc::new(storage),
        Arc::new(encoder),
    ))
}

/// Starts the configured number of consumers plus one reaper.
pub fn spawn_workers(state: &AppState, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let worker = &state.config.worker;
    let mut handles = Vec::with_capacity(worker.consumer_count + 1);

    for n in 0..worker.consumer_count {
        let id = if worker.consumer_count == 1 {
            worker.worker_id.clone()
        } else {
            format!("{}-{}", worker.worker_id, n)
        };
        let consumer = TranscodeConsumer::new(state, id);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { consumer.run(shutdown).await }));
    }

    handles.push(tokio::spawn(run_reaper(
        state.store.clone(),
        worker.reaper_interval,
        worker.stale_job_after,
        shutdown,
    )));

    handles
}
