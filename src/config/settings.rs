use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::common::{PipelineError, Result};
use crate::config::env::{self, EnvKey};
use crate::modules::transcode::events::DEFAULT_QUEUE_NAME;
use crate::modules::transcode::presets::PresetTable;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    pub s3_endpoint: String,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub run_migrations: bool,
    pub worker: WorkerConfig,
    pub presets: PresetTable,
}

/// Knobs for the consumer loop, the orchestrator and the reaper.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub queue_name: String,
    pub pop_timeout: Duration,
    pub consumer_count: usize,
    pub encode_concurrency: usize,
    pub work_dir: PathBuf,
    pub ffmpeg_path: String,
    pub encode_timeout: Option<Duration>,
    pub diagnostic_tail_bytes: usize,
    pub heartbeat_interval: Duration,
    pub stale_job_after: Duration,
    pub reaper_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            pop_timeout: Duration::from_secs(5),
            consumer_count: 1,
            encode_concurrency: 1,
            work_dir: std::env::temp_dir(),
            ffmpeg_path: "ffmpeg".to_string(),
            encode_timeout: None,
            diagnostic_tail_bytes: 4000,
            heartbeat_interval: Duration::from_secs(30),
            stale_job_after: Duration::from_secs(1800),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    pub fn new() -> Result<Self> {
        let required = |key: EnvKey| {
            let name = key.as_str();
            env::get(key).map_err(|e| PipelineError::Config(format!("{}: {}", name, e)))
        };

        let presets = match env::get_opt(EnvKey::BitratePresets) {
            Some(spec) => PresetTable::default().with_overrides(&spec)?,
            None => PresetTable::default(),
        };

        Ok(Self {
            database_url: required(EnvKey::DatabaseUrl)?,
            redis_url: required(EnvKey::RedisUrl)?,
            s3_endpoint: env::get_or(EnvKey::S3Endpoint, "http://localhost:9000"),
            s3_bucket: env::get_or(EnvKey::S3Bucket, "media"),
            s3_region: env::get_or(EnvKey::S3Region, "us-east-1"),
            s3_access_key: env::get_or(EnvKey::S3AccessKey, "minioadmin"),
            s3_secret_key: env::get_or(EnvKey::S3SecretKey, "minioadmin"),
            run_migrations: env::get_parsed(EnvKey::RunMigrations, true),
            worker: WorkerConfig::from_env(),
            presets,
        })
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let encode_timeout_secs: u64 = env::get_parsed(EnvKey::EncodeTimeoutSecs, 0);

        Self {
            worker_id: env::get_opt(EnvKey::WorkerId).unwrap_or(defaults.worker_id),
            queue_name: env::get_or(EnvKey::QueueName, DEFAULT_QUEUE_NAME),
            pop_timeout: Duration::from_secs(env::get_parsed(EnvKey::QueuePopTimeoutSecs, 5)),
            consumer_count: env::get_parsed(EnvKey::ConsumerCount, 1usize).max(1),
            encode_concurrency: env::get_parsed(EnvKey::EncodeConcurrency, 1usize).max(1),
            work_dir: env::get_opt(EnvKey::WorkDir)
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            ffmpeg_path: env::get_or(EnvKey::FfmpegPath, "ffmpeg"),
            encode_timeout: (encode_timeout_secs > 0)
                .then(|| Duration::from_secs(encode_timeout_secs)),
            diagnostic_tail_bytes: env::get_parsed(EnvKey::DiagnosticTailBytes, 4000usize),
            heartbeat_interval: Duration::from_secs(
                env::get_parsed(EnvKey::HeartbeatIntervalSecs, 30u64).max(1),
            ),
            stale_job_after: Duration::from_secs(env::get_parsed(EnvKey::StaleJobAfterSecs, 1800)),
            reaper_interval: Duration::from_secs(
                env::get_parsed(EnvKey::ReaperIntervalSecs, 60u64).max(1),
            ),
        }
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8])
}
