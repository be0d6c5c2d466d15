use std::env;
use std::str::FromStr;

pub enum EnvKey {
    DatabaseUrl,
    RedisUrl,
    S3Endpoint,
    S3Bucket,
    S3Region,
    S3AccessKey,
    S3SecretKey,
    QueueName,
    QueuePopTimeoutSecs,
    ConsumerCount,
    EncodeConcurrency,
    WorkDir,
    FfmpegPath,
    EncodeTimeoutSecs,
    DiagnosticTailBytes,
    HeartbeatIntervalSecs,
    StaleJobAfterSecs,
    ReaperIntervalSecs,
    BitratePresets,
    RunMigrations,
    WorkerId,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::RedisUrl => "REDIS_URL",
            EnvKey::S3Endpoint => "S3_ENDPOINT",
            EnvKey::S3Bucket => "S3_BUCKET",
            EnvKey::S3Region => "S3_REGION",
            EnvKey::S3AccessKey => "S3_ACCESS_KEY",
            EnvKey::S3SecretKey => "S3_SECRET_KEY",
            EnvKey::QueueName => "QUEUE_NAME",
            EnvKey::QueuePopTimeoutSecs => "QUEUE_POP_TIMEOUT_SECS",
            EnvKey::ConsumerCount => "CONSUMER_COUNT",
            EnvKey::EncodeConcurrency => "ENCODE_CONCURRENCY",
            EnvKey::WorkDir => "WORK_DIR",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::EncodeTimeoutSecs => "ENCODE_TIMEOUT_SECS",
            EnvKey::DiagnosticTailBytes => "DIAGNOSTIC_TAIL_BYTES",
            EnvKey::HeartbeatIntervalSecs => "HEARTBEAT_INTERVAL_SECS",
            EnvKey::StaleJobAfterSecs => "STALE_JOB_AFTER_SECS",
            EnvKey::ReaperIntervalSecs => "REAPER_INTERVAL_SECS",
            EnvKey::BitratePresets => "BITRATE_PRESETS",
            EnvKey::RunMigrations => "RUN_MIGRATIONS",
            EnvKey::WorkerId => "WORKER_ID",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

pub fn get_opt(key: EnvKey) -> Option<String> {
    get(key).ok().filter(|v| !v.trim().is_empty())
}
