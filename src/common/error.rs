use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Every failure the pipeline can surface.
///
/// The first six variants are the domain taxonomy; the rest wrap the
/// infrastructure clients so `?` works across layers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },

    #[error("source unavailable for {key}: {message}")]
    SourceUnavailable { key: String, message: String },

    #[error("encode failed for {height}p: {reason}")]
    EncodeFailure {
        height: i32,
        reason: String,
        diagnostics: String,
    },

    #[error("undecodable queue payload: {0}")]
    TransportDecode(String),

    #[error("storage write failed for {key}: {message}")]
    StorageWrite { key: String, message: String },

    #[error("storage read failed for {key}: {message}")]
    StorageRead { key: String, message: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("queue error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn storage_write(key: impl Into<String>, message: impl ToString) -> Self {
        Self::StorageWrite {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn storage_read(key: impl Into<String>, message: impl ToString) -> Self {
        Self::StorageRead {
            key: key.into(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PipelineError::NotFound { .. })
    }

    /// Infrastructure hiccups where the same work can be attempted again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Database(_) | PipelineError::Queue(_) | PipelineError::Io(_)
        )
    }
}
