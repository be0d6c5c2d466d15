use std::sync::Arc;

use crate::config::settings::AppConfig;
use crate::infrastructure::queue::JobQueue;
use crate::infrastructure::storage::ObjectStorage;
use crate::modules::transcode::encoder::Encoder;
use crate::modules::transcode::orchestrator::Orchestrator;
use crate::modules::transcode::repository::JobStore;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub storage: Arc<dyn ObjectStorage>,
    pub encoder: Arc<dyn Encoder>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        storage: Arc<dyn ObjectStorage>,
        encoder: Arc<dyn Encoder>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            storage,
            encoder,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.storage.clone(),
            self.encoder.clone(),
            self.config.presets.clone(),
            self.config.worker.work_dir.clone(),
        )
        .with_encode_concurrency(self.config.worker.encode_concurrency)
    }
}
