//! Fakes shared by the orchestrator and consumer tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Barrier, Mutex};
use uuid::Uuid;

use super::encoder::{EncodeOutput, EncodeRequest, Encoder};
use super::manifest::rendition_manifest_name;
use super::memory_store::MemoryJobStore;
use super::model::Video;
use super::presets::PresetTable;
use super::repository::JobStore;
use crate::common::{PipelineError, Result};
use crate::config::{AppConfig, WorkerConfig};
use crate::infrastructure::queue::JobQueue;
use crate::infrastructure::storage::{MemoryStorage, ObjectStorage};
use crate::state::AppState;

/// Writes a two-segment playlist per request, or fails for the configured
/// heights. With a gate, every encode waits on the barrier first.
#[derive(Default)]
pub struct ScriptedEncoder {
    failing: HashSet<i32>,
    calls: Mutex<Vec<i32>>,
    gate: Option<Arc<Barrier>>,
}

impl ScriptedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(heights: &[i32]) -> Self {
        Self {
            failing: heights.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn gated(barrier: Arc<Barrier>) -> Self {
        Self {
            gate: Some(barrier),
            ..Self::default()
        }
    }

    pub async fn calls(&self) -> Vec<i32> {
        let mut calls = self.calls.lock().await.clone();
        calls.sort();
        calls
    }
}

#[async_trait]
impl Encoder for ScriptedEncoder {
    async fn encode(&self, request: &EncodeRequest) -> Result<EncodeOutput> {
        self.calls.lock().await.push(request.height);
        if let Some(gate) = &self.gate {
            gate.wait().await;
        }
        if self.failing.contains(&request.height) {
            return Err(PipelineError::EncodeFailure {
                height: request.height,
                reason: "exit status: 1".into(),
                diagnostics: "Conversion failed!".into(),
            });
        }

        let h = request.height;
        let mut playlist = String::from("#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n");
        for n in 0..2 {
            let segment = format!("{}_{:03}.ts", h, n);
            tokio::fs::write(request.output_dir.join(&segment), b"ts").await?;
            playlist.push_str(&format!("#EXTINF:4.0,\n{}\n", segment));
        }
        playlist.push_str("#EXT-X-ENDLIST\n");
        tokio::fs::write(request.output_dir.join(rendition_manifest_name(h)), playlist).await?;

        Ok(EncodeOutput {
            height: h,
            manifest: request.manifest_path(),
            elapsed: Duration::from_millis(1),
            diagnostics: String::new(),
        })
    }
}

pub struct Fixture {
    pub store: Arc<MemoryJobStore>,
    pub storage: Arc<MemoryStorage>,
    pub video: Video,
}

/// A store and object storage holding one uploaded 15 s source.
pub async fn fixture() -> Fixture {
    let store = Arc::new(MemoryJobStore::new(PresetTable::default()));
    let storage = Arc::new(MemoryStorage::new());

    let id = Uuid::new_v4();
    let source_key = format!("source/{}.mp4", id);
    storage
        .put_object(&source_key, Bytes::from_static(b"fake mp4"), "video/mp4")
        .await
        .unwrap();
    let video = store.create_video(id, &source_key, Some(15)).await.unwrap();

    Fixture {
        store,
        storage,
        video,
    }
}

/// Application context over the fixture's fakes. Connection settings are
/// placeholders; nothing dials them.
pub fn app_state(fx: &Fixture, queue: Arc<dyn JobQueue>, encoder: Arc<dyn Encoder>) -> AppState {
    let config = AppConfig {
        database_url: "postgres://unused".into(),
        redis_url: "redis://unused".into(),
        s3_endpoint: "http://unused".into(),
        s3_bucket: "media".into(),
        s3_region: "us-east-1".into(),
        s3_access_key: "test".into(),
        s3_secret_key: "test".into(),
        run_migrations: false,
        worker: WorkerConfig::default(),
        presets: PresetTable::default(),
    };
    AppState::new(config, fx.store.clone(), queue, fx.storage.clone(), encoder)
}
