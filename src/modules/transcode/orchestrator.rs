use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::encoder::{EncodeRequest, Encoder};
use super::manifest::{self, build_master_manifest};
use super::model::{Job, RenditionStatus};
use super::presets::PresetTable;
use super::repository::JobStore;
use crate::common::{PipelineError, Result, content_type};
use crate::infrastructure::storage::ObjectStorage;

/// What one orchestration run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationReport {
    pub job_id: Uuid,
    pub ready: Vec<i32>,
    pub failed: Vec<i32>,
    pub manifest_key: Option<String>,
}

/// Turns one claimed job into uploaded HLS renditions plus a master manifest.
///
/// The orchestrator owns rendition rows; the caller owns the job row and
/// decides its final status from the returned `Result`.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    storage: Arc<dyn ObjectStorage>,
    encoder: Arc<dyn Encoder>,
    presets: PresetTable,
    work_root: PathBuf,
    encode_concurrency: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        storage: Arc<dyn ObjectStorage>,
        encoder: Arc<dyn Encoder>,
        presets: PresetTable,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            storage,
            encoder,
            presets,
            work_root: work_root.into(),
            encode_concurrency: 1,
        }
    }

    pub fn with_encode_concurrency(mut self, n: usize) -> Self {
        self.encode_concurrency = n.max(1);
        self
    }

    pub async fn run(&self, job: &Job) -> Result<OrchestrationReport> {
        let video = self.store.get_video(job.video_id).await?;
        let heights = job.unique_heights();

        tokio::fs::create_dir_all(&self.work_root).await?;
        // Removed on drop, whichever way this function returns.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("hls_{}_", video.id))
            .tempdir_in(&self.work_root)?;
        debug!("📁 Scratch directory {}", scratch.path().display());

        let source = self.fetch_source(&video.source_key, &scratch).await?;

        for &height in &heights {
            self.store.upsert_rendition_queued(video.id, height).await?;
        }
        for &height in &heights {
            if let Err(e) = self.store.start_rendition(video.id, height, job.id).await {
                self.fail_leftover_renditions(job).await;
                return Err(e);
            }
        }

        let video_id = video.id;
        let total = heights.len();
        let settled = AtomicUsize::new(0);
        let out_root = scratch.path().join("out");

        let outcomes: Vec<(i32, Result<bool>)> = stream::iter(heights.iter().copied())
            .map(|height| {
                let source = &source;
                let out_root = &out_root;
                let settled = &settled;
                async move {
                    let outcome = self
                        .render(job.id, video_id, source, out_root, height)
                        .await;
                    let done = settled.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(job_id = %job.id, "📊 Progress {}/{} renditions", done, total);
                    (height, outcome)
                }
            })
            .buffer_unordered(self.encode_concurrency)
            .collect()
            .await;

        let mut ready = Vec::new();
        let mut failed = Vec::new();
        let mut first_error = None;
        for (height, outcome) in outcomes {
            match outcome {
                Ok(true) => ready.push(height),
                Ok(false) => failed.push(height),
                Err(e) => {
                    failed.push(height);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            self.fail_leftover_renditions(job).await;
            return Err(e);
        }
        ready.sort_unstable();
        failed.sort_unstable();

        let manifest_key = if ready.is_empty() {
            warn!(job_id = %job.id, video_id = %video.id, "⚠️ No rendition succeeded, skipping master manifest");
            None
        } else {
            let key = manifest::master_manifest_key(video.id);
            let body = build_master_manifest(&ready, &self.presets);
            self.storage
                .put_object(&key, Bytes::from(body), content_type::HLS_PLAYLIST)
                .await?;
            info!(job_id = %job.id, "📜 Master manifest uploaded: {}", key);
            Some(key)
        };

        drop(scratch);

        Ok(OrchestrationReport {
            job_id: job.id,
            ready,
            failed,
            manifest_key,
        })
    }

    async fn fetch_source(&self, key: &str, scratch: &TempDir) -> Result<PathBuf> {
        let ext = Path::new(key)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let dest = scratch.path().join(format!("source.{}", ext));

        info!("⬇️ Downloading source from storage: {}", key);
        let size = self
            .storage
            .download_to(key, &dest)
            .await
            .map_err(|e| match e {
                PipelineError::StorageRead { key, message } => {
                    PipelineError::SourceUnavailable { key, message }
                }
                other => other,
            })?;
        info!("⬇️ Downloaded {} bytes", size);
        Ok(dest)
    }

    /// Encodes, uploads and settles one rendition. `Ok(false)` is a failed
    /// rendition; `Err` only comes from the store.
    async fn render(
        &self,
        job_id: Uuid,
        video_id: Uuid,
        source: &Path,
        out_root: &Path,
        height: i32,
    ) -> Result<bool> {
        let output_dir = out_root.join(height.to_string());
        let request = EncodeRequest {
            source: source.to_path_buf(),
            output_dir: output_dir.clone(),
            height,
            preset: self.presets.get(height),
        };

        let encoded = match tokio::fs::create_dir_all(&output_dir).await {
            Ok(()) => self.encoder.encode(&request).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = encoded {
            if let PipelineError::EncodeFailure { diagnostics, .. } = &e {
                warn!(%job_id, height, "❌ Encode failed: {}\n{}", e, diagnostics);
            } else {
                warn!(%job_id, height, "❌ Encode failed: {}", e);
            }
            self.settle(job_id, video_id, height, RenditionStatus::Failed, None)
                .await?;
            return Ok(false);
        }

        let output_key = manifest::rendition_manifest_key(video_id, height);
        if let Err(e) = self.upload_rendition(video_id, height, &output_dir).await {
            error!(%job_id, height, "❌ Upload failed: {}", e);
            self.settle(job_id, video_id, height, RenditionStatus::Failed, None)
                .await?;
            return Ok(false);
        }

        self.settle(job_id, video_id, height, RenditionStatus::Ready, Some(&output_key))
            .await?;
        info!(%job_id, height, "✅ Rendition ready: {}", output_key);
        Ok(true)
    }

    /// Records this job's outcome unless a later job has taken the row over.
    async fn settle(
        &self,
        job_id: Uuid,
        video_id: Uuid,
        height: i32,
        next: RenditionStatus,
        output_key: Option<&str>,
    ) -> Result<()> {
        let settled = self
            .store
            .settle_rendition(video_id, height, job_id, next, output_key)
            .await?;
        if settled.is_none() {
            info!(%job_id, height, "↪️ Rendition taken over by a later job, leaving it as is");
        }
        Ok(())
    }

    /// Segments first, then the sub-manifest that references them.
    async fn upload_rendition(&self, video_id: Uuid, height: i32, dir: &Path) -> Result<()> {
        let manifest_name = manifest::rendition_manifest_name(height);
        let prefix = manifest::hls_prefix(video_id);

        let mut segments = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != manifest_name {
                segments.push(name);
            }
        }
        segments.sort();

        for name in &segments {
            let key = format!("{}/{}", prefix, name);
            self.storage.upload_file(&key, &dir.join(name)).await?;
        }
        let key = format!("{}/{}", prefix, manifest_name);
        self.storage
            .upload_file(&key, &dir.join(&manifest_name))
            .await?;

        debug!(%video_id, height, "⬆️ Uploaded {} segments", segments.len());
        Ok(())
    }

    /// Best effort: nothing this job started may stay `running`.
    async fn fail_leftover_renditions(&self, job: &Job) {
        let summary = match self.store.read_job_summary(job.id).await {
            Ok(summary) => summary,
            Err(e) => {
                error!(job_id = %job.id, "Failed to read renditions for cleanup: {}", e);
                return;
            }
        };

        for rendition in summary.renditions {
            if rendition.status == RenditionStatus::Running && rendition.job_id == Some(job.id) {
                if let Err(e) = self
                    .store
                    .settle_rendition(
                        rendition.video_id,
                        rendition.height,
                        job.id,
                        RenditionStatus::Failed,
                        None,
                    )
                    .await
                {
                    error!(job_id = %job.id, height = rendition.height, "Failed to settle rendition: {}", e);
                }
            }
        }
    }
}
