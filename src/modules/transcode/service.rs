use std::path::Path;

use bytes::Bytes;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::dto::{HealthResponse, RegisterVideoRequest, SubmitJobRequest};
use super::events::{DEFAULT_PROFILES, TranscodeJob};
use super::model::{Job, JobSummary, Video, VideoSummary};
use crate::common::{PipelineError, Result};
use crate::state::AppState;

const MAX_RECENT_VIDEOS: i64 = 100;

/// Submission and read paths used by whatever fronts the pipeline.
pub struct TranscodeService;

impl TranscodeService {
    /// Stores the source bytes under `source/{id}.{ext}` and records the video.
    pub async fn register_video(
        state: &AppState,
        req: RegisterVideoRequest,
        body: Bytes,
    ) -> Result<Video> {
        if body.is_empty() {
            return Err(PipelineError::InvalidInput("source file is empty".into()));
        }

        let ext = Path::new(&req.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| "mp4".to_string());
        let id = Uuid::new_v4();
        let source_key = format!("source/{}.{}", id, ext);
        let content_type = mime_guess::from_path(&req.file_name)
            .first_or_octet_stream()
            .to_string();

        info!("⬆️ Uploading source {} ({} bytes)", source_key, body.len());
        state
            .storage
            .put_object(&source_key, body, &content_type)
            .await?;

        let video = state
            .store
            .create_video(id, &source_key, req.duration_s)
            .await?;
        info!(video_id = %video.id, "🎬 Video registered");
        Ok(video)
    }

    /// Creates a `queued` job and pushes its descriptor. If the push fails the
    /// job row stays `queued` and the error is returned.
    pub async fn submit_job(state: &AppState, req: SubmitJobRequest) -> Result<Job> {
        let heights = match req.profiles {
            Some(p) if !p.is_empty() => p,
            _ => DEFAULT_PROFILES.to_vec(),
        };

        let job = state.store.create_job(req.video_id, &heights).await?;

        let descriptor = TranscodeJob {
            job_id: job.id,
            video_id: job.video_id,
            profiles: job.heights.clone(),
        };
        if let Err(e) = state.queue.push(&descriptor.encode()?).await {
            error!(job_id = %job.id, "❌ Failed to enqueue job: {}", e);
            return Err(e);
        }

        info!(job_id = %job.id, video_id = %job.video_id, "📨 Job enqueued on '{}'", state.queue.name());
        Ok(job)
    }

    pub async fn job_summary(state: &AppState, job_id: Uuid) -> Result<JobSummary> {
        state.store.read_job_summary(job_id).await
    }

    pub async fn video_summary(state: &AppState, video_id: Uuid) -> Result<VideoSummary> {
        state.store.read_video_summary(video_id).await
    }

    pub async fn recent_videos(state: &AppState, limit: i64) -> Result<Vec<Video>> {
        state
            .store
            .list_recent_videos(limit.clamp(1, MAX_RECENT_VIDEOS))
            .await
    }

    pub async fn health(state: &AppState) -> HealthResponse {
        let database = match state.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Database health check failed: {}", e);
                false
            }
        };
        let queue_depth = match state.queue.len().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                warn!("Queue health check failed: {}", e);
                None
            }
        };
        let queue = queue_depth.is_some();

        HealthResponse {
            ok: database && queue,
            database,
            queue,
            queue_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::infrastructure::queue::{JobQueue, MemoryJobQueue};
    use crate::modules::transcode::model::JobStatus;
    use crate::modules::transcode::repository::JobStore;
    use crate::modules::transcode::testing::{ScriptedEncoder, app_state, fixture};

    #[tokio::test]
    async fn register_video_stores_the_source() {
        let fx = fixture().await;
        let queue = Arc::new(MemoryJobQueue::new("jobs:test"));
        let state = app_state(&fx, queue, Arc::new(ScriptedEncoder::new()));

        let video = TranscodeService::register_video(
            &state,
            RegisterVideoRequest {
                file_name: "Holiday.MOV".into(),
                duration_s: Some(42),
            },
            Bytes::from_static(b"mov"),
        )
        .await
        .unwrap();

        assert_eq!(video.source_key, format!("source/{}.mov", video.id));
        let stored = fx.storage.object(&video.source_key).await.unwrap();
        assert_eq!(stored.content_type, "video/quicktime");
        assert_eq!(fx.store.get_video(video.id).await.unwrap(), video);
    }

    #[tokio::test]
    async fn submit_job_defaults_profiles_and_enqueues() {
        let fx = fixture().await;
        let queue = Arc::new(MemoryJobQueue::new("jobs:test"));
        let state = app_state(&fx, queue.clone(), Arc::new(ScriptedEncoder::new()));

        let job = TranscodeService::submit_job(
            &state,
            SubmitJobRequest {
                video_id: fx.video.id,
                profiles: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.heights, vec![240, 480, 720]);

        let payload = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        let descriptor = TranscodeJob::decode(&payload).unwrap();
        assert_eq!(descriptor.job_id, job.id);
        assert_eq!(descriptor.profiles, vec![240, 480, 720]);
    }

    #[tokio::test]
    async fn submit_job_for_unknown_video_enqueues_nothing() {
        let fx = fixture().await;
        let queue = Arc::new(MemoryJobQueue::new("jobs:test"));
        let state = app_state(&fx, queue.clone(), Arc::new(ScriptedEncoder::new()));

        let err = TranscodeService::submit_job(
            &state,
            SubmitJobRequest {
                video_id: Uuid::new_v4(),
                profiles: Some(vec![480]),
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn health_reports_both_dependencies() {
        let fx = fixture().await;
        let queue = Arc::new(MemoryJobQueue::new("jobs:test"));
        let state = app_state(&fx, queue, Arc::new(ScriptedEncoder::new()));

        let health = TranscodeService::health(&state).await;
        assert_eq!(
            health,
            HealthResponse {
                ok: true,
                database: true,
                queue: true,
                queue_depth: Some(0),
            }
        );
    }
}
