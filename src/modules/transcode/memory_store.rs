use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{
    Job, JobKind, JobStatus, JobSummary, Rendition, RenditionStatus, Video, VideoSummary,
};
use super::presets::PresetTable;
use super::repository::{
    JobStore, check_job_transition, check_rendition_transition, rendition_not_found,
    stored_output_key, validate_heights,
};
use crate::common::{PipelineError, Result};

#[derive(Default)]
struct Inner {
    videos: HashMap<Uuid, Video>,
    jobs: HashMap<Uuid, Job>,
    renditions: HashMap<(Uuid, i32), Rendition>,
    history: HashMap<Uuid, Vec<JobStatus>>,
}

impl Inner {
    fn job_mut(&mut self, id: Uuid) -> Result<&mut Job> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::not_found("job", id))
    }

    fn set_job_status(&mut self, id: Uuid, next: JobStatus, error: Option<&str>) -> Result<Job> {
        let job = self.job_mut(id)?;
        check_job_transition(job.status, next)?;
        job.status = next;
        if let Some(reason) = error {
            job.error = Some(reason.to_string());
        }
        job.updated_at = OffsetDateTime::now_utc();
        let job = job.clone();
        self.history.entry(id).or_default().push(next);
        Ok(job)
    }

    fn set_rendition_status(
        &mut self,
        video_id: Uuid,
        height: i32,
        next: RenditionStatus,
        output_key: Option<&str>,
        owner: Option<Uuid>,
    ) -> Result<Option<Rendition>> {
        let rendition = self
            .renditions
            .get_mut(&(video_id, height))
            .ok_or_else(|| rendition_not_found(video_id, height))?;
        if owner.is_some() && rendition.job_id != owner {
            return Ok(None);
        }
        check_rendition_transition(rendition.status, next, output_key)?;
        rendition.status = next;
        rendition.output_key = stored_output_key(next, output_key).map(str::to_string);
        rendition.updated_at = OffsetDateTime::now_utc();
        Ok(Some(rendition.clone()))
    }
}

/// Single-process [`JobStore`] used by tests and local runs. Every operation
/// holds one lock for its whole duration, so each call is atomic.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    presets: PresetTable,
}

impl MemoryJobStore {
    pub fn new(presets: PresetTable) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            presets,
        }
    }

    /// Every status the job has been in, oldest first.
    pub async fn job_history(&self, id: Uuid) -> Vec<JobStatus> {
        self.inner
            .lock()
            .await
            .history
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn rendition_count(&self) -> usize {
        self.inner.lock().await.renditions.len()
    }

    pub async fn job_count(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    /// Moves a job's heartbeat into the past.
    pub async fn backdate_job(&self, id: Uuid, by: Duration) {
        if let Some(job) = self.inner.lock().await.jobs.get_mut(&id) {
            job.updated_at -= by;
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_video(
        &self,
        id: Uuid,
        source_key: &str,
        duration_s: Option<i32>,
    ) -> Result<Video> {
        let video = Video {
            id,
            source_key: source_key.to_string(),
            duration_s,
            created_at: OffsetDateTime::now_utc(),
        };
        self.inner.lock().await.videos.insert(id, video.clone());
        Ok(video)
    }

    async fn get_video(&self, id: Uuid) -> Result<Video> {
        self.inner
            .lock()
            .await
            .videos
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("video", id))
    }

    async fn list_recent_videos(&self, limit: i64) -> Result<Vec<Video>> {
        let mut videos: Vec<Video> = self.inner.lock().await.videos.values().cloned().collect();
        videos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        videos.truncate(limit.max(0) as usize);
        Ok(videos)
    }

    async fn create_job(&self, video_id: Uuid, heights: &[i32]) -> Result<Job> {
        validate_heights(heights)?;

        let mut inner = self.inner.lock().await;
        if !inner.videos.contains_key(&video_id) {
            return Err(PipelineError::not_found("video", video_id));
        }

        let now = OffsetDateTime::now_utc();
        let job = Job {
            id: Uuid::new_v4(),
            video_id,
            kind: JobKind::Transcode,
            heights: heights.to_vec(),
            status: JobStatus::Queued,
            error: None,
            claimed_by: None,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(job.id, job.clone());
        inner.history.insert(job.id, vec![JobStatus::Queued]);
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.inner
            .lock()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("job", id))
    }

    async fn transition_job(&self, id: Uuid, next: JobStatus) -> Result<Job> {
        self.inner.lock().await.set_job_status(id, next, None)
    }

    async fn claim_job(&self, id: Uuid, worker: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.job_mut(id)?.status != JobStatus::Queued {
            return Ok(false);
        }
        inner.set_job_status(id, JobStatus::Running, None)?;
        inner.job_mut(id)?.claimed_by = Some(worker.to_string());
        Ok(true)
    }

    async fn fail_job(&self, id: Uuid, reason: &str) -> Result<Job> {
        self.inner
            .lock()
            .await
            .set_job_status(id, JobStatus::Failed, Some(reason))
    }

    async fn touch_job(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(&id) {
            if job.status == JobStatus::Running {
                job.updated_at = OffsetDateTime::now_utc();
            }
        }
        Ok(())
    }

    async fn fail_stale_jobs(&self, older_than: Duration, reason: &str) -> Result<Vec<Uuid>> {
        let cutoff = OffsetDateTime::now_utc() - older_than;
        let mut inner = self.inner.lock().await;

        let stale: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.updated_at < cutoff)
            .map(|j| j.id)
            .collect();

        for id in &stale {
            inner.set_job_status(*id, JobStatus::Failed, Some(reason))?;
        }
        let now = OffsetDateTime::now_utc();
        for rendition in inner.renditions.values_mut() {
            let owned = rendition.job_id.is_some_and(|j| stale.contains(&j));
            if owned && rendition.status == RenditionStatus::Running {
                rendition.status = RenditionStatus::Failed;
                rendition.output_key = None;
                rendition.updated_at = now;
            }
        }
        Ok(stale)
    }

    async fn upsert_rendition_queued(&self, video_id: Uuid, height: i32) -> Result<Rendition> {
        validate_heights(&[height])?;

        let mut inner = self.inner.lock().await;
        if !inner.videos.contains_key(&video_id) {
            return Err(PipelineError::not_found("video", video_id));
        }

        let bitrate = self.presets.get(height).video_kbps as i32;
        let rendition = inner
            .renditions
            .entry((video_id, height))
            .or_insert_with(|| {
                let now = OffsetDateTime::now_utc();
                Rendition {
                    id: Uuid::new_v4(),
                    video_id,
                    job_id: None,
                    height,
                    bitrate_kbps: bitrate,
                    output_key: None,
                    status: RenditionStatus::Queued,
                    created_at: now,
                    updated_at: now,
                }
            });
        Ok(rendition.clone())
    }

    async fn start_rendition(
        &self,
        video_id: Uuid,
        height: i32,
        job_id: Uuid,
    ) -> Result<Rendition> {
        let mut inner = self.inner.lock().await;
        let rendition = inner
            .renditions
            .get_mut(&(video_id, height))
            .ok_or_else(|| rendition_not_found(video_id, height))?;
        check_rendition_transition(rendition.status, RenditionStatus::Running, None)?;
        rendition.status = RenditionStatus::Running;
        rendition.job_id = Some(job_id);
        rendition.output_key = None;
        rendition.updated_at = OffsetDateTime::now_utc();
        Ok(rendition.clone())
    }

    async fn transition_rendition(
        &self,
        video_id: Uuid,
        height: i32,
        next: RenditionStatus,
        output_key: Option<&str>,
    ) -> Result<Rendition> {
        self.inner
            .lock()
            .await
            .set_rendition_status(video_id, height, next, output_key, None)?
            .ok_or_else(|| rendition_not_found(video_id, height))
    }

    async fn settle_rendition(
        &self,
        video_id: Uuid,
        height: i32,
        job_id: Uuid,
        next: RenditionStatus,
        output_key: Option<&str>,
    ) -> Result<Option<Rendition>> {
        self.inner.lock().await.set_rendition_status(
            video_id,
            height,
            next,
            output_key,
            Some(job_id),
        )
    }

    async fn read_job_summary(&self, id: Uuid) -> Result<JobSummary> {
        let inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("job", id))?;
        let renditions = inner
            .renditions
            .values()
            .filter(|r| r.video_id == job.video_id)
            .cloned()
            .collect();
        Ok(JobSummary::new(job, renditions))
    }

    async fn read_video_summary(&self, id: Uuid) -> Result<VideoSummary> {
        let inner = self.inner.lock().await;
        let video = inner
            .videos
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("video", id))?;
        let renditions = inner
            .renditions
            .values()
            .filter(|r| r.video_id == id)
            .cloned()
            .collect();
        let jobs = inner
            .jobs
            .values()
            .filter(|j| j.video_id == id)
            .cloned()
            .collect();
        Ok(VideoSummary::new(video, renditions, jobs))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn store_with_video() -> (MemoryJobStore, Uuid) {
        let store = MemoryJobStore::new(PresetTable::default());
        let id = Uuid::new_v4();
        store
            .create_video(id, &format!("source/{}.mp4", id), Some(15))
            .await
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn upserting_a_height_twice_keeps_one_row() {
        let (store, video) = store_with_video().await;

        let first = store.upsert_rendition_queued(video, 240).await.unwrap();
        store.start_rendition(video, 240, Uuid::new_v4()).await.unwrap();
        let second = store.upsert_rendition_queued(video, 240).await.unwrap();

        assert_eq!(store.rendition_count().await, 1);
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, RenditionStatus::Running);
        assert_eq!(first.bitrate_kbps, 400);
    }

    #[tokio::test]
    async fn create_job_needs_a_known_video() {
        let store = MemoryJobStore::new(PresetTable::default());
        let err = store.create_job(Uuid::new_v4(), &[240]).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn job_walks_forward_only() {
        let (store, video) = store_with_video().await;
        let job = store.create_job(video, &[240, 480]).await.unwrap();

        assert!(store.claim_job(job.id, "w1").await.unwrap());
        store.transition_job(job.id, JobStatus::Done).await.unwrap();

        let err = store
            .transition_job(job.id, JobStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        assert_eq!(
            store.job_history(job.id).await,
            vec![JobStatus::Queued, JobStatus::Running, JobStatus::Done]
        );
    }

    #[tokio::test]
    async fn transition_of_unknown_job_is_not_found() {
        let store = MemoryJobStore::new(PresetTable::default());
        let err = store
            .transition_job(Uuid::new_v4(), JobStatus::Running)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn only_one_claimer_wins() {
        let (store, video) = store_with_video().await;
        let store = Arc::new(store);
        let job = store.create_job(video, &[240]).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_job(job.id, &format!("w{}", i)).await.unwrap()
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }

        assert_eq!(wins, 1);
        let job = store.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.claimed_by.is_some());
    }

    #[tokio::test]
    async fn ready_needs_running_first() {
        let (store, video) = store_with_video().await;
        store.upsert_rendition_queued(video, 480).await.unwrap();

        let err = store
            .transition_rendition(video, 480, RenditionStatus::Ready, Some("HLS/x/480.m3u8"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));

        store.start_rendition(video, 480, Uuid::new_v4()).await.unwrap();
        let ready = store
            .transition_rendition(video, 480, RenditionStatus::Ready, Some("HLS/x/480.m3u8"))
            .await
            .unwrap();
        assert_eq!(ready.output_key.as_deref(), Some("HLS/x/480.m3u8"));
    }

    #[tokio::test]
    async fn stale_running_jobs_are_failed_with_their_renditions() {
        let (store, video) = store_with_video().await;
        let stale = store.create_job(video, &[240]).await.unwrap();
        let fresh = store.create_job(video, &[480]).await.unwrap();
        store.claim_job(stale.id, "w1").await.unwrap();
        store.claim_job(fresh.id, "w2").await.unwrap();
        store.upsert_rendition_queued(video, 240).await.unwrap();
        store.start_rendition(video, 240, stale.id).await.unwrap();

        store
            .backdate_job(stale.id, Duration::from_secs(3600))
            .await;

        let reaped = store
            .fail_stale_jobs(Duration::from_secs(1800), "stale: no heartbeat")
            .await
            .unwrap();
        assert_eq!(reaped, vec![stale.id]);

        let stale = store.get_job(stale.id).await.unwrap();
        assert_eq!(stale.status, JobStatus::Failed);
        assert_eq!(stale.error.as_deref(), Some("stale: no heartbeat"));
        assert_eq!(
            store.get_job(fresh.id).await.unwrap().status,
            JobStatus::Running
        );

        let summary = store.read_video_summary(video).await.unwrap();
        assert_eq!(summary.renditions[0].status, RenditionStatus::Failed);
    }

    #[tokio::test]
    async fn job_summary_counts_settled_renditions() {
        let (store, video) = store_with_video().await;
        let job = store.create_job(video, &[240, 480, 240]).await.unwrap();
        for h in [240, 480, 1080] {
            store.upsert_rendition_queued(video, h).await.unwrap();
            store.start_rendition(video, h, job.id).await.unwrap();
        }
        store
            .transition_rendition(video, 240, RenditionStatus::Ready, Some("HLS/v/240.m3u8"))
            .await
            .unwrap();

        let summary = store.read_job_summary(job.id).await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.renditions.len(), 2);
    }

    #[tokio::test]
    async fn transition_of_unknown_rendition_is_not_found() {
        let (store, video) = store_with_video().await;

        let err = store
            .transition_rendition(Uuid::new_v4(), 240, RenditionStatus::Running, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = store
            .transition_rendition(video, 240, RenditionStatus::Running, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn upsert_for_unknown_video_is_not_found() {
        let store = MemoryJobStore::new(PresetTable::default());
        let err = store
            .upsert_rendition_queued(Uuid::new_v4(), 240)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.rendition_count().await, 0);
    }

    #[tokio::test]
    async fn only_a_ready_rendition_keeps_its_output() {
        let (store, video) = store_with_video().await;
        store.upsert_rendition_queued(video, 240).await.unwrap();
        store.start_rendition(video, 240, Uuid::new_v4()).await.unwrap();
        store
            .transition_rendition(video, 240, RenditionStatus::Ready, Some("HLS/v/240.m3u8"))
            .await
            .unwrap();

        let restarted = store.start_rendition(video, 240, Uuid::new_v4()).await.unwrap();
        assert_eq!(restarted.output_key, None);

        let failed = store
            .transition_rendition(video, 240, RenditionStatus::Failed, Some("HLS/v/240.m3u8"))
            .await
            .unwrap();
        assert_eq!(failed.status, RenditionStatus::Failed);
        assert_eq!(failed.output_key, None);
    }

    #[tokio::test]
    async fn settling_a_taken_over_rendition_changes_nothing() {
        let (store, video) = store_with_video().await;
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        store.upsert_rendition_queued(video, 240).await.unwrap();
        store.start_rendition(video, 240, first).await.unwrap();
        store.start_rendition(video, 240, second).await.unwrap();

        let settled = store
            .settle_rendition(video, 240, first, RenditionStatus::Failed, None)
            .await
            .unwrap();
        assert!(settled.is_none());

        let settled = store
            .settle_rendition(video, 240, second, RenditionStatus::Ready, Some("HLS/v/240.m3u8"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.status, RenditionStatus::Ready);
        assert_eq!(settled.job_id, Some(second));

        let err = store
            .settle_rendition(Uuid::new_v4(), 240, first, RenditionStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn rerun_summary_ignores_renditions_settled_by_earlier_jobs() {
        let (store, video) = store_with_video().await;
        let earlier = store.create_job(video, &[240]).await.unwrap();
        store.upsert_rendition_queued(video, 240).await.unwrap();
        store.start_rendition(video, 240, earlier.id).await.unwrap();
        store
            .transition_rendition(video, 240, RenditionStatus::Ready, Some("HLS/v/240.m3u8"))
            .await
            .unwrap();

        let rerun = store.create_job(video, &[240]).await.unwrap();
        let summary = store.read_job_summary(rerun.id).await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.renditions.len(), 1);

        assert_eq!(store.read_job_summary(earlier.id).await.unwrap().completed, 1);
    }
}
