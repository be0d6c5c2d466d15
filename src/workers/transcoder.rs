use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::infrastructure::queue::JobQueue;
use crate::modules::transcode::events::TranscodeJob;
use crate::modules::transcode::model::{JobStatus, unique_heights};
use crate::modules::transcode::orchestrator::Orchestrator;
use crate::modules::transcode::repository::JobStore;
use crate::state::AppState;

const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// What happened to one popped queue item.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Orchestration finished and the job is `done`.
    Done { job_id: Uuid },
    /// The job ended `failed`.
    Failed { job_id: Uuid, reason: String },
    /// Replay of a job that is finished or owned by another consumer.
    Skipped { job_id: Uuid, status: JobStatus },
    /// Poison message or unknown job; nothing was written.
    Dropped { reason: String },
    /// A transient store error before the claim; the payload went back on the
    /// queue.
    Requeued { job_id: Uuid },
}

/// Pops job descriptors and drives each claimed job to `done` or `failed`.
pub struct TranscodeConsumer {
    worker_id: String,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    orchestrator: Orchestrator,
    pop_timeout: Duration,
    heartbeat_interval: Duration,
    retry_backoff: Duration,
}

impl TranscodeConsumer {
    pub fn new(state: &AppState, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            store: state.store.clone(),
            queue: state.queue.clone(),
            orchestrator: state.orchestrator(),
            pop_timeout: state.config.worker.pop_timeout,
            heartbeat_interval: state.config.worker.heartbeat_interval,
            retry_backoff: RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Runs until `shutdown` flips to `true`. A job in flight when that
    /// happens is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "🎥 Transcoder worker '{}' listening on '{}'",
            self.worker_id,
            self.queue.name()
        );

        while !*shutdown.borrow() {
            match self.queue.pop(self.pop_timeout).await {
                Ok(Some(payload)) => {
                    info!("📦 Received transcoding job");
                    let disposition = self.handle_payload(&payload).await;
                    debug!(worker = %self.worker_id, "Disposition: {:?}", disposition);
                }
                Ok(None) => {}
                Err(e) => {
                    error!("❌ Failed to pop from '{}': {}", self.queue.name(), e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!("🛑 Transcoder worker '{}' stopped", self.worker_id);
    }

    /// Processes one payload end to end. Never fails: every outcome is a
    /// [`Disposition`], and the item counts as acknowledged afterwards.
    pub async fn handle_payload(&self, payload: &[u8]) -> Disposition {
        let descriptor = match TranscodeJob::decode(payload) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("☠️ Dropping payload: {}", e);
                return Disposition::Dropped {
                    reason: e.to_string(),
                };
            }
        };
        let job_id = descriptor.job_id;

        let job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                warn!(%job_id, "☠️ Dropping descriptor for unknown job");
                return Disposition::Dropped {
                    reason: e.to_string(),
                };
            }
            Err(e) if e.is_transient() => {
                return self.requeue(job_id, payload, &e.to_string()).await;
            }
            Err(e) => {
                error!(%job_id, "☠️ Dropping descriptor: {}", e);
                return Disposition::Dropped {
                    reason: e.to_string(),
                };
            }
        };

        if job.video_id != descriptor.video_id {
            warn!(%job_id, "☠️ Descriptor video {} does not match job video {}", descriptor.video_id, job.video_id);
            return Disposition::Dropped {
                reason: format!("video mismatch for job {}", job_id),
            };
        }
        if !descriptor.profiles.is_empty()
            && unique_heights(&descriptor.profiles) != job.unique_heights()
        {
            warn!(%job_id, "Descriptor profiles {:?} differ from job heights {:?}; using the job row", descriptor.profiles, job.heights);
        }

        if job.status != JobStatus::Queued {
            info!(%job_id, "⏭️ Job already {}, skipping", job.status);
            return Disposition::Skipped {
                job_id,
                status: job.status,
            };
        }

        match self.store.claim_job(job_id, &self.worker_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(%job_id, "⏭️ Job claimed by another worker, skipping");
                return Disposition::Skipped {
                    job_id,
                    status: JobStatus::Running,
                };
            }
            Err(e) if e.is_transient() => {
                return self.requeue(job_id, payload, &e.to_string()).await;
            }
            Err(e) => {
                error!(%job_id, "☠️ Could not claim job: {}", e);
                return Disposition::Dropped {
                    reason: e.to_string(),
                };
            }
        }

        info!(%job_id, video_id = %job.video_id, heights = ?job.heights, "🚀 Processing job");
        let outcome = {
            let _heartbeat = Heartbeat::start(self.store.clone(), job_id, self.heartbeat_interval);
            self.orchestrator.run(&job).await
        };

        match outcome {
            Ok(report) => match self.store.transition_job(job_id, JobStatus::Done).await {
                Ok(_) => {
                    info!(
                        %job_id,
                        "✅ Job completed: {} ready, {} failed",
                        report.ready.len(),
                        report.failed.len()
                    );
                    Disposition::Done { job_id }
                }
                Err(e) => {
                    error!(%job_id, "❌ Could not mark job done: {}", e);
                    self.fail(job_id, e.to_string()).await
                }
            },
            Err(e) => {
                error!(%job_id, "❌ Failed to process job: {}", e);
                self.fail(job_id, e.to_string()).await
            }
        }
    }

    async fn fail(&self, job_id: Uuid, reason: String) -> Disposition {
        if let Err(e) = self.store.fail_job(job_id, &reason).await {
            // Left for the stale-job reaper.
            error!(%job_id, "❌ Could not mark job failed: {}", e);
        }
        Disposition::Failed { job_id, reason }
    }

    async fn requeue(&self, job_id: Uuid, payload: &[u8], reason: &str) -> Disposition {
        warn!(%job_id, "🔁 Store unavailable ({}), requeueing", reason);
        tokio::time::sleep(self.retry_backoff).await;
        if let Err(e) = self.queue.push(payload).await {
            error!(%job_id, "❌ Requeue failed, descriptor lost: {}", e);
        }
        Disposition::Requeued { job_id }
    }
}

/// Bumps the job's heartbeat until dropped.
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(store: Arc<dyn JobStore>, job_id: Uuid, every: Duration) -> Self {
        Self(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.touch_job(job_id).await {
                    warn!(%job_id, "💓 Heartbeat failed: {}", e);
                }
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{PipelineError, Result};
    use crate::infrastructure::queue::MemoryJobQueue;
    use crate::modules::transcode::model::RenditionStatus;
    use crate::modules::transcode::testing::{Fixture, ScriptedEncoder, app_state, fixture};

    struct Setup {
        fx: Fixture,
        queue: Arc<MemoryJobQueue>,
        consumer: TranscodeConsumer,
        _work: tempfile::TempDir,
    }

    async fn setup(encoder: ScriptedEncoder) -> Setup {
        let fx = fixture().await;
        let work = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryJobQueue::new("jobs:test"));
        let mut state = app_state(&fx, queue.clone(), Arc::new(encoder));
        state.config.worker.work_dir = work.path().to_path_buf();
        state.config.worker.pop_timeout = Duration::from_millis(20);
        let consumer = TranscodeConsumer::new(&state, "test-worker")
            .with_retry_backoff(Duration::from_millis(1));
        Setup {
            fx,
            queue,
            consumer,
            _work: work,
        }
    }

    fn descriptor(job_id: Uuid, video_id: Uuid, profiles: &[i32]) -> Vec<u8> {
        TranscodeJob {
            job_id,
            video_id,
            profiles: profiles.to_vec(),
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped_without_rows() {
        let s = setup(ScriptedEncoder::new()).await;

        let payloads: [&[u8]; 3] = [b"not json", br#"{"video_id":"x"}"#, b""];
        for payload in payloads {
            let disposition = s.consumer.handle_payload(payload).await;
            assert!(matches!(disposition, Disposition::Dropped { .. }));
        }
        assert_eq!(s.fx.store.job_count().await, 0);
        assert_eq!(s.fx.store.rendition_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_job_is_dropped() {
        let s = setup(ScriptedEncoder::new()).await;
        let payload = descriptor(Uuid::new_v4(), s.fx.video.id, &[240]);
        assert!(matches!(
            s.consumer.handle_payload(&payload).await,
            Disposition::Dropped { .. }
        ));
        assert_eq!(s.fx.store.rendition_count().await, 0);
    }

    #[tokio::test]
    async fn job_runs_to_done() {
        let s = setup(ScriptedEncoder::failing(&[480])).await;
        let job = s
            .fx
            .store
            .create_job(s.fx.video.id, &[240, 480, 720])
            .await
            .unwrap();

        let disposition = s
            .consumer
            .handle_payload(&descriptor(job.id, s.fx.video.id, &[240, 480, 720]))
            .await;
        assert_eq!(disposition, Disposition::Done { job_id: job.id });

        let summary = s.fx.store.read_job_summary(job.id).await.unwrap();
        assert_eq!(summary.job.status, JobStatus::Done);
        assert_eq!(summary.job.claimed_by.as_deref(), Some("test-worker"));
        assert_eq!(summary.completed, 3);
        let failed: Vec<i32> = summary
            .renditions
            .iter()
            .filter(|r| r.status == RenditionStatus::Failed)
            .map(|r| r.height)
            .collect();
        assert_eq!(failed, vec![480]);
        assert_eq!(
            s.fx.store.job_history(job.id).await,
            vec![JobStatus::Queued, JobStatus::Running, JobStatus::Done]
        );
    }

    #[tokio::test]
    async fn replay_after_done_is_a_no_op() {
        let encoder = Arc::new(ScriptedEncoder::new());
        let fx = fixture().await;
        let work = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryJobQueue::new("jobs:test"));
        let mut state = app_state(&fx, queue, encoder.clone());
        state.config.worker.work_dir = work.path().to_path_buf();
        let consumer = TranscodeConsumer::new(&state, "test-worker");

        let job = fx.store.create_job(fx.video.id, &[240]).await.unwrap();
        let payload = descriptor(job.id, fx.video.id, &[240]);

        assert_eq!(
            consumer.handle_payload(&payload).await,
            Disposition::Done { job_id: job.id }
        );
        let before = fx.store.read_job_summary(job.id).await.unwrap();

        assert_eq!(
            consumer.handle_payload(&payload).await,
            Disposition::Skipped {
                job_id: job.id,
                status: JobStatus::Done
            }
        );
        let after = fx.store.read_job_summary(job.id).await.unwrap();

        assert_eq!(encoder.calls().await, vec![240]);
        assert_eq!(before.job, after.job);
        assert_eq!(before.renditions, after.renditions);
    }

    #[tokio::test]
    async fn missing_source_fails_the_job() {
        let s = setup(ScriptedEncoder::new()).await;
        let orphan = s
            .fx
            .store
            .create_video(Uuid::new_v4(), "source/gone.mp4", None)
            .await
            .unwrap();
        let job = s.fx.store.create_job(orphan.id, &[240]).await.unwrap();

        let disposition = s
            .consumer
            .handle_payload(&descriptor(job.id, orphan.id, &[]))
            .await;
        assert!(matches!(disposition, Disposition::Failed { .. }));

        let job = s.fx.store.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("source unavailable"));
    }

    #[tokio::test]
    async fn mismatched_video_is_dropped() {
        let s = setup(ScriptedEncoder::new()).await;
        let job = s.fx.store.create_job(s.fx.video.id, &[240]).await.unwrap();

        let disposition = s
            .consumer
            .handle_payload(&descriptor(job.id, Uuid::new_v4(), &[240]))
            .await;
        assert!(matches!(disposition, Disposition::Dropped { .. }));
        assert_eq!(
            s.fx.store.get_job(job.id).await.unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn run_drains_the_queue_and_stops_on_shutdown() {
        let s = setup(ScriptedEncoder::new()).await;
        let job = s.fx.store.create_job(s.fx.video.id, &[240, 720]).await.unwrap();
        s.queue
            .push(&descriptor(job.id, s.fx.video.id, &[240, 720]))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let consumer = Arc::new(s.consumer);
        let handle = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(rx).await })
        };

        for _ in 0..200 {
            if s.fx.store.get_job(job.id).await.unwrap().status == JobStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            s.fx.store.get_job(job.id).await.unwrap().status,
            JobStatus::Done
        );
        assert_eq!(s.queue.len().await.unwrap(), 0);
    }

    /// A queue whose pops always fail, for the transport-error path.
    struct BrokenQueue;

    #[async_trait::async_trait]
    impl JobQueue for BrokenQueue {
        fn name(&self) -> &str {
            "broken"
        }
        async fn push(&self, _payload: &[u8]) -> Result<()> {
            Err(PipelineError::Io(std::io::Error::other("down")))
        }
        async fn pop(&self, _wait: Duration) -> Result<Option<Vec<u8>>> {
            Err(PipelineError::Io(std::io::Error::other("down")))
        }
        async fn len(&self) -> Result<u64> {
            Ok(0)
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn pop_errors_do_not_stop_the_loop() {
        let fx = fixture().await;
        let state = app_state(&fx, Arc::new(BrokenQueue), Arc::new(ScriptedEncoder::new()));
        let consumer = TranscodeConsumer::new(&state, "test-worker")
            .with_retry_backoff(Duration::from_millis(5));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { consumer.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
