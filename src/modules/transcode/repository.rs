use std::time::Duration;

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{
    Job, JobKind, JobStatus, JobSummary, Rendition, RenditionStatus, Video, VideoSummary,
    unique_heights,
};
use super::presets::PresetTable;
use crate::common::{PipelineError, Result};

/// Durable record of videos, jobs and renditions.
///
/// Every status change goes through the legal-transition checks on
/// [`JobStatus`] and [`RenditionStatus`]; implementations apply each change
/// atomically per row.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn create_video(
        &self,
        id: Uuid,
        source_key: &str,
        duration_s: Option<i32>,
    ) -> Result<Video>;
    async fn get_video(&self, id: Uuid) -> Result<Video>;
    async fn list_recent_videos(&self, limit: i64) -> Result<Vec<Video>>;

    /// Inserts a `queued` job. `NotFound` if the video does not exist.
    async fn create_job(&self, video_id: Uuid, heights: &[i32]) -> Result<Job>;
    async fn get_job(&self, id: Uuid) -> Result<Job>;
    async fn transition_job(&self, id: Uuid, next: JobStatus) -> Result<Job>;
    /// Atomic `queued -> running`. `Ok(false)` when someone else got there first.
    async fn claim_job(&self, id: Uuid, worker: &str) -> Result<bool>;
    /// `running -> failed`, recording why.
    async fn fail_job(&self, id: Uuid, reason: &str) -> Result<Job>;
    /// Heartbeat for a running job.
    async fn touch_job(&self, id: Uuid) -> Result<()>;
    /// Fails running jobs (and their running renditions) whose heartbeat is
    /// older than `older_than`. Returns the failed job ids.
    async fn fail_stale_jobs(&self, older_than: Duration, reason: &str) -> Result<Vec<Uuid>>;

    /// Idempotent: returns the existing row untouched if there is one.
    async fn upsert_rendition_queued(&self, video_id: Uuid, height: i32) -> Result<Rendition>;
    /// Marks a rendition `running` on behalf of `job_id`.
    async fn start_rendition(&self, video_id: Uuid, height: i32, job_id: Uuid)
    -> Result<Rendition>;
    /// `output_key` is required for `ready` and is cleared by any other status.
    async fn transition_rendition(
        &self,
        video_id: Uuid,
        height: i32,
        next: RenditionStatus,
        output_key: Option<&str>,
    ) -> Result<Rendition>;
    /// Like [`JobStore::transition_rendition`], but only while `job_id` still
    /// owns the row. `Ok(None)` when a later job has taken it over.
    async fn settle_rendition(
        &self,
        video_id: Uuid,
        height: i32,
        job_id: Uuid,
        next: RenditionStatus,
        output_key: Option<&str>,
    ) -> Result<Option<Rendition>>;

    async fn read_job_summary(&self, id: Uuid) -> Result<JobSummary>;
    async fn read_video_summary(&self, id: Uuid) -> Result<VideoSummary>;
}

pub(crate) fn validate_heights(heights: &[i32]) -> Result<()> {
    if heights.is_empty() {
        return Err(PipelineError::InvalidInput(
            "at least one rendition height is required".into(),
        ));
    }
    if let Some(h) = heights.iter().find(|h| **h <= 0) {
        return Err(PipelineError::InvalidInput(format!(
            "rendition height must be positive, got {}",
            h
        )));
    }
    Ok(())
}

pub(crate) fn check_job_transition(from: JobStatus, to: JobStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(PipelineError::InvalidTransition {
            entity: "job",
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

pub(crate) fn check_rendition_transition(
    from: RenditionStatus,
    to: RenditionStatus,
    output_key: Option<&str>,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(PipelineError::InvalidTransition {
            entity: "rendition",
            from: from.as_str(),
            to: to.as_str(),
        });
    }
    if to == RenditionStatus::Ready && output_key.is_none() {
        return Err(PipelineError::InvalidInput(
            "a ready rendition needs an output location".into(),
        ));
    }
    Ok(())
}

pub(crate) fn rendition_not_found(video_id: Uuid, height: i32) -> PipelineError {
    PipelineError::not_found("rendition", format!("{}@{}p", video_id, height))
}

/// Only a `ready` rendition keeps an output location.
pub(crate) fn stored_output_key(next: RenditionStatus, output_key: Option<&str>) -> Option<&str> {
    if next == RenditionStatus::Ready {
        output_key
    } else {
        None
    }
}

/// Who is moving a rendition, and what that allows.
#[derive(Debug, Clone, Copy)]
enum RenditionActor {
    Anyone,
    /// Takes the row over for this job.
    Starting(Uuid),
    /// Writes only while the row still belongs to this job.
    Owner(Uuid),
}

#[derive(Debug, FromRow)]
struct VideoRow {
    id: Uuid,
    source_key: String,
    duration_s: Option<i32>,
    created_at: OffsetDateTime,
}

impl From<VideoRow> for Video {
    fn from(row: VideoRow) -> Self {
        Self {
            id: row.id,
            source_key: row.source_key,
            duration_s: row.duration_s,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    video_id: Uuid,
    kind: String,
    heights: Vec<i32>,
    status: String,
    error: Option<String>,
    claimed_by: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<JobRow> for Job {
    type Error = PipelineError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            video_id: row.video_id,
            kind: row.kind.parse::<JobKind>()?,
            heights: row.heights,
            status: row.status.parse()?,
            error: row.error,
            claimed_by: row.claimed_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RenditionRow {
    id: Uuid,
    video_id: Uuid,
    job_id: Option<Uuid>,
    height: i32,
    bitrate_kbps: i32,
    output_key: Option<String>,
    status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<RenditionRow> for Rendition {
    type Error = PipelineError;

    fn try_from(row: RenditionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            video_id: row.video_id,
            job_id: row.job_id,
            height: row.height,
            bitrate_kbps: row.bitrate_kbps,
            output_key: row.output_key,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn renditions_from_rows(rows: Vec<RenditionRow>) -> Result<Vec<Rendition>> {
    rows.into_iter().map(Rendition::try_from).collect()
}

fn jobs_from_rows(rows: Vec<JobRow>) -> Result<Vec<Job>> {
    rows.into_iter().map(Job::try_from).collect()
}

/// Turns a foreign-key violation into `NotFound` for the referenced entity.
fn missing_parent(e: sqlx::Error, entity: &'static str, id: Uuid) -> PipelineError {
    if let Some(db) = e.as_database_error() {
        if db.is_foreign_key_violation() {
            return PipelineError::not_found(entity, id);
        }
    }
    e.into()
}

const JOB_COLUMNS: &str =
    "id, video_id, kind, heights, status, error, claimed_by, created_at, updated_at";
const RENDITION_COLUMNS: &str =
    "id, video_id, job_id, height, bitrate_kbps, output_key, status, created_at, updated_at";

pub struct PgJobStore {
    pool: PgPool,
    presets: PresetTable,
}

impl PgJobStore {
    pub fn new(pool: PgPool, presets: PresetTable) -> Self {
        Self { pool, presets }
    }

    async fn apply_job_transition(
        &self,
        id: Uuid,
        next: JobStatus,
        error: Option<&str>,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;

        let current: (String,) = sqlx::query_as("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| PipelineError::not_found("job", id))?;
        check_job_transition(current.0.parse()?, next)?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = $2, error = COALESCE($3, error), updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(next.as_str())
        .bind(error)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn fetch_rendition(&self, video_id: Uuid, height: i32) -> Result<Rendition> {
        sqlx::query_as::<_, RenditionRow>(&format!(
            "SELECT {RENDITION_COLUMNS} FROM renditions WHERE video_id = $1 AND height = $2"
        ))
        .bind(video_id)
        .bind(height)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| rendition_not_found(video_id, height))?
        .try_into()
    }

    async fn apply_rendition_transition(
        &self,
        video_id: Uuid,
        height: i32,
        next: RenditionStatus,
        output_key: Option<&str>,
        actor: RenditionActor,
    ) -> Result<Option<Rendition>> {
        let mut tx = self.pool.begin().await?;

        let (status, owner): (String, Option<Uuid>) = sqlx::query_as(
            "SELECT status, job_id FROM renditions WHERE video_id = $1 AND height = $2 FOR UPDATE",
        )
        .bind(video_id)
        .bind(height)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| rendition_not_found(video_id, height))?;

        if let RenditionActor::Owner(job_id) = actor {
            if owner != Some(job_id) {
                return Ok(None);
            }
        }
        check_rendition_transition(status.parse()?, next, output_key)?;

        let claim = match actor {
            RenditionActor::Starting(job_id) => Some(job_id),
            _ => None,
        };
        let row = sqlx::query_as::<_, RenditionRow>(&format!(
            r#"
            UPDATE renditions
            SET status = $3,
                output_key = $4,
                job_id = COALESCE($5, job_id),
                updated_at = NOW()
            WHERE video_id = $1 AND height = $2
            RETURNING {RENDITION_COLUMNS}
            "#
        ))
        .bind(video_id)
        .bind(height)
        .bind(next.as_str())
        .bind(stored_output_key(next, output_key))
        .bind(claim)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(row.try_into()?))
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_video(
        &self,
        id: Uuid,
        source_key: &str,
        duration_s: Option<i32>,
    ) -> Result<Video> {
        let row = sqlx::query_as::<_, VideoRow>(
            r#"
            INSERT INTO videos (id, source_key, duration_s)
            VALUES ($1, $2, $3)
            RETURNING id, source_key, duration_s, created_at
            "#,
        )
        .bind(id)
        .bind(source_key)
        .bind(duration_s)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_video(&self, id: Uuid) -> Result<Video> {
        sqlx::query_as::<_, VideoRow>(
            "SELECT id, source_key, duration_s, created_at FROM videos WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Video::from)
        .ok_or_else(|| PipelineError::not_found("video", id))
    }

    async fn list_recent_videos(&self, limit: i64) -> Result<Vec<Video>> {
        let rows = sqlx::query_as::<_, VideoRow>(
            r#"
            SELECT id, source_key, duration_s, created_at
            FROM videos
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Video::from).collect())
    }

    async fn create_job(&self, video_id: Uuid, heights: &[i32]) -> Result<Job> {
        validate_heights(heights)?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO jobs (id, video_id, kind, heights, status)
            VALUES ($1, $2, $3, $4, 'queued')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(video_id)
        .bind(JobKind::Transcode.as_str())
        .bind(heights)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| missing_parent(e, "video", video_id))?;

        row.try_into()
    }

    async fn get_job(&self, id: Uuid) -> Result<Job> {
        sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PipelineError::not_found("job", id))?
            .try_into()
    }

    async fn transition_job(&self, id: Uuid, next: JobStatus) -> Result<Job> {
        self.apply_job_transition(id, next, None).await
    }

    async fn claim_job(&self, id: Uuid, worker: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', claimed_by = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Distinguish "lost the race" from "no such job".
        self.get_job(id).await?;
        Ok(false)
    }

    async fn fail_job(&self, id: Uuid, reason: &str) -> Result<Job> {
        self.apply_job_transition(id, JobStatus::Failed, Some(reason))
            .await
    }

    async fn touch_job(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET updated_at = NOW() WHERE id = $1 AND status = 'running'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_stale_jobs(&self, older_than: Duration, reason: &str) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let stale: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET status = 'failed', error = $2, updated_at = NOW()
            WHERE status = 'running'
              AND updated_at < NOW() - make_interval(secs => $1)
            RETURNING id
            "#,
        )
        .bind(older_than.as_secs_f64())
        .bind(reason)
        .fetch_all(&mut *tx)
        .await?;

        let ids: Vec<Uuid> = stale.into_iter().map(|(id,)| id).collect();
        if !ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE renditions
                SET status = 'failed', output_key = NULL, updated_at = NOW()
                WHERE status = 'running' AND job_id = ANY($1)
                "#,
            )
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn upsert_rendition_queued(&self, video_id: Uuid, height: i32) -> Result<Rendition> {
        validate_heights(&[height])?;
        let preset = self.presets.get(height);

        sqlx::query(
            r#"
            INSERT INTO renditions (id, video_id, height, bitrate_kbps, status)
            VALUES ($1, $2, $3, $4, 'queued')
            ON CONFLICT (video_id, height) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(video_id)
        .bind(height)
        .bind(preset.video_kbps as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| missing_parent(e, "video", video_id))?;

        self.fetch_rendition(video_id, height).await
    }

    async fn start_rendition(
        &self,
        video_id: Uuid,
        height: i32,
        job_id: Uuid,
    ) -> Result<Rendition> {
        self.apply_rendition_transition(
            video_id,
            height,
            RenditionStatus::Running,
            None,
            RenditionActor::Starting(job_id),
        )
        .await?
        .ok_or_else(|| rendition_not_found(video_id, height))
    }

    async fn transition_rendition(
        &self,
        video_id: Uuid,
        height: i32,
        next: RenditionStatus,
        output_key: Option<&str>,
    ) -> Result<Rendition> {
        self.apply_rendition_transition(
            video_id,
            height,
            next,
            output_key,
            RenditionActor::Anyone,
        )
        .await?
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
        self.apply_rendition_transition(
            video_id,
            height,
            next,
            output_key,
            RenditionActor::Owner(job_id),
        )
        .await
    }

    async fn read_job_summary(&self, id: Uuid) -> Result<JobSummary> {
        let job = self.get_job(id).await?;
        let heights = unique_heights(&job.heights);

        let rows = sqlx::query_as::<_, RenditionRow>(&format!(
            r#"
            SELECT {RENDITION_COLUMNS}
            FROM renditions
            WHERE video_id = $1 AND height = ANY($2)
            ORDER BY height
            "#
        ))
        .bind(job.video_id)
        .bind(&heights)
        .fetch_all(&self.pool)
        .await?;

        Ok(JobSummary::new(job, renditions_from_rows(rows)?))
    }

    async fn read_video_summary(&self, id: Uuid) -> Result<VideoSummary> {
        // One snapshot for all three reads.
        let mut tx = self.pool.begin().await?;

        let video: Video = sqlx::query_as::<_, VideoRow>(
            "SELECT id, source_key, duration_s, created_at FROM videos WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .map(Video::from)
        .ok_or_else(|| PipelineError::not_found("video", id))?;

        let renditions = sqlx::query_as::<_, RenditionRow>(&format!(
            "SELECT {RENDITION_COLUMNS} FROM renditions WHERE video_id = $1 ORDER BY height"
        ))
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let jobs = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE video_id = $1 ORDER BY created_at DESC"
        ))
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(VideoSummary::new(
            video,
            renditions_from_rows(renditions)?,
            jobs_from_rows(jobs)?,
        ))
    }
}
