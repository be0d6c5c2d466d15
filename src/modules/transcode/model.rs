use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::common::PipelineError;
use crate::modules::transcode::manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// queued -> running -> {done, failed}; nothing else.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenditionStatus {
    Queued,
    Running,
    Ready,
    Failed,
}

impl RenditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenditionStatus::Queued => "queued",
            RenditionStatus::Running => "running",
            RenditionStatus::Ready => "ready",
            RenditionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RenditionStatus::Ready | RenditionStatus::Failed)
    }

    /// A rendition may be (re)started from any state, since a later job for the
    /// same video re-encodes it. It only settles out of `running`.
    pub fn can_transition_to(&self, next: RenditionStatus) -> bool {
        match next {
            RenditionStatus::Running => true,
            RenditionStatus::Ready | RenditionStatus::Failed => *self == RenditionStatus::Running,
            RenditionStatus::Queued => false,
        }
    }
}

impl fmt::Display for RenditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenditionStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RenditionStatus::Queued),
            "running" => Ok(RenditionStatus::Running),
            "ready" => Ok(RenditionStatus::Ready),
            "failed" => Ok(RenditionStatus::Failed),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown rendition status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Transcode,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Transcode => "transcode",
        }
    }
}

impl FromStr for JobKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcode" => Ok(JobKind::Transcode),
            other => Err(PipelineError::InvalidInput(format!("unknown job kind '{}'", other))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Video {
    pub id: Uuid,
    pub source_key: String,
    pub duration_s: Option<i32>,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub video_id: Uuid,
    pub kind: JobKind,
    pub heights: Vec<i32>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub claimed_by: Option<String>,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::iso8601")]
    pub updated_at: OffsetDateTime,
}

impl Job {
    /// Requested heights with duplicates removed, first occurrence wins.
    pub fn unique_heights(&self) -> Vec<i32> {
        unique_heights(&self.heights)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Rendition {
    pub id: Uuid,
    pub video_id: Uuid,
    /// Job that most recently ran this rendition.
    pub job_id: Option<Uuid>,
    pub height: i32,
    pub bitrate_kbps: i32,
    pub output_key: Option<String>,
    pub status: RenditionStatus,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::iso8601")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Clone)]
pub struct JobSummary {
    pub job: Job,
    pub renditions: Vec<Rendition>,
    pub completed: usize,
    pub total: usize,
}

impl JobSummary {
    /// `renditions` may include rows for other heights of the same video; only
    /// the ones this job asked for are kept. `completed` counts the rows this
    /// job itself settled.
    pub fn new(job: Job, renditions: Vec<Rendition>) -> Self {
        let heights = job.unique_heights();
        let mut renditions: Vec<Rendition> = renditions
            .into_iter()
            .filter(|r| r.video_id == job.video_id && heights.contains(&r.height))
            .collect();
        renditions.sort_by_key(|r| r.height);

        let completed = renditions
            .iter()
            .filter(|r| r.job_id == Some(job.id) && r.status.is_terminal())
            .count();
        Self {
            total: heights.len(),
            completed,
            job,
            renditions,
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct VideoSummary {
    pub video: Video,
    pub renditions: Vec<Rendition>,
    pub jobs: Vec<Job>,
    pub master_manifest_key: Option<String>,
}

impl VideoSummary {
    pub fn new(video: Video, mut renditions: Vec<Rendition>, mut jobs: Vec<Job>) -> Self {
        renditions.sort_by_key(|r| r.height);
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let master_manifest_key = renditions
            .iter()
            .any(|r| r.status == RenditionStatus::Ready)
            .then(|| manifest::master_manifest_key(video.id));

        Self {
            video,
            renditions,
            jobs,
            master_manifest_key,
        }
    }
}

pub fn unique_heights(heights: &[i32]) -> Vec<i32> {
    let mut seen = Vec::with_capacity(heights.len());
    for h in heights {
        if !seen.contains(h) {
            seen.push(*h);
        }
    }
    seen
}
