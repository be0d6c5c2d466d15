use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{PipelineError, Result};

pub const DEFAULT_QUEUE_NAME: &str = "jobs:transcode";
pub const DEFAULT_PROFILES: [i32; 3] = [240, 480, 720];

/// Descriptor pushed on the transport queue. The job row it names is the
/// source of truth; `profiles` mirrors the requested heights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeJob {
    pub job_id: Uuid,
    pub video_id: Uuid,
    #[serde(default)]
    pub profiles: Vec<i32>,
}

impl TranscodeJob {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| PipelineError::TransportDecode(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
