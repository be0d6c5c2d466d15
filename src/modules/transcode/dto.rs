use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct RegisterVideoRequest {
    /// Original file name; only its extension is kept.
    pub file_name: String,
    pub duration_s: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub video_id: Uuid,
    /// Defaults to 240/480/720 when absent.
    pub profiles: Option<Vec<i32>>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct HealthResponse {
    pub ok: bool,
    pub database: bool,
    pub queue: bool,
    pub queue_depth: Option<u64>,
}
