//! Encode invoker: one ffmpeg run per rendition.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::common::{PipelineError, Result};
use crate::modules::transcode::manifest::{rendition_manifest_name, segment_template};
use crate::modules::transcode::presets::BitratePreset;

/// Fixed HLS segment length in seconds.
pub const SEGMENT_SECONDS: u32 = 4;

#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    pub height: i32,
    pub preset: BitratePreset,
}

impl EncodeRequest {
    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(rendition_manifest_name(self.height))
    }
}

#[derive(Debug, Clone)]
pub struct EncodeOutput {
    pub height: i32,
    pub manifest: PathBuf,
    pub elapsed: Duration,
    pub diagnostics: String,
}

/// Runs a single rendition encode. Implementations never retry.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Returns `EncodeFailure` when the process fails or leaves no manifest.
    async fn encode(&self, request: &EncodeRequest) -> Result<EncodeOutput>;
}

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
    timeout: Option<Duration>,
    tail_bytes: usize,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
            tail_bytes: 4000,
        }
    }

    /// Resolves the binary on `PATH` (or takes an explicit path as-is).
    pub fn locate(name_or_path: &str) -> Result<Self> {
        let program = which::which(name_or_path).map_err(|e| {
            PipelineError::Config(format!("ffmpeg not found ({}): {}", name_or_path, e))
        })?;
        info!("🎞️ Using encoder at {}", program.display());
        Ok(Self::new(program))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tail_bytes(mut self, tail_bytes: usize) -> Self {
        self.tail_bytes = tail_bytes;
        self
    }
}

/// Full ffmpeg argument list for one rendition.
pub fn ffmpeg_args(request: &EncodeRequest) -> Vec<String> {
    let preset = request.preset;
    let segments = request.output_dir.join(segment_template(request.height));

    vec![
        "-y".into(),
        "-i".into(),
        request.source.to_string_lossy().into_owned(),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "0:a:0?".into(),
        "-vf".into(),
        format!("scale=-2:{}", request.height),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "veryfast".into(),
        "-b:v".into(),
        format!("{}k", preset.video_kbps),
        "-maxrate".into(),
        format!("{}k", preset.maxrate_kbps()),
        "-bufsize".into(),
        format!("{}k", preset.bufsize_kbps()),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        format!("{}k", preset.audio_kbps),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        SEGMENT_SECONDS.to_string(),
        "-hls_playlist_type".into(),
        "vod".into(),
        "-hls_list_size".into(),
        "0".into(),
        "-hls_segment_filename".into(),
        segments.to_string_lossy().into_owned(),
        request.manifest_path().to_string_lossy().into_owned(),
    ]
}

/// Last `max_bytes` of `text`, cut on a char boundary.
pub fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(&self, request: &EncodeRequest) -> Result<EncodeOutput> {
        let height = request.height;
        let started = Instant::now();
        let args = ffmpeg_args(request);
        debug!("[ffmpeg]> {} {}", self.program.display(), args.join(" "));

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::EncodeFailure {
                height,
                reason: format!("failed to spawn {}: {}", self.program.display(), e),
                diagnostics: String::new(),
            })?;

        let waited = match self.timeout {
            // Dropping the child on timeout kills it.
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(height, "⏱️ Encode timed out after {:?}", limit);
                    return Err(PipelineError::EncodeFailure {
                        height,
                        reason: format!("timed out after {:?}", limit),
                        diagnostics: String::new(),
                    });
                }
            },
            None => child.wait_with_output().await,
        };

        let output = waited.map_err(|e| PipelineError::EncodeFailure {
            height,
            reason: format!("I/O error waiting for ffmpeg: {}", e),
            diagnostics: String::new(),
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let diagnostics = tail(&combined, self.tail_bytes);

        if !output.status.success() {
            return Err(PipelineError::EncodeFailure {
                height,
                reason: format!("ffmpeg exited with {}", output.status),
                diagnostics,
            });
        }

        // A clean exit without the playlist on disk is still a failed encode.
        let manifest = request.manifest_path();
        if !tokio::fs::try_exists(&manifest).await.unwrap_or(false) {
            return Err(PipelineError::EncodeFailure {
                height,
                reason: format!("ffmpeg exited cleanly but {} is missing", manifest.display()),
                diagnostics,
            });
        }

        Ok(EncodeOutput {
            height,
            manifest,
            elapsed: started.elapsed(),
            diagnostics,
        })
    }
}
