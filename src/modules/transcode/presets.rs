//! Height → bitrate presets used for encoding and for the master manifest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitratePreset {
    pub video_kbps: u32,
    pub audio_kbps: u32,
}

impl BitratePreset {
    pub const fn new(video_kbps: u32, audio_kbps: u32) -> Self {
        Self {
            video_kbps,
            audio_kbps,
        }
    }

    /// Rate-control ceiling: 1.1x the target video bitrate.
    pub fn maxrate_kbps(&self) -> u32 {
        self.video_kbps * 11 / 10
    }

    /// Decoder buffer: 2x the target video bitrate.
    pub fn bufsize_kbps(&self) -> u32 {
        self.video_kbps * 2
    }

    /// Advertised `BANDWIDTH` in bits per second.
    pub fn bandwidth_bps(&self) -> u64 {
        (self.video_kbps as u64 + self.audio_kbps as u64) * 1000
    }
}

const FALLBACK: BitratePreset = BitratePreset::new(800, 96);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetTable {
    entries: BTreeMap<i32, BitratePreset>,
    fallback: BitratePreset,
}

impl Default for PresetTable {
    fn default() -> Self {
        let entries = BTreeMap::from([
            (240, BitratePreset::new(400, 96)),
            (480, BitratePreset::new(800, 96)),
            (720, BitratePreset::new(1500, 128)),
        ]);
        Self {
            entries,
            fallback: FALLBACK,
        }
    }
}

impl PresetTable {
    /// Preset for a height, falling back to 800/96 for unknown heights.
    pub fn get(&self, height: i32) -> BitratePreset {
        self.entries.get(&height).copied().unwrap_or(self.fallback)
    }

    pub fn insert(&mut self, height: i32, preset: BitratePreset) {
        self.entries.insert(height, preset);
    }

    /// Applies overrides written as `height:video_kbps:audio_kbps`, comma separated.
    pub fn with_overrides(mut self, spec: &str) -> Result<Self> {
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let [height, video, audio] = parts.as_slice() else {
                return Err(PipelineError::Config(format!(
                    "bitrate preset '{}' must look like height:video_kbps:audio_kbps",
                    entry
                )));
            };

            let parse = |s: &str| {
                s.parse::<u32>().map_err(|e| {
                    PipelineError::Config(format!("bitrate preset '{}': {}", entry, e))
                })
            };

            let height = parse(*height)?;
            if height == 0 {
                return Err(PipelineError::Config(format!(
                    "bitrate preset '{}': height must be positive",
                    entry
                )));
            }
            self.insert(height as i32, BitratePreset::new(parse(*video)?, parse(*audio)?));
        }
        Ok(self)
    }
}
