//! Master playlist generation and the storage layout of HLS artifacts.

use uuid::Uuid;

use crate::modules::transcode::presets::PresetTable;

pub const MASTER_MANIFEST_NAME: &str = "index.m3u8";

pub fn rendition_manifest_name(height: i32) -> String {
    format!("{}.m3u8", height)
}

/// ffmpeg segment filename template for a rendition (`240_%03d.ts`).
pub fn segment_template(height: i32) -> String {
    format!("{}_%03d.ts", height)
}

pub fn hls_prefix(video_id: Uuid) -> String {
    format!("HLS/{}", video_id)
}

pub fn rendition_manifest_key(video_id: Uuid, height: i32) -> String {
    format!("{}/{}", hls_prefix(video_id), rendition_manifest_name(height))
}

pub fn master_manifest_key(video_id: Uuid) -> String {
    format!("{}/{}", hls_prefix(video_id), MASTER_MANIFEST_NAME)
}

/// Builds the master playlist for the heights that encoded successfully.
///
/// Variants are always listed lowest height first (players pick the first
/// entry as the starting variant), whatever order the input is in.
pub fn build_master_manifest(heights: &[i32], presets: &PresetTable) -> String {
    let mut heights = heights.to_vec();
    heights.sort_unstable();
    heights.dedup();

    let mut lines = vec!["#EXTM3U".to_string(), "#EXT-X-VERSION:3".to_string()];
    for h in heights {
        let preset = presets.get(h);
        lines.push(format!("#EXT-X-STREAM-INF:BANDWIDTH={}", preset.bandwidth_bps()));
        lines.push(rendition_manifest_name(h));
    }

    let mut text = lines.join("\n");
    text.push('\n');
    text
}
