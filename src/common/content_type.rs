use std::path::Path;

pub const HLS_PLAYLIST: &str = "application/vnd.apple.mpegurl";
pub const MPEG_TS: &str = "video/MP2T";

/// Content type used when uploading an artifact, picked from its file name.
pub fn for_key(key: &str) -> String {
    let ext = Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("m3u8") => HLS_PLAYLIST.to_string(),
        Some("ts") => MPEG_TS.to_string(),
        _ => mime_guess::from_path(key).first_or_octet_stream().to_string(),
    }
}
