//! Output renditions and the object key layout of generated HLS assets
//!
//! ```text
//! hls/{stem}/master.m3u8
//! hls/{stem}/{label}/playlist.m3u8
//! hls/{stem}/{label}/seg_000.ts
//! ```

use std::path::Path;

/// One fixed-resolution output variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendition {
    /// Output height in pixels; width follows the source aspect ratio
    pub height: u32,
    pub label: &'static str,
}

/// Renditions produced for every job, in master playlist order
pub const RENDITIONS: [Rendition; 3] = [
    Rendition {
        height: 1080,
        label: "1080p",
    },
    Rendition {
        height: 720,
        label: "720p",
    },
    Rendition {
        height: 480,
        label: "480p",
    },
];

/// File name of every variant playlist
pub const PLAYLIST_FILE: &str = "playlist.m3u8";
/// File name of the master playlist
pub const MASTER_FILE: &str = "master.m3u8";

/// File stem of the last path component of a source key
#[must_use]
pub fn output_stem(source_key: &str) -> String {
    Path::new(source_key)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "source".to_string())
}

/// `hls/{stem}/{label}/`
#[must_use]
pub fn rendition_prefix(stem: &str, label: &str) -> String {
    format!("hls/{stem}/{label}/")
}

#[must_use]
pub fn playlist_key(stem: &str, label: &str) -> String {
    format!("{}{PLAYLIST_FILE}", rendition_prefix(stem, label))
}

#[must_use]
pub fn master_key(stem: &str) -> String {
    format!("hls/{stem}/{MASTER_FILE}")
}

/// Segment file name for a zero-based index, matching ffmpeg's `seg_%03d.ts`
#[must_use]
pub fn segment_name(index: usize) -> String {
    format!("seg_{index:03}.ts")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_stem() {
        assert_eq!(output_stem("videos/a.mp4"), "a");
        assert_eq!(output_stem("uploads/2024/trip.final.mov"), "trip.final");
        assert_eq!(output_stem("raw"), "raw");
        assert_eq!(output_stem(""), "source");
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(rendition_prefix("a", "720p"), "hls/a/720p/");
        assert_eq!(playlist_key("a", "720p"), "hls/a/720p/playlist.m3u8");
        assert_eq!(master_key("a"), "hls/a/master.m3u8");
        assert_eq!(segment_name(2), "seg_002.ts");
    }

    #[test]
    fn test_rendition_order() {
        let labels: Vec<_> = RENDITIONS.iter().map(|r| r.label).collect();
        assert_eq!(labels, ["1080p", "720p", "480p"]);
    }
}
