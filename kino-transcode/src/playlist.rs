//! M3U playlist generation and rewriting

use crate::rendition::segment_name;

/// Advertised bandwidth of every variant. Not measured from the output.
pub const PLACEHOLDER_BANDWIDTH: u32 = 800_000;

/// Segment duration requested from the encoder, in seconds
pub const SEGMENT_SECONDS: u32 = 6;

/// Build the master playlist, one stream entry per variant playlist URI in
/// the given order
#[must_use]
pub fn master_playlist<'a>(variant_uris: impl IntoIterator<Item = &'a str>) -> String {
    let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for uri in variant_uris {
        playlist.push_str(&format!("#EXT-X-STREAM-INF:BANDWIDTH={PLACEHOLDER_BANDWIDTH}\n"));
        playlist.push_str(uri);
        playlist.push('\n');
    }
    playlist
}

/// VOD playlist listing `segment_count` segments of [`SEGMENT_SECONDS`] each
#[must_use]
pub fn vod_playlist(segment_count: usize) -> String {
    let mut playlist = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{SEGMENT_SECONDS}\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:VOD\n"
    );
    for index in 0..segment_count {
        playlist.push_str(&format!("#EXTINF:{SEGMENT_SECONDS}.0,\n{}\n", segment_name(index)));
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
    playlist
}

/// URI lines of a media playlist, in order
pub fn segment_uris(playlist: &str) -> impl Iterator<Item = &str> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

/// Replace every URI line for which `resolve` returns a value. Tags and
/// unresolved URIs are kept as they are.
#[must_use]
pub fn rewrite_segment_uris(playlist: &str, resolve: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(playlist.len());
    for line in playlist.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            match resolve(trimmed) {
                Some(uri) => out.push_str(&uri),
                None => out.push_str(line),
            }
        }
        out.push('\n');
    }
    out
}
