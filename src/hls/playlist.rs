//! Live HLS playlist rendering and atomic publication.
//!
//! The playlist on disk is only ever replaced via rename from a temp file in
//! the same directory, so an HTTP reader either sees the previous complete
//! playlist or the new complete playlist, never a torn write.

use std::fmt::Write as FmtWrite;
use std::fs;
use std::path::Path;

use crate::error::{NvrError, Result};
use crate::storage::paths::set_output_file_mode;

pub const PLAYLIST_NAME: &str = "index.m3u8";
pub const PLAYLIST_TMP_NAME: &str = "index.m3u8.tmp";

/// One fragment referenced by the sliding window.
#[derive(Debug, Clone)]
pub struct FragmentMeta {
    pub file_name: String,
    pub duration_secs: f64,
    pub sequence: u64,
}

/// Render the sliding-window playlist for the given fragments.
pub fn render_live_playlist(target_duration_secs: u64, fragments: &[FragmentMeta]) -> String {
    let media_sequence = fragments.first().map(|f| f.sequence).unwrap_or(0);
    // TARGETDURATION must be >= the longest fragment, rounded up.
    let max_fragment = fragments
        .iter()
        .map(|f| f.duration_secs.ceil() as u64)
        .max()
        .unwrap_or(0);
    let target = target_duration_secs.max(max_fragment).max(1);

    let mut m3u8 = String::with_capacity(1024);
    writeln!(m3u8, "#EXTM3U").unwrap();
    writeln!(m3u8, "#EXT-X-VERSION:3").unwrap();
    writeln!(m3u8, "#EXT-X-TARGETDURATION:{}", target).unwrap();
    writeln!(m3u8, "#EXT-X-MEDIA-SEQUENCE:{}", media_sequence).unwrap();
    for frag in fragments {
        writeln!(m3u8, "#EXTINF:{:.3},", frag.duration_secs).unwrap();
        writeln!(m3u8, "{}", frag.file_name).unwrap();
    }
    m3u8
}

/// Write the playlist to `<dir>/index.m3u8.tmp` and rename it over
/// `<dir>/index.m3u8`.
pub fn publish_playlist(dir: &Path, content: &str) -> Result<()> {
    let tmp = dir.join(PLAYLIST_TMP_NAME);
    let dst = dir.join(PLAYLIST_NAME);
    fs::write(&tmp, content).map_err(|e| match e.kind() {
        std::io::ErrorKind::StorageFull => NvrError::DiskFull { path: tmp.display().to_string() },
        _ => NvrError::Io(e),
    })?;
    set_output_file_mode(&tmp)?;
    fs::rename(&tmp, &dst)?;
    Ok(())
}
