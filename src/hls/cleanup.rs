// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HLS output cleanup.
//!
//! For an active stream only leftovers are removed: stale `.m3u8.tmp` files
//! and fragments old enough that no current playlist can reference them.
//! For an inactive stream the directory is emptied of HLS artifacts.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::Result;

/// Fragments older than this cannot be referenced by any live window.
pub const ACTIVE_FRAGMENT_MAX_AGE: Duration = Duration::from_secs(300);

fn is_fragment(name: &str) -> bool {
    name.ends_with(".ts") || name.ends_with(".m4s")
}

fn is_playlist_artifact(name: &str) -> bool {
    name.contains(".m3u8") || name == "init.mp4"
}

/// Clean one stream's HLS directory. Returns the number of files removed.
pub fn cleanup_stream_dir(dir: &Path, active: bool) -> Result<u64> {
    let mut removed = 0u64;
    if !dir.is_dir() {
        return Ok(removed);
    }
    let now = SystemTime::now();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !entry.metadata().map(|m| m.is_file()).unwrap_or(false) {
            continue;
        }

        let delete = if active {
            if name.ends_with(".m3u8.tmp") {
                true
            } else if is_fragment(name) {
                entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| now.duration_since(t).ok())
                    .map(|age| age > ACTIVE_FRAGMENT_MAX_AGE)
                    .unwrap_or(false)
            } else {
                false
            }
        } else {
            is_fragment(name) || is_playlist_artifact(name)
        };

        if delete {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Cleanup removal failed"),
            }
        }
    }

    if removed > 0 {
        debug!(dir = %dir.display(), removed, active, "HLS directory cleaned");
    }
    Ok(removed)
}

/// Process-wide cleanup across every stream directory under `hls_base`.
/// `active_names` decides which rule set applies per directory.
pub fn cleanup_all(hls_base: &Path, active_names: &[String]) -> Result<u64> {
    let mut removed = 0u64;
    if !hls_base.is_dir() {
        return Ok(removed);
    }
    for entry in fs::read_dir(hls_base)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let active = active_names.iter().any(|n| n == name);
        removed += cleanup_stream_dir(&path, active)?;
    }
    Ok(removed)
}
