// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Recording catalog: finished segments are plain files on disk, listed by
//! parsing their filenames back to timestamps. Files truncated by a crash
//! stay listed with their actual on-disk byte count.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::Result;

const PREFIX: &str = "recording_";
const EXTENSION: &str = "mp4";

/// One finished (or truncated) segment file.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingEntry {
    pub file_name: String,
    pub path: PathBuf,
    /// Local wall-clock start time parsed from the filename.
    pub started_at: NaiveDateTime,
    pub size_bytes: u64,
}

/// Parse `recording_YYYYMMDD_HHMMSS.mp4` back into its start time.
pub fn parse_recording_name(file_name: &str) -> Option<NaiveDateTime> {
    let stem = file_name.strip_prefix(PREFIX)?.strip_suffix(".mp4")?;
    NaiveDateTime::parse_from_str(stem, "%Y%m%d_%H%M%S").ok()
}

/// List recordings under `dir`, oldest first. Non-matching files are
/// ignored; a missing directory yields an empty list.
pub fn list_recordings(dir: &Path) -> Result<Vec<RecordingEntry>> {
    let mut entries = Vec::new();
    if !dir.is_dir() {
        return Ok(entries);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map(|e| e != EXTENSION).unwrap_or(true) {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(started_at) = parse_recording_name(file_name) else {
            continue;
        };
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        entries.push(RecordingEntry {
            file_name: file_name.to_string(),
            path: path.clone(),
            started_at,
            size_bytes,
        });
    }
    entries.sort_by_key(|e| e.started_at);
    Ok(entries)
}
