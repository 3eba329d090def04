// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage layout and filesystem plumbing.
//!
//! Directory creation walks path components and sets mode 0777 on each one
//! it creates; segment and playlist files get mode 0666. No shell-outs:
//! paths with spaces must work.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::config::StorageConfig;
use crate::error::{NvrError, Result};

/// Marker file dropped in the HLS base to confirm the parent is writable.
pub const HLS_PARENT_CHECK: &str = ".hls_parent_check";

const DIR_MODE: u32 = 0o777;
const FILE_MODE: u32 = 0o666;

/// Resolved storage roots for one process.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    mp4_base: PathBuf,
    hls_base: PathBuf,
}

impl StorageLayout {
    pub fn from_config(cfg: &StorageConfig) -> Self {
        let root = cfg.storage_path.clone();
        let mp4_base = cfg
            .mp4_storage_path
            .clone()
            .unwrap_or_else(|| root.join("mp4"));
        let hls_base = cfg
            .storage_path_hls
            .clone()
            .unwrap_or_else(|| root.join("hls"));
        Self { root, mp4_base, hls_base }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mp4_base(&self) -> &Path {
        &self.mp4_base
    }

    pub fn hls_base(&self) -> &Path {
        &self.hls_base
    }

    pub fn stream_mp4_dir(&self, stream: &str) -> PathBuf {
        self.mp4_base.join(stream)
    }

    pub fn stream_hls_dir(&self, stream: &str) -> PathBuf {
        self.hls_base.join(stream)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }
}

/// Build a segment path from the local wall-clock time:
/// `recording_YYYYMMDD_HHMMSS.mp4`.
pub fn recording_path(dir: &Path, at: DateTime<Local>) -> PathBuf {
    dir.join(format!("recording_{}.mp4", at.format("%Y%m%d_%H%M%S")))
}

/// Create `path` and any missing parents, component by component, applying
/// mode 0777 to each directory this call creates.
pub fn create_dir_all_mode(path: &Path) -> Result<()> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if current.as_os_str().is_empty() || current.is_dir() {
            continue;
        }
        match fs::create_dir(&current) {
            Ok(()) => {
                let perms = fs::Permissions::from_mode(DIR_MODE);
                fs::set_permissions(&current, perms)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(NvrError::Config(format!(
                    "Cannot create directory {}: {e}",
                    current.display()
                )));
            }
        }
    }
    Ok(())
}

/// Apply the world-writable file mode used for segments and playlists.
pub fn set_output_file_mode(path: &Path) -> Result<()> {
    let perms = fs::Permissions::from_mode(FILE_MODE);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Verify `dir` exists, is a directory, and is writable; create it if
/// missing. Writability is proven by creating and removing a probe file.
pub fn ensure_writable_dir(dir: &Path) -> Result<()> {
    if dir.exists() && !dir.is_dir() {
        return Err(NvrError::Config(format!(
            "{} exists but is not a directory",
            dir.display()
        )));
    }
    create_dir_all_mode(dir)?;
    let probe = dir.join(".write_check");
    fs::write(&probe, b"")
        .map_err(|e| NvrError::Config(format!("{} is not writable: {e}", dir.display())))?;
    let _ = fs::remove_file(&probe);
    Ok(())
}

/// Drop the HLS parent marker file confirming the base directory accepts
/// writes before any supervisor starts producing fragments.
pub fn touch_hls_parent_check(hls_base: &Path) -> Result<()> {
    create_dir_all_mode(hls_base)?;
    let marker = hls_base.join(HLS_PARENT_CHECK);
    fs::write(&marker, b"")?;
    set_output_file_mode(&marker)?;
    Ok(())
}
