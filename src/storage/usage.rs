// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage usage accounting: a plain directory walk summing file sizes and
//! counting recordings. Replaces shelling out to `du`/`find`, which breaks
//! on paths with spaces and is exposed to argument injection.

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::Result;

/// Aggregate usage under one directory tree.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageReport {
    pub total_bytes: u64,
    pub file_count: u64,
    /// Files ending in `.mp4`.
    pub mp4_count: u64,
}

/// Walk `dir` recursively. Missing directories report zero usage rather than
/// an error so a fresh install shows an empty status instead of failing.
pub fn scan(dir: &Path) -> Result<UsageReport> {
    let mut report = UsageReport::default();
    if !dir.is_dir() {
        return Ok(report);
    }
    walk(dir, &mut report)?;
    Ok(report)
}

fn walk(dir: &Path, report: &mut UsageReport) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk(&path, report)?;
        } else if meta.is_file() {
            report.total_bytes += meta.len();
            report.file_count += 1;
            if path.extension().map(|e| e == "mp4").unwrap_or(false) {
                report.mp4_count += 1;
            }
        }
    }
    Ok(())
}
