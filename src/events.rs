// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Recording event sink.
//!
//! The engine reports segment lifecycle transitions through this seam; the
//! durable store behind it (a database in full deployments) is an external
//! collaborator. The shipped implementation appends JSON lines so the events
//! survive restarts and can be tailed while debugging.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// Consumer of segment lifecycle events. Implementations must tolerate being
/// called from supervisor worker threads.
pub trait EventSink: Send + Sync {
    /// A segment file has been created and its first packet written.
    fn recording_started(&self, stream: &str, path: &Path);
    /// A segment file has been closed; `path` is the final on-disk location.
    fn recording_stopped(&self, stream: &str, path: &Path);
}

/// Sink that drops everything; used by tests and the `status`/`list`
/// subcommands.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn recording_started(&self, _stream: &str, _path: &Path) {}
    fn recording_stopped(&self, _stream: &str, _path: &Path) {}
}

#[derive(Serialize)]
struct EventRecord<'a> {
    ts: String,
    event: &'static str,
    stream: &'a str,
    path: String,
}

/// Append-only JSONL sink at `<storage>/events.jsonl`.
pub struct JsonlEventSink {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl JsonlEventSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path, file: Mutex::new(None) }
    }

    fn append(&self, event: &'static str, stream: &str, path: &Path) {
        let record = EventRecord {
            ts: Utc::now().to_rfc3339(),
            event,
            stream,
            path: path.display().to_string(),
        };
        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Failed to serialize event");
                return;
            }
        };

        let mut guard = self.file.lock();
        if guard.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Cannot open event log");
                    return;
                }
            }
        }
        if let Some(f) = guard.as_mut() {
            if let Err(e) = writeln!(f, "{line}") {
                warn!(path = %self.path.display(), error = %e, "Event append failed");
                // Reopen on the next event; the volume may have come back.
                *guard = None;
            }
        }
    }
}

impl EventSink for JsonlEventSink {
    fn recording_started(&self, stream: &str, path: &Path) {
        self.append("recording_start", stream, path);
    }

    fn recording_stopped(&self, stream: &str, path: &Path) {
        self.append("recording_stop", stream, path);
    }
}
