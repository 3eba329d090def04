// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NvrError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stream '{name}' not found")]
    StreamNotFound { name: String },

    #[error("Stream '{name}' is already running")]
    AlreadyRunning { name: String },

    #[error("All {max} supervisor slots are occupied")]
    NoSlot { max: usize },

    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("GStreamer error: {0}")]
    Gst(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source not found: {url}")]
    SourceNotFound { url: String },

    #[error("Video dimensions still unknown after probe window")]
    MissingDimensions,

    #[error("Audio codec '{codec}' is not MP4-compatible")]
    UnsupportedAudioCodec { codec: String },

    #[error("No space left on device while writing {path}")]
    DiskFull { path: String },

    #[error("Write failure on {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Segment aborted: {0}")]
    SegmentAborted(String),

    #[error("Writer registry error: {0}")]
    Registry(String),

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl NvrError {
    /// Coarse classification used by the supervisor to pick its next state and
    /// by the status API to describe the most recent failure.
    pub fn category(&self) -> ErrorCategory {
        match self {
            NvrError::Config(_) | NvrError::StreamNotFound { .. } => ErrorCategory::Config,
            NvrError::SourceNotFound { .. } => ErrorCategory::NotFound,
            NvrError::DiskFull { .. }
            | NvrError::WriteFailed { .. }
            | NvrError::UnsupportedAudioCodec { .. }
            | NvrError::MissingDimensions
            | NvrError::SegmentAborted(_) => ErrorCategory::SegmentFatal,
            NvrError::ShuttingDown => ErrorCategory::Interrupted,
            NvrError::AlreadyRunning { .. }
            | NvrError::NoSlot { .. }
            | NvrError::Registry(_)
            | NvrError::Worker(_) => ErrorCategory::SupervisorFatal,
            NvrError::Gst(_) | NvrError::Io(_) => ErrorCategory::Transient,
        }
    }
}

/// Failure category surfaced in the JSON status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    None,
    Config,
    NotFound,
    Transient,
    SegmentFatal,
    SupervisorFatal,
    Interrupted,
}

pub type Result<T> = std::result::Result<T, NvrError>;
