use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{NvrError, Result};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// List of streams to record.
    pub streams: Vec<StreamConfig>,
    /// HTTP API configuration (optional).
    #[serde(default)]
    pub api: ApiConfig,
}

/// HTTP API configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Whether to enable the HTTP API.
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    /// Port to listen on.
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: default_api_enabled(), port: default_api_port() }
    }
}

fn default_api_enabled() -> bool { true }
fn default_api_port() -> u16 { 8080 }

/// Storage roots for recordings and HLS output.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Base directory; recordings land in `<storage_path>/mp4/<stream>` and
    /// HLS output in `<storage_path>/hls/<stream>` unless overridden below.
    pub storage_path: PathBuf,
    /// Optional override replacing `<storage_path>/hls`.
    #[serde(default)]
    pub storage_path_hls: Option<PathBuf>,
    /// Optional override replacing `<storage_path>/mp4`.
    #[serde(default)]
    pub mp4_storage_path: Option<PathBuf>,
    /// Record MP4 segments from the RTSP source directly. When disabled only
    /// the HLS output is produced.
    #[serde(default = "default_record_mp4")]
    pub record_mp4_directly: bool,
}

/// Transport preference for the RTSP connection.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Default for Transport {
    fn default() -> Self { Transport::Tcp }
}

/// What causes recording for this stream to start.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Record continuously from process start.
    Scheduled,
    /// Started on demand by a motion event.
    Motion,
    /// Started on demand by an external event.
    Event,
}

impl Default for TriggerType {
    fn default() -> Self { TriggerType::Scheduled }
}

/// Per-stream configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreamConfig {
    /// Unique identifier used for directory/file naming. Max 63 bytes.
    pub name: String,
    /// RTSP URL of the source.
    pub url: String,
    /// Transport preference.
    #[serde(default)]
    pub protocol: Transport,
    /// Duration of a single MP4 segment in seconds. Minimum 2.
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u64,
    /// Whether the audio substream is recorded.
    #[serde(default)]
    pub has_audio: bool,
    /// Recording trigger.
    #[serde(default)]
    pub trigger: TriggerType,
    /// Marks an ONVIF source; connection options are relaxed for these.
    #[serde(default)]
    pub onvif: bool,
}

fn default_segment_duration() -> u64 { 900 }
fn default_record_mp4() -> bool { true }

/// Hard floor for `segment_duration`; shorter segments thrash the muxer.
pub const MIN_SEGMENT_DURATION: u64 = 2;
/// Stream names are embedded in paths and the registry slot table.
pub const MAX_STREAM_NAME_LEN: usize = 63;

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NvrError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| NvrError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a stream by name.
    pub fn stream(&self, name: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(NvrError::Config("No streams defined".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for s in &self.streams {
            if s.name.is_empty() {
                return Err(NvrError::Config("Stream name must not be empty".into()));
            }
            if s.name.len() > MAX_STREAM_NAME_LEN {
                return Err(NvrError::Config(format!(
                    "Stream name '{}' exceeds {MAX_STREAM_NAME_LEN} bytes", s.name
                )));
            }
            if s.name.contains('/') || s.name.contains("..") {
                return Err(NvrError::Config(format!(
                    "Stream name '{}' must not contain path separators", s.name
                )));
            }
            if !seen.insert(s.name.as_str()) {
                return Err(NvrError::Config(format!("Duplicate stream name '{}'", s.name)));
            }
            if s.url.is_empty() {
                return Err(NvrError::Config(format!("Stream '{}' has no URL", s.name)));
            }
            if s.segment_duration < MIN_SEGMENT_DURATION {
                return Err(NvrError::Config(format!(
                    "Stream '{}': segment_duration must be >= {MIN_SEGMENT_DURATION}", s.name
                )));
            }
        }
        Ok(())
    }
}
