// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Demuxed packet and codec-parameter types shared by ingest, the MP4
//! recorder, and the HLS muxer.
//!
//! All timestamps are expressed in 90 kHz ticks, the RTP video clock rate.
//! Conversions to the muxer's nanosecond clock happen at the muxer boundary.

use bytes::Bytes;

/// Ticks per second for all packet timestamps.
pub const TIME_BASE: i64 = 90_000;

/// Which elementary stream a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// One demuxed access unit.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: StreamKind,
    /// Raw access-unit payload (Annex B byte-stream for video, ADTS-less AAC
    /// frames for audio). Cheap to clone; rotation carry-over relies on this.
    pub data: Bytes,
    /// Presentation timestamp in ticks, if the source supplied one.
    pub pts: Option<i64>,
    /// Decode timestamp in ticks, if the source supplied one.
    pub dts: Option<i64>,
    /// Duration in ticks. 0 means unknown and will be filled by the recorder.
    pub duration: i64,
    /// Set for video packets decodable without reference to others.
    pub keyframe: bool,
}

impl MediaPacket {
    pub fn video(data: Bytes, pts: Option<i64>, dts: Option<i64>, keyframe: bool) -> Self {
        Self { kind: StreamKind::Video, data, pts, dts, duration: 0, keyframe }
    }

    pub fn audio(data: Bytes, pts: Option<i64>, dts: Option<i64>) -> Self {
        Self { kind: StreamKind::Audio, data, pts, dts, duration: 0, keyframe: false }
    }

    /// Packets with no payload are dropped before they reach any muxer.
    pub fn is_valid(&self) -> bool {
        !self.data.is_empty()
    }
}

/// Video codec carried by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub fn name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
        }
    }
}

/// Audio codec carried by the source. Only AAC is MP4-compatible here; PCM
/// variants are expected to be transcoded upstream before packets arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Unsupported(String),
}

impl AudioCodec {
    pub fn name(&self) -> &str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Unsupported(name) => name,
        }
    }
}

/// Video stream parameters probed from the source.
#[derive(Debug, Clone)]
pub struct VideoParams {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// SPS/PPS (and VPS for H.265) as captured from caps or in-band NAL
    /// units. May be empty; the muxer then emits the file with a warning.
    pub extradata: Bytes,
    /// Frames per second as a rational, (0, 1) if unknown.
    pub frame_rate: (i32, i32),
}

impl VideoParams {
    /// Dimensions must be recovered before any MP4 header is written.
    pub fn has_dimensions(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Duration of one frame in ticks, used to fill missing packet durations.
    pub fn frame_duration(&self) -> i64 {
        let (num, den) = self.frame_rate;
        if num > 0 && den > 0 {
            (TIME_BASE * i64::from(den)) / i64::from(num)
        } else {
            1
        }
    }
}

/// Audio stream parameters probed from the source.
#[derive(Debug, Clone)]
pub struct AudioParams {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    /// Samples per frame; 1024 for AAC.
    pub frame_size: u32,
}

impl AudioParams {
    /// Duration of one audio frame in ticks.
    pub fn frame_duration(&self) -> i64 {
        if self.sample_rate > 0 && self.frame_size > 0 {
            (TIME_BASE * i64::from(self.frame_size)) / i64::from(self.sample_rate)
        } else {
            1
        }
    }
}

/// Everything the muxers need to reproduce the source streams bit-exact.
#[derive(Debug, Clone)]
pub struct CodecParams {
    pub video: VideoParams,
    pub audio: Option<AudioParams>,
}
