// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! RTSP ingest: the seam between the supervisor and the live source.
//!
//! The supervisor sees a single blocking [`PacketSource::read`] that is
//! interruptible from any thread through the shutdown flags. The production
//! implementation wraps a GStreamer RTSP pipeline; tests drive the
//! supervisor with scripted sources.

pub mod rtsp;
pub mod sps;

use std::time::Duration;

use crate::config::{StreamConfig, Transport};
use crate::error::Result;
use crate::packet::{CodecParams, MediaPacket};
use crate::shutdown::Interrupter;

/// Result of one blocking read.
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(MediaPacket),
    /// Nothing arrived within the caller's patience; retry or reconnect.
    Again,
    /// The source closed the stream.
    Eof,
    /// A shutdown flag unwound the read.
    Interrupted,
    /// The transport failed; the connection is unusable.
    Fatal(String),
}

/// Result of the lightweight reachability probe. The probe is best-effort:
/// `Unknown` means the answer could not be determined and the caller should
/// proceed to a full open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    NotFound,
    Unknown,
}

/// A connected, probed source delivering demuxed packets.
pub trait PacketSource: Send {
    /// Codec parameters probed at connect time. Dimensions are guaranteed
    /// non-zero; sources that cannot recover them fail to open instead.
    fn codec_params(&self) -> &CodecParams;

    /// Block for up to `timeout` waiting for the next packet. Polls the
    /// interrupt flags while waiting.
    fn read(&mut self, timeout: Duration) -> ReadOutcome;

    /// Tear the connection down. Also called implicitly on drop.
    fn close(&mut self);
}

/// Opens sources; the supervisor re-invokes this on reconnect and on the
/// periodic reset, preserving URL and protocol choice.
pub trait SourceFactory: Send + Sync {
    fn probe(&self, url: &str) -> ProbeOutcome;
    fn open(&self, cfg: &StreamConfig, interrupter: Interrupter) -> Result<Box<dyn PacketSource>>;
}

/// Per-transport connection tuning, defaults per the deployment experience
/// baked into the config notes: TCP favors short socket timeouts, UDP needs
/// large receive buffers, ONVIF devices need generous timeouts.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub latency_ms: u32,
    pub socket_timeout: Duration,
    pub udp_buffer_bytes: i32,
    pub force_tcp: bool,
    pub multicast: bool,
    pub credentials: Option<(String, String)>,
}

impl ConnectOptions {
    pub fn for_stream(cfg: &StreamConfig) -> Self {
        let onvif = cfg.onvif || cfg.url.contains("onvif");
        let multicast = cfg.protocol == Transport::Udp && rtsp::is_multicast_url(&cfg.url);
        let socket_timeout = if onvif {
            Duration::from_secs(15)
        } else if cfg.protocol == Transport::Tcp {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(10)
        };
        let credentials = if onvif { rtsp::parse_userinfo(&cfg.url) } else { None };
        Self {
            latency_ms: 200,
            socket_timeout,
            udp_buffer_bytes: 16 * 1024 * 1024,
            force_tcp: onvif || cfg.protocol == Transport::Tcp,
            multicast,
            credentials,
        }
    }
}
