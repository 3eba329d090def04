// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! GStreamer-backed RTSP source.
//!
//! Pipeline per stream:
//!
//! ```text
//!   rtspsrc ─┬─ rtph264depay ─ h264parse ─ appsink   (video)
//!            └─ rtpmp4gdepay ─ aacparse ─ appsink    (audio, optional)
//! ```
//!
//! Pads appear dynamically once the RTSP session is described; the
//! `pad-added` handler builds the matching depay chain. Parsed access units
//! flow through a bounded channel; `read` drains it in short slices so the
//! shutdown flags are observed within ~100 ms even while no packets arrive.

use std::io::{Read as IoRead, Write as IoWrite};
use std::net::{Ipv4Addr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, warn};

use crate::config::{StreamConfig, Transport};
use crate::error::{NvrError, Result};
use crate::ingest::{sps, ConnectOptions, PacketSource, ProbeOutcome, ReadOutcome, SourceFactory};
use crate::packet::{
    AudioCodec, AudioParams, CodecParams, MediaPacket, StreamKind, VideoCodec, VideoParams,
    TIME_BASE,
};
use crate::shutdown::Interrupter;

/// Wall-clock budget for recovering video dimensions after connect.
const DIMENSION_PROBE_BUDGET: Duration = Duration::from_secs(60);
/// After this long with only audio arriving, log the keyframe-starvation
/// signature once.
const AUDIO_ONLY_LOG_AFTER: Duration = Duration::from_secs(10);
/// Channel capacity between the appsink callbacks and `read`.
const CHANNEL_CAPACITY: usize = 256;

// ───────────────────────────── URL helpers ───────────────────────────────────

/// Extract `(host, port)` from an `rtsp://` URL. Port defaults to 554.
pub fn parse_host_port(url: &str) -> Option<(String, u16)> {
    let rest = url.strip_prefix("rtsp://")?;
    let authority = rest.split('/').next()?;
    let host_port = authority.rsplit('@').next()?;
    match host_port.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((host_port.to_string(), 554)),
    }
}

/// Extract embedded `user:pass@` credentials, if any.
pub fn parse_userinfo(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("rtsp://")?;
    let authority = rest.split('/').next()?;
    let (userinfo, _) = authority.rsplit_once('@')?;
    let (user, pass) = userinfo.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// True when the URL's host is a dotted-quad multicast destination
/// (224.0.0.0/4).
pub fn is_multicast_url(url: &str) -> bool {
    parse_host_port(url)
        .and_then(|(host, _)| host.parse::<Ipv4Addr>().ok())
        .map(|ip| ip.is_multicast())
        .unwrap_or(false)
}

// ───────────────────────────── reachability probe ────────────────────────────

/// Best-effort reachability check: resolve the host, open a TCP socket with a
/// 1 s budget, send a minimal OPTIONS request, and look at whatever comes
/// back. A `404 Not Found` answer is authoritative; any other response
/// proves reachability. Socket or DNS failures are inconclusive; the full
/// demuxer open retries on its own.
pub fn probe_reachability(url: &str, budget: Duration) -> ProbeOutcome {
    let Some((host, port)) = parse_host_port(url) else {
        return ProbeOutcome::Unknown;
    };
    let Ok(mut addrs) = (host.as_str(), port).to_socket_addrs() else {
        return ProbeOutcome::Unknown;
    };
    let Some(addr) = addrs.next() else {
        return ProbeOutcome::Unknown;
    };
    let Ok(mut socket) = TcpStream::connect_timeout(&addr, budget) else {
        return ProbeOutcome::Unknown;
    };
    let _ = socket.set_read_timeout(Some(budget));
    let _ = socket.set_write_timeout(Some(budget));

    let request = format!("OPTIONS {url} RTSP/1.0\r\nCSeq: 1\r\n\r\n");
    if socket.write_all(request.as_bytes()).is_err() {
        return ProbeOutcome::Unknown;
    }

    let mut buf = [0u8; 512];
    match socket.read(&mut buf) {
        Ok(n) if n > 0 => {
            let response = String::from_utf8_lossy(&buf[..n]);
            if response.contains("404 Not Found") {
                ProbeOutcome::NotFound
            } else {
                ProbeOutcome::Reachable
            }
        }
        _ => ProbeOutcome::Unknown,
    }
}

// ───────────────────────────── source events ─────────────────────────────────

#[derive(Debug)]
enum SourceEvent {
    Packet(MediaPacket),
    VideoCaps { codec: VideoCodec, width: u32, height: u32, frame_rate: (i32, i32) },
    AudioCaps { codec: AudioCodec, sample_rate: u32 },
    Error(String),
    Eos,
}

fn clocktime_to_ticks(t: Option<gst::ClockTime>) -> Option<i64> {
    t.map(|t| (t.nseconds() as i128 * TIME_BASE as i128 / 1_000_000_000) as i64)
}

// ───────────────────────────── pipeline construction ─────────────────────────

fn make_element(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| NvrError::Gst(format!("create {factory}: {e}")))
}

/// Build the depay chain for one dynamic rtspsrc pad and hand its output to
/// the event channel.
fn link_rtp_pad(
    pipeline: &gst::Pipeline,
    pad: &gst::Pad,
    tx: &SyncSender<SourceEvent>,
) -> Result<()> {
    let caps = pad
        .current_caps()
        .ok_or_else(|| NvrError::Gst("rtspsrc pad without caps".into()))?;
    let s = caps
        .structure(0)
        .ok_or_else(|| NvrError::Gst("empty caps".into()))?;
    let media = s.get::<String>("media").unwrap_or_default();
    let encoding = s.get::<String>("encoding-name").unwrap_or_default();

    match (media.as_str(), encoding.as_str()) {
        ("video", "H264") => build_video_chain(pipeline, pad, tx, VideoCodec::H264),
        ("video", "H265") => build_video_chain(pipeline, pad, tx, VideoCodec::H265),
        ("audio", "MPEG4-GENERIC") | ("audio", "MP4A-LATM") => {
            build_audio_chain(pipeline, pad, tx, &encoding)
        }
        ("audio", other) => {
            // PCM and friends cannot reach the MP4 writer; report the codec
            // so the header-write path can name it, and swallow the pad.
            let _ = tx.try_send(SourceEvent::AudioCaps {
                codec: AudioCodec::Unsupported(other.to_ascii_lowercase()),
                sample_rate: s.get::<i32>("clock-rate").unwrap_or(0).max(0) as u32,
            });
            let sink = make_element("fakesink")?;
            pipeline
                .add(&sink)
                .map_err(|e| NvrError::Gst(format!("add fakesink: {e}")))?;
            let sinkpad = sink
                .static_pad("sink")
                .ok_or_else(|| NvrError::Gst("fakesink has no sink pad".into()))?;
            pad.link(&sinkpad)
                .map_err(|e| NvrError::Gst(format!("link fakesink: {e:?}")))?;
            sink.sync_state_with_parent()
                .map_err(|e| NvrError::Gst(format!("sync fakesink: {e}")))?;
            Ok(())
        }
        (media, encoding) => {
            debug!(media, encoding, "Ignoring unsupported RTP substream");
            Ok(())
        }
    }
}

fn build_video_chain(
    pipeline: &gst::Pipeline,
    pad: &gst::Pad,
    tx: &SyncSender<SourceEvent>,
    codec: VideoCodec,
) -> Result<()> {
    let (depay_name, parse_name, caps_name) = match codec {
        VideoCodec::H264 => ("rtph264depay", "h264parse", "video/x-h264"),
        VideoCodec::H265 => ("rtph265depay", "h265parse", "video/x-h265"),
    };
    let depay = make_element(depay_name)?;
    let parse = make_element(parse_name)?;
    // Re-emit SPS/PPS with every keyframe so segments opened mid-stream are
    // self-contained.
    parse.set_property("config-interval", -1i32);

    let appsink = gst_app::AppSink::builder()
        .caps(
            &gst::Caps::builder(caps_name)
                .field("stream-format", "byte-stream")
                .field("alignment", "au")
                .build(),
        )
        .max_buffers(64)
        .drop(false)
        .sync(false)
        .build();

    let tx_cb = tx.clone();
    let caps_sent = Arc::new(AtomicBool::new(false));
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                if !caps_sent.swap(true, Ordering::AcqRel) {
                    if let Some(caps) = sample.caps() {
                        if let Some(ev) = video_caps_event(caps, codec) {
                            let _ = tx_cb.try_send(ev);
                        }
                    }
                }
                let buf = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buf.map_readable().map_err(|_| gst::FlowError::Error)?;
                let keyframe = !buf.flags().contains(gst::BufferFlags::DELTA_UNIT);
                let pkt = MediaPacket::video(
                    Bytes::copy_from_slice(map.as_slice()),
                    clocktime_to_ticks(buf.pts()),
                    clocktime_to_ticks(buf.dts()),
                    keyframe,
                );
                // Bounded channel; drop rather than stall the pipeline.
                let _ = tx_cb.try_send(SourceEvent::Packet(pkt));
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );

    attach_chain(pipeline, pad, &[&depay, &parse, appsink.upcast_ref::<gst::Element>()])
}

fn build_audio_chain(
    pipeline: &gst::Pipeline,
    pad: &gst::Pad,
    tx: &SyncSender<SourceEvent>,
    encoding: &str,
) -> Result<()> {
    let depay_name = if encoding == "MP4A-LATM" { "rtpmp4adepay" } else { "rtpmp4gdepay" };
    let depay = make_element(depay_name)?;
    let parse = make_element("aacparse")?;

    let appsink = gst_app::AppSink::builder()
        .caps(
            &gst::Caps::builder("audio/mpeg")
                .field("mpegversion", 4i32)
                .field("stream-format", "adts")
                .build(),
        )
        .max_buffers(64)
        .drop(false)
        .sync(false)
        .build();

    let tx_cb = tx.clone();
    let caps_sent = Arc::new(AtomicBool::new(false));
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                if !caps_sent.swap(true, Ordering::AcqRel) {
                    if let Some(caps) = sample.caps() {
                        if let Some(s) = caps.structure(0) {
                            let _ = tx_cb.try_send(SourceEvent::AudioCaps {
                                codec: AudioCodec::Aac,
                                sample_rate: s.get::<i32>("rate").unwrap_or(0).max(0) as u32,
                            });
                        }
                    }
                }
                let buf = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buf.map_readable().map_err(|_| gst::FlowError::Error)?;
                let pkt = MediaPacket::audio(
                    Bytes::copy_from_slice(map.as_slice()),
                    clocktime_to_ticks(buf.pts()),
                    clocktime_to_ticks(buf.dts()),
                );
                let _ = tx_cb.try_send(SourceEvent::Packet(pkt));
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );

    attach_chain(pipeline, pad, &[&depay, &parse, appsink.upcast_ref::<gst::Element>()])
}

fn attach_chain(
    pipeline: &gst::Pipeline,
    pad: &gst::Pad,
    elements: &[&gst::Element],
) -> Result<()> {
    pipeline
        .add_many(elements.iter().copied())
        .map_err(|e| NvrError::Gst(format!("add chain: {e}")))?;
    gst::Element::link_many(elements.iter().copied())
        .map_err(|e| NvrError::Gst(format!("link chain: {e}")))?;
    let sinkpad = elements[0]
        .static_pad("sink")
        .ok_or_else(|| NvrError::Gst("chain head has no sink pad".into()))?;
    pad.link(&sinkpad)
        .map_err(|e| NvrError::Gst(format!("link rtspsrc pad: {e:?}")))?;
    for element in elements {
        element
            .sync_state_with_parent()
            .map_err(|e| NvrError::Gst(format!("sync chain element: {e}")))?;
    }
    Ok(())
}

fn video_caps_event(caps: &gst::CapsRef, codec: VideoCodec) -> Option<SourceEvent> {
    let s = caps.structure(0)?;
    let width = s.get::<i32>("width").unwrap_or(0).max(0) as u32;
    let height = s.get::<i32>("height").unwrap_or(0).max(0) as u32;
    let frame_rate = s
        .get::<gst::Fraction>("framerate")
        .map(|f| (f.numer(), f.denom()))
        .unwrap_or((0, 1));
    Some(SourceEvent::VideoCaps { codec, width, height, frame_rate })
}

// ───────────────────────────── GstRtspSource ─────────────────────────────────

pub struct GstRtspSource {
    pipeline: gst::Pipeline,
    rx: Receiver<SourceEvent>,
    params: CodecParams,
    interrupter: Interrupter,
    closed: bool,
}

impl GstRtspSource {
    pub fn open(
        cfg: &StreamConfig,
        options: &ConnectOptions,
        interrupter: Interrupter,
    ) -> Result<Self> {
        gst::init().map_err(|e| NvrError::Gst(format!("gst::init: {e}")))?;

        let (tx, rx) = sync_channel::<SourceEvent>(CHANNEL_CAPACITY);
        let pipeline = gst::Pipeline::new();

        let mut builder = gst::ElementFactory::make("rtspsrc")
            .property("location", cfg.url.as_str())
            .property("latency", options.latency_ms)
            .property("tcp-timeout", options.socket_timeout.as_micros() as u64)
            .property("timeout", options.socket_timeout.as_micros() as u64)
            .property("do-rtsp-keep-alive", true);
        if let Some((user, pass)) = &options.credentials {
            builder = builder
                .property("user-id", user.as_str())
                .property("user-pw", pass.as_str());
        }
        if cfg.protocol == Transport::Udp {
            builder = builder.property("buffer-size", options.udp_buffer_bytes);
        }
        let protocols = if options.force_tcp {
            "tcp"
        } else if options.multicast {
            "udp-mcast"
        } else {
            "udp"
        };
        let rtspsrc = builder
            .property_from_str("protocols", protocols)
            .build()
            .map_err(|e| NvrError::Gst(format!("create rtspsrc: {e}")))?;

        pipeline
            .add(&rtspsrc)
            .map_err(|e| NvrError::Gst(format!("add rtspsrc: {e}")))?;

        let pipeline_weak = pipeline.downgrade();
        let tx_pad = tx.clone();
        rtspsrc.connect_pad_added(move |_src, pad| {
            let Some(pipeline) = pipeline_weak.upgrade() else {
                return;
            };
            if let Err(e) = link_rtp_pad(&pipeline, pad, &tx_pad) {
                warn!(error = %e, "Failed to link RTP pad");
                let _ = tx_pad.try_send(SourceEvent::Error(e.to_string()));
            }
        });

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| NvrError::Gst(format!("set_state Playing: {e}")))?;

        let mut source = Self {
            pipeline,
            rx,
            params: CodecParams {
                video: VideoParams {
                    codec: VideoCodec::H264,
                    width: 0,
                    height: 0,
                    extradata: Bytes::new(),
                    frame_rate: (0, 1),
                },
                audio: None,
            },
            interrupter,
            closed: false,
        };

        match source.probe_params(cfg) {
            Ok(()) => Ok(source),
            Err(e) => {
                source.close();
                Err(e)
            }
        }
    }

    /// Wait for codec parameters, recovering dimensions from in-band SPS
    /// when the transport-level caps report 0x0. Gives up after the probe
    /// budget rather than producing unplayable placeholder files.
    fn probe_params(&mut self, cfg: &StreamConfig) -> Result<()> {
        let started = Instant::now();
        let mut audio_only_logged = false;
        let mut saw_video_packet = false;

        while started.elapsed() < DIMENSION_PROBE_BUDGET {
            if self.interrupter.is_interrupted() {
                return Err(NvrError::ShuttingDown);
            }
            if let Some(err) = self.poll_bus_error() {
                return Err(NvrError::Gst(err));
            }

            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(SourceEvent::VideoCaps { codec, width, height, frame_rate }) => {
                    self.params.video.codec = codec;
                    self.params.video.frame_rate = frame_rate;
                    if width > 0 && height > 0 {
                        self.params.video.width = width;
                        self.params.video.height = height;
                    }
                }
                Ok(SourceEvent::AudioCaps { codec, sample_rate }) => {
                    self.params.audio = Some(AudioParams {
                        codec,
                        sample_rate,
                        frame_size: 1024,
                    });
                }
                Ok(SourceEvent::Packet(pkt)) => match pkt.kind {
                    StreamKind::Video => {
                        saw_video_packet = true;
                        if self.params.video.extradata.is_empty() {
                            if let Some(ps) = sps::extract_parameter_sets(&pkt.data) {
                                self.params.video.extradata = ps;
                            }
                        }
                        if !self.params.video.has_dimensions() {
                            if let Some((w, h)) = sps::find_dimensions(&pkt.data) {
                                info!(
                                    stream = cfg.name,
                                    width = w,
                                    height = h,
                                    "Recovered dimensions from in-band SPS"
                                );
                                self.params.video.width = w;
                                self.params.video.height = h;
                            }
                        }
                    }
                    StreamKind::Audio => {
                        if !saw_video_packet
                            && !audio_only_logged
                            && started.elapsed() > AUDIO_ONLY_LOG_AFTER
                        {
                            audio_only_logged = true;
                            warn!(
                                stream = cfg.name,
                                "Only audio packets arriving; source may be starving keyframes"
                            );
                        }
                    }
                },
                Ok(SourceEvent::Error(e)) => return Err(NvrError::Gst(e)),
                Ok(SourceEvent::Eos) => {
                    return Err(NvrError::Gst("EOS during connect".into()));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(NvrError::Gst("source channel closed".into()));
                }
            }

            if self.params.video.has_dimensions() && !self.params.video.extradata.is_empty() {
                return Ok(());
            }
        }

        if self.params.video.has_dimensions() {
            // Extradata never showed up; emit files anyway, with a warning at
            // header-write time.
            return Ok(());
        }
        Err(NvrError::MissingDimensions)
    }

    fn poll_bus_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos]) {
            match msg.view() {
                gst::MessageView::Error(err) => return Some(err.error().to_string()),
                gst::MessageView::Eos(..) => return Some("end of stream".into()),
                _ => {}
            }
        }
        None
    }
}

impl PacketSource for GstRtspSource {
    fn codec_params(&self) -> &CodecParams {
        &self.params
    }

    fn read(&mut self, timeout: Duration) -> ReadOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if self.interrupter.is_interrupted() {
                return ReadOutcome::Interrupted;
            }
            if let Some(err) = self.poll_bus_error() {
                return if err == "end of stream" {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Fatal(err)
                };
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ReadOutcome::Again;
            }
            let slice = remaining.min(Duration::from_millis(100));
            match self.rx.recv_timeout(slice) {
                Ok(SourceEvent::Packet(pkt)) => return ReadOutcome::Packet(pkt),
                Ok(SourceEvent::Error(e)) => return ReadOutcome::Fatal(e),
                Ok(SourceEvent::Eos) => return ReadOutcome::Eof,
                Ok(_) => {} // Late caps updates carry nothing new mid-stream.
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return ReadOutcome::Eof,
            }
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}

impl Drop for GstRtspSource {
    fn drop(&mut self) {
        self.close();
    }
}

// ───────────────────────────── factory ───────────────────────────────────────

pub struct GstSourceFactory;

impl SourceFactory for GstSourceFactory {
    fn probe(&self, url: &str) -> ProbeOutcome {
        probe_reachability(url, Duration::from_secs(1))
    }

    fn open(&self, cfg: &StreamConfig, interrupter: Interrupter) -> Result<Box<dyn PacketSource>> {
        let options = ConnectOptions::for_stream(cfg);
        Ok(Box::new(GstRtspSource::open(cfg, &options, interrupter)?))
    }
}
