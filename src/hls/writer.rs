// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Live HLS output for one stream.
//!
//! Packets are encoded to MPEG-TS by a GStreamer pipeline
//! (`appsrc ! h264parse ! mpegtsmux ! appsink`) and the emitted byte stream
//! is cut into fragment files on keyframes once the fragment target duration
//! has elapsed. The playlist is maintained by this module and only published
//! via atomic rename.
//!
//! The writer's mutex is shared with HTTP readers that want a consistent
//! playlist snapshot. The packet path uses a bounded trylock so a stuck
//! reader can never wedge the supervisor; persistent contention drops the
//! packet for this stream and logs.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{NvrError, Result};
use crate::hls::playlist::{self, FragmentMeta};
use crate::packet::{CodecParams, MediaPacket, StreamKind, VideoCodec};
use crate::storage::paths::{self, set_output_file_mode};

/// Target duration of one fragment.
pub const FRAGMENT_SECONDS: u64 = 2;
/// Fragments kept in the sliding window.
pub const WINDOW_SIZE: usize = 6;
/// Trylock attempts on the packet path before the packet is dropped.
const LOCK_ATTEMPTS: u32 = 5;
const LOCK_RETRY: Duration = Duration::from_millis(100);
/// Budget for acquiring the mutex during close before forcing.
const CLOSE_LOCK_BUDGET: Duration = Duration::from_secs(2);

/// What the TS encoder produced for one packet.
pub enum EncodeOutcome {
    Bytes(Vec<Bytes>),
    /// The encoder has not finished starting up; the caller retries once
    /// after a short sleep, then drops the packet.
    NotReady,
}

/// MPEG-TS encoding seam; the GStreamer implementation is swapped out in
/// tests.
pub trait TsEncoder: Send {
    fn encode(&mut self, pkt: &MediaPacket) -> Result<EncodeOutcome>;
    fn flush(&mut self) -> Result<Vec<Bytes>>;
}

pub trait TsEncoderFactory: Send + Sync {
    fn create(&self, params: &CodecParams, audio_enabled: bool) -> Result<Box<dyn TsEncoder>>;
}

struct HlsState {
    encoder: Box<dyn TsEncoder>,
    audio_enabled: bool,
    /// Current fragment accumulation.
    buffer: Vec<u8>,
    fragment_started: Instant,
    next_sequence: u64,
    window: VecDeque<FragmentMeta>,
    retried_not_ready: bool,
}

/// Exclusive owner of one playlist directory.
pub struct HlsWriter {
    stream_name: String,
    dir: PathBuf,
    fragment_seconds: u64,
    window_size: usize,
    state: Mutex<Option<HlsState>>,
}

impl HlsWriter {
    /// Set up the output directory (creating it 0777 and confirming the
    /// parent is writable) without starting an encoder yet; codec parameters
    /// only become known once the source connects.
    ///
    /// A `requested_dir` that does not match `<hls_base>/<stream_name>` is
    /// redirected to the expected location with a warning; misconfigured
    /// subsystems must not silently write elsewhere.
    pub fn new(
        requested_dir: Option<&Path>,
        hls_base: &Path,
        stream_name: &str,
        fragment_seconds: u64,
        window_size: usize,
    ) -> Result<Arc<Self>> {
        let expected = hls_base.join(stream_name);
        let dir = match requested_dir {
            Some(req) if req != expected => {
                warn!(
                    stream = stream_name,
                    requested = %req.display(),
                    expected = %expected.display(),
                    "HLS output path redirected to expected layout"
                );
                expected
            }
            _ => expected,
        };

        paths::touch_hls_parent_check(hls_base)?;
        paths::ensure_writable_dir(&dir)?;

        Ok(Arc::new(Self {
            stream_name: stream_name.to_string(),
            dir,
            fragment_seconds,
            window_size,
            state: Mutex::new(None),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Install the TS encoder once the source's codec parameters are known.
    /// Called on every (re)connect; the previous encoder is flushed out.
    pub fn initialize(
        &self,
        params: &CodecParams,
        audio_enabled: bool,
        factory: &dyn TsEncoderFactory,
    ) -> Result<()> {
        let encoder = factory.create(params, audio_enabled)?;
        let mut guard = self.state.lock();
        *guard = Some(HlsState {
            encoder,
            audio_enabled,
            buffer: Vec::new(),
            fragment_started: Instant::now(),
            next_sequence: 0,
            window: VecDeque::new(),
            retried_not_ready: false,
        });
        info!(stream = self.stream_name, dir = %self.dir.display(), "HLS writer initialized");
        Ok(())
    }

    /// Feed one packet. Invalid packets and lock contention drop the packet;
    /// only the supervisor's own faults can fail the stream.
    pub fn write_packet(&self, pkt: &MediaPacket) {
        if !pkt.is_valid() {
            debug!(stream = self.stream_name, "Dropping empty packet");
            return;
        }

        let mut guard = None;
        for _ in 0..LOCK_ATTEMPTS {
            if let Some(g) = self.state.try_lock() {
                guard = Some(g);
                break;
            }
            std::thread::sleep(LOCK_RETRY);
        }
        let Some(mut guard) = guard else {
            warn!(stream = self.stream_name, "HLS writer lock contended; packet dropped");
            return;
        };
        let Some(state) = guard.as_mut() else {
            // Writer not initialized yet; packets before connect are dropped.
            return;
        };
        if pkt.kind == StreamKind::Audio && !state.audio_enabled {
            return;
        }

        // Cut the previous fragment before the keyframe's bytes are encoded
        // so every fragment starts on a keyframe.
        if pkt.kind == StreamKind::Video
            && pkt.keyframe
            && !state.buffer.is_empty()
            && state.fragment_started.elapsed() >= Duration::from_secs(self.fragment_seconds)
        {
            if let Err(e) = self.cut_fragment(state) {
                warn!(stream = self.stream_name, error = %e, "Fragment cut failed");
            }
        }

        let chunks = match state.encoder.encode(pkt) {
            Ok(EncodeOutcome::Bytes(chunks)) => {
                state.retried_not_ready = false;
                chunks
            }
            Ok(EncodeOutcome::NotReady) => {
                if state.retried_not_ready {
                    warn!(stream = self.stream_name, "TS encoder still starting; packet dropped");
                    return;
                }
                // The supervisor can signal the writer ready before the
                // pipeline state is visible to this thread; one retry papers
                // over the startup race.
                state.retried_not_ready = true;
                std::thread::sleep(Duration::from_millis(100));
                match state.encoder.encode(pkt) {
                    Ok(EncodeOutcome::Bytes(chunks)) => chunks,
                    Ok(EncodeOutcome::NotReady) => {
                        warn!(stream = self.stream_name, "TS encoder not ready; packet dropped");
                        return;
                    }
                    Err(e) => {
                        warn!(stream = self.stream_name, error = %e, "TS encode failed");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(stream = self.stream_name, error = %e, "TS encode failed");
                return;
            }
        };
        for chunk in chunks {
            state.buffer.extend_from_slice(&chunk);
        }
    }

    /// Acquire the writer mutex briefly and return the playlist as last
    /// published. HTTP readers call this for a consistent snapshot.
    pub fn playlist_snapshot(&self) -> Option<String> {
        let _guard = self.state.lock();
        fs::read_to_string(self.dir.join(playlist::PLAYLIST_NAME)).ok()
    }

    /// Flush the current fragment and drop the encoder. Uses a bounded lock
    /// acquisition; if the lock cannot be had within the budget the state is
    /// abandoned rather than blocking shutdown.
    pub fn close(&self) {
        let Some(mut guard) = self.state.try_lock_for(CLOSE_LOCK_BUDGET) else {
            warn!(stream = self.stream_name, "HLS close forced; writer lock not released");
            return;
        };
        if let Some(mut state) = guard.take() {
            match state.encoder.flush() {
                Ok(chunks) => {
                    for chunk in chunks {
                        state.buffer.extend_from_slice(&chunk);
                    }
                }
                Err(e) => debug!(stream = self.stream_name, error = %e, "TS flush failed"),
            }
            if !state.buffer.is_empty() {
                if let Err(e) = self.cut_fragment(&mut state) {
                    warn!(stream = self.stream_name, error = %e, "Final fragment write failed");
                }
            }
        }
        info!(stream = self.stream_name, "HLS writer closed");
    }

    /// Write the accumulated bytes as the next fragment file, advance the
    /// window, and publish the updated playlist.
    fn cut_fragment(&self, state: &mut HlsState) -> Result<()> {
        let seq = state.next_sequence;
        let file_name = format!("fragment_{seq:05}.ts");
        let path = self.dir.join(&file_name);
        let data = std::mem::take(&mut state.buffer);
        let elapsed = state.fragment_started.elapsed().as_secs_f64();
        state.fragment_started = Instant::now();
        state.next_sequence += 1;

        fs::write(&path, &data).map_err(|e| match e.kind() {
            std::io::ErrorKind::StorageFull => {
                NvrError::DiskFull { path: path.display().to_string() }
            }
            _ => NvrError::Io(e),
        })?;
        set_output_file_mode(&path)?;

        state.window.push_back(FragmentMeta {
            file_name,
            duration_secs: elapsed,
            sequence: seq,
        });
        while state.window.len() > self.window_size {
            if let Some(evicted) = state.window.pop_front() {
                let _ = fs::remove_file(self.dir.join(&evicted.file_name));
            }
        }

        let rendered = playlist::render_live_playlist(self.fragment_seconds,
            state.window.make_contiguous());
        playlist::publish_playlist(&self.dir, &rendered)
    }
}

// ───────────────────────────── GStreamer encoder ─────────────────────────────

pub struct GstTsEncoder {
    pipeline: gst::Pipeline,
    video_src: gst_app::AppSrc,
    audio_src: Option<gst_app::AppSrc>,
    collected: Arc<Mutex<Vec<Bytes>>>,
}

impl GstTsEncoder {
    pub fn open(params: &CodecParams, audio_enabled: bool) -> Result<Self> {
        gst::init().map_err(|e| NvrError::Gst(format!("gst::init: {e}")))?;

        let parse = match params.video.codec {
            VideoCodec::H264 => "h264parse",
            VideoCodec::H265 => "h265parse",
        };
        let mut desc = format!(
            "appsrc name=vsrc format=time ! {parse} ! mpegtsmux name=mux \
             pat-interval=300 pmt-interval=300 ! \
             appsink name=tsout emit-signals=true sync=false"
        );
        let audio = if audio_enabled { params.audio.as_ref() } else { None };
        if audio.is_some() {
            desc.push_str(" appsrc name=asrc format=time ! aacparse ! mux.");
        }

        let pipeline = gst::parse::launch(&desc)
            .map_err(|e| NvrError::Gst(format!("parse_launch: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| NvrError::Gst("Not a pipeline".into()))?;

        let video_src = pipeline
            .by_name("vsrc")
            .ok_or_else(|| NvrError::Gst("video appsrc not found".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| NvrError::Gst("Cast to AppSrc failed".into()))?;
        let caps_name = match params.video.codec {
            VideoCodec::H264 => "video/x-h264",
            VideoCodec::H265 => "video/x-h265",
        };
        let caps = gst::Caps::builder(caps_name)
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        video_src.set_caps(Some(&caps));

        let audio_src = if let Some(a) = audio {
            let src = pipeline
                .by_name("asrc")
                .ok_or_else(|| NvrError::Gst("audio appsrc not found".into()))?
                .downcast::<gst_app::AppSrc>()
                .map_err(|_| NvrError::Gst("Cast to AppSrc failed".into()))?;
            let caps = gst::Caps::builder("audio/mpeg")
                .field("mpegversion", 4i32)
                .field("stream-format", "adts")
                .field("rate", a.sample_rate as i32)
                .build();
            src.set_caps(Some(&caps));
            Some(src)
        } else {
            None
        };

        let collected: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = pipeline
            .by_name("tsout")
            .ok_or_else(|| NvrError::Gst("ts appsink not found".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| NvrError::Gst("Cast to AppSink failed".into()))?;
        let collected_cb = collected.clone();
        sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buf = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buf.map_readable().map_err(|_| gst::FlowError::Error)?;
                    collected_cb.lock().push(Bytes::copy_from_slice(map.as_slice()));
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| NvrError::Gst(format!("set_state Playing: {e}")))?;

        Ok(Self { pipeline, video_src, audio_src, collected })
    }

    fn drain(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.collected.lock())
    }
}

impl TsEncoder for GstTsEncoder {
    fn encode(&mut self, pkt: &MediaPacket) -> Result<EncodeOutcome> {
        let mut buffer = gst::Buffer::from_slice(pkt.data.clone());
        {
            let b = buffer.get_mut().expect("fresh buffer is unique");
            b.set_pts(pkt.pts.map(crate::mp4::writer::ticks_to_clocktime));
            b.set_dts(pkt.dts.map(crate::mp4::writer::ticks_to_clocktime));
            if pkt.kind == StreamKind::Video && !pkt.keyframe {
                b.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        let src = match pkt.kind {
            StreamKind::Video => &self.video_src,
            StreamKind::Audio => match self.audio_src.as_ref() {
                Some(s) => s,
                None => return Ok(EncodeOutcome::Bytes(Vec::new())),
            },
        };
        match src.push_buffer(buffer) {
            Ok(_) => Ok(EncodeOutcome::Bytes(self.drain())),
            Err(gst::FlowError::Flushing) => Ok(EncodeOutcome::NotReady),
            Err(e) => Err(NvrError::Gst(format!("push_buffer: {e:?}"))),
        }
    }

    fn flush(&mut self) -> Result<Vec<Bytes>> {
        let _ = self.video_src.end_of_stream();
        if let Some(a) = &self.audio_src {
            let _ = a.end_of_stream();
        }
        if let Some(bus) = self.pipeline.bus() {
            let _ = bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(2),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
        }
        let chunks = self.drain();
        let _ = self.pipeline.set_state(gst::State::Null);
        Ok(chunks)
    }
}

impl Drop for GstTsEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

pub struct GstTsEncoderFactory;

impl TsEncoderFactory for GstTsEncoderFactory {
    fn create(&self, params: &CodecParams, audio_enabled: bool) -> Result<Box<dyn TsEncoder>> {
        Ok(Box::new(GstTsEncoder::open(params, audio_enabled)?))
    }
}
