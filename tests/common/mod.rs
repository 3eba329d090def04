// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Shared mocks for the integration tests: scripted packet sources, an
//! in-memory MP4 muxer, a pass-through TS encoder, and a counting event
//! sink. These stand in behind the same traits the GStreamer
//! implementations use, so the packet-level logic runs without a camera.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use sentinel_nvr::config::{StreamConfig, Transport, TriggerType};
use sentinel_nvr::error::{NvrError, Result};
use sentinel_nvr::events::EventSink;
use sentinel_nvr::hls::writer::{EncodeOutcome, TsEncoder, TsEncoderFactory};
use sentinel_nvr::ingest::{PacketSource, ProbeOutcome, ReadOutcome, SourceFactory};
use sentinel_nvr::mp4::writer::{MuxerFactory, SegmentMuxer};
use sentinel_nvr::packet::{
    AudioCodec, AudioParams, CodecParams, MediaPacket, StreamKind, VideoCodec, VideoParams,
};
use sentinel_nvr::shutdown::Interrupter;

// ──────────────── packets & params ─────────────────────────────────────────

pub fn test_params() -> CodecParams {
    CodecParams {
        video: VideoParams {
            codec: VideoCodec::H264,
            width: 1280,
            height: 720,
            extradata: Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42]),
            frame_rate: (30, 1),
        },
        audio: Some(AudioParams {
            codec: AudioCodec::Aac,
            sample_rate: 48_000,
            frame_size: 1024,
        }),
    }
}

/// A video keyframe whose payload is distinguishable by `tag`.
pub fn vkey(tag: u8, ts: i64) -> MediaPacket {
    MediaPacket::video(Bytes::from(vec![0xAA, tag, tag, tag]), Some(ts), Some(ts), true)
}

/// A non-keyframe video packet.
pub fn vdelta(tag: u8, ts: i64) -> MediaPacket {
    MediaPacket::video(Bytes::from(vec![0xBB, tag]), Some(ts), Some(ts), false)
}

/// An audio packet.
pub fn apkt(tag: u8, ts: i64) -> MediaPacket {
    MediaPacket::audio(Bytes::from(vec![0xCC, tag]), Some(ts), Some(ts))
}

pub fn stream_cfg(name: &str) -> StreamConfig {
    StreamConfig {
        name: name.to_string(),
        url: format!("rtsp://127.0.0.1:8554/{name}"),
        protocol: Transport::Tcp,
        segment_duration: 2,
        has_audio: false,
        trigger: TriggerType::Scheduled,
        onvif: false,
    }
}

// ──────────────── MP4 muxer mock ───────────────────────────────────────────

#[derive(Debug)]
pub struct SegmentRecord {
    pub path: PathBuf,
    pub packets: Vec<MediaPacket>,
    pub finalized: bool,
    pub discarded: bool,
}

#[derive(Clone, Default)]
pub struct MuxerLog(pub Arc<Mutex<Vec<SegmentRecord>>>);

impl MuxerLog {
    pub fn segment_count(&self) -> usize {
        self.0.lock().len()
    }

    pub fn with_segment<T>(&self, idx: usize, f: impl FnOnce(&SegmentRecord) -> T) -> T {
        f(&self.0.lock()[idx])
    }
}

pub struct MockMuxerFactory {
    pub log: MuxerLog,
    /// When set, the next packet write fails with DiskFull (one-shot).
    pub disk_full: Arc<AtomicBool>,
    /// When set, muxer creation fails (one-shot).
    pub fail_create: Arc<AtomicBool>,
}

impl MockMuxerFactory {
    pub fn new() -> Self {
        Self {
            log: MuxerLog::default(),
            disk_full: Arc::new(AtomicBool::new(false)),
            fail_create: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct MockMuxer {
    log: MuxerLog,
    index: usize,
    disk_full: Arc<AtomicBool>,
    path: PathBuf,
}

impl SegmentMuxer for MockMuxer {
    fn write(&mut self, pkt: &MediaPacket) -> Result<()> {
        if self.disk_full.swap(false, Ordering::AcqRel) {
            return Err(NvrError::DiskFull { path: self.path.display().to_string() });
        }
        self.log.0.lock()[self.index].packets.push(pkt.clone());
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.log.0.lock()[self.index].finalized = true;
        Ok(())
    }

    fn discard(&mut self) {
        self.log.0.lock()[self.index].discarded = true;
    }
}

impl MuxerFactory for MockMuxerFactory {
    fn create(
        &self,
        path: &Path,
        _params: &CodecParams,
        _audio_enabled: bool,
    ) -> Result<Box<dyn SegmentMuxer>> {
        if self.fail_create.swap(false, Ordering::AcqRel) {
            return Err(NvrError::Gst("mock create failure".into()));
        }
        let mut log = self.log.0.lock();
        let index = log.len();
        log.push(SegmentRecord {
            path: path.to_path_buf(),
            packets: Vec::new(),
            finalized: false,
            discarded: false,
        });
        Ok(Box::new(MockMuxer {
            log: self.log.clone(),
            index,
            disk_full: self.disk_full.clone(),
            path: path.to_path_buf(),
        }))
    }
}

// ──────────────── TS encoder mock ──────────────────────────────────────────

pub struct MockTsEncoderFactory;

struct MockTsEncoder;

impl TsEncoder for MockTsEncoder {
    fn encode(&mut self, pkt: &MediaPacket) -> Result<EncodeOutcome> {
        Ok(EncodeOutcome::Bytes(vec![pkt.data.clone()]))
    }

    fn flush(&mut self) -> Result<Vec<Bytes>> {
        Ok(Vec::new())
    }
}

impl TsEncoderFactory for MockTsEncoderFactory {
    fn create(&self, _params: &CodecParams, _audio_enabled: bool) -> Result<Box<dyn TsEncoder>> {
        Ok(Box::new(MockTsEncoder))
    }
}

// ──────────────── event sink mock ──────────────────────────────────────────

#[derive(Default)]
pub struct CountingEventSink {
    pub events: Mutex<Vec<(String, String, PathBuf)>>,
}

impl CountingEventSink {
    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|(k, _, _)| k == kind).count()
    }
}

impl EventSink for CountingEventSink {
    fn recording_started(&self, stream: &str, path: &Path) {
        self.events
            .lock()
            .push(("start".into(), stream.to_string(), path.to_path_buf()));
    }

    fn recording_stopped(&self, stream: &str, path: &Path) {
        self.events
            .lock()
            .push(("stop".into(), stream.to_string(), path.to_path_buf()));
    }
}

// ──────────────── scripted packet source ───────────────────────────────────

pub enum ScriptItem {
    Pkt(MediaPacket),
    Wait(Duration),
    Again,
    Eof,
    Fatal(String),
}

/// Factory handing out one script per `open` call. An exhausted script
/// behaves like a silent camera: reads time out with `Again`.
pub struct MockSourceFactory {
    pub scripts: Arc<Mutex<VecDeque<Vec<ScriptItem>>>>,
    pub opens: Arc<AtomicUsize>,
    pub fail_open: Arc<AtomicBool>,
    pub probe_result: ProbeOutcome,
}

impl MockSourceFactory {
    pub fn new(scripts: Vec<Vec<ScriptItem>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into_iter().collect())),
            opens: Arc::new(AtomicUsize::new(0)),
            fail_open: Arc::new(AtomicBool::new(false)),
            probe_result: ProbeOutcome::Reachable,
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }
}

impl SourceFactory for MockSourceFactory {
    fn probe(&self, _url: &str) -> ProbeOutcome {
        self.probe_result
    }

    fn open(
        &self,
        _cfg: &StreamConfig,
        interrupter: Interrupter,
    ) -> Result<Box<dyn PacketSource>> {
        self.opens.fetch_add(1, Ordering::AcqRel);
        if self.fail_open.load(Ordering::Acquire) {
            return Err(NvrError::Gst("mock open failure".into()));
        }
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        Ok(Box::new(MockSource {
            queue: script.into_iter().collect(),
            interrupter,
            params: test_params(),
        }))
    }
}

struct MockSource {
    queue: VecDeque<ScriptItem>,
    interrupter: Interrupter,
    params: CodecParams,
}

impl PacketSource for MockSource {
    fn codec_params(&self) -> &CodecParams {
        &self.params
    }

    fn read(&mut self, timeout: Duration) -> ReadOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if self.interrupter.is_interrupted() {
                return ReadOutcome::Interrupted;
            }
            match self.queue.pop_front() {
                Some(ScriptItem::Pkt(pkt)) => return ReadOutcome::Packet(pkt),
                Some(ScriptItem::Wait(d)) => {
                    if !self.interrupter.sleep_interruptibly(d) {
                        return ReadOutcome::Interrupted;
                    }
                }
                Some(ScriptItem::Again) => return ReadOutcome::Again,
                Some(ScriptItem::Eof) => return ReadOutcome::Eof,
                Some(ScriptItem::Fatal(e)) => return ReadOutcome::Fatal(e),
                None => {
                    if Instant::now() >= deadline {
                        return ReadOutcome::Again;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    fn close(&mut self) {}
}

// ──────────────── assertions ───────────────────────────────────────────────

/// Check the per-file timestamp invariants over a logged segment: video DTS
/// strictly increasing, PTS >= DTS, DTS below the 32-bit ceiling.
pub fn assert_timestamp_invariants(packets: &[MediaPacket]) {
    let mut last_video_dts: Option<i64> = None;
    for pkt in packets {
        let dts = pkt.dts.expect("written packet has dts");
        let pts = pkt.pts.expect("written packet has pts");
        assert!(pts >= dts, "pts {pts} < dts {dts}");
        assert!(dts < 0x7FFF_FFFF, "dts {dts} exceeds 32-bit ceiling");
        if pkt.kind == StreamKind::Video {
            if let Some(last) = last_video_dts {
                assert!(dts > last, "video dts {dts} not greater than {last}");
            }
            last_video_dts = Some(dts);
        }
    }
}
