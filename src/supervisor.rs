// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-stream supervisor: the state machine driving one RTSP source.
//!
//! ```text
//!   Initializing → Connecting → Running ⇄ Reconnecting
//!                       │          │
//!                       └──────────┴────→ Stopping
//! ```
//!
//! The worker runs on a dedicated thread; every blocking point (reads,
//! backoff sleeps) polls the shutdown flags so `stop` completes within its
//! join budget. Packets fan out to the HLS writer, the optional detection
//! tap, and the MP4 recorder; the recorder and muxers never see transport
//! faults, only the supervisor classifies them.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::StreamConfig;
use crate::error::{ErrorCategory, NvrError};
use crate::events::EventSink;
use crate::hls::writer::{HlsWriter, TsEncoderFactory};
use crate::ingest::{PacketSource, ProbeOutcome, ReadOutcome, SourceFactory};
use crate::mp4::recorder::SegmentRecorder;
use crate::mp4::writer::MuxerFactory;
use crate::packet::{MediaPacket, StreamKind};
use crate::registry::WriterRegistry;
use crate::shutdown::{Interrupter, ShutdownCoordinator, SupervisorFlags};

/// Patience for one blocking read; exceeding it transitions to Reconnecting.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Video packets discarded after each (re)connect before the connection is
/// declared valid; early packets can carry decoder-initialization glitches.
pub const DISCARD_AFTER_CONNECT: u32 = 5;
/// Packets between periodic source resets bounding demuxer memory growth.
pub const PERIODIC_RESET_PACKETS: u64 = 1000;
/// Ceiling on the reconnect attempt counter.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 1000;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Exponential backoff: `min(500 ms · 2^(attempt−1), 30 s)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    if attempt <= 1 {
        return BACKOFF_BASE;
    }
    let exp = (attempt - 1).min(16);
    let delay = BACKOFF_BASE.saturating_mul(1u32 << exp);
    delay.min(BACKOFF_CAP)
}

/// Supervisor lifecycle states, visible through the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Initializing,
    Connecting,
    Running,
    Reconnecting,
    Stopping,
    Stopped,
}

impl SupervisorState {
    pub fn name(&self) -> &'static str {
        match self {
            SupervisorState::Initializing => "initializing",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Running => "running",
            SupervisorState::Reconnecting => "reconnecting",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Stopped => "stopped",
        }
    }
}

/// Observable supervisor state shared with the manager and the API.
#[derive(Debug)]
pub struct SupervisorStatus {
    state: Mutex<SupervisorState>,
    last_error: Mutex<ErrorCategory>,
    connection_validated: AtomicBool,
    reconnect_attempt: AtomicU32,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: Mutex::new(SupervisorState::Initializing),
            last_error: Mutex::new(ErrorCategory::None),
            connection_validated: AtomicBool::new(false),
            reconnect_attempt: AtomicU32::new(0),
        }
    }
}

impl SupervisorStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    fn set_state(&self, state: SupervisorState) {
        *self.state.lock() = state;
    }

    pub fn last_error(&self) -> ErrorCategory {
        *self.last_error.lock()
    }

    fn set_last_error(&self, category: ErrorCategory) {
        *self.last_error.lock() = category;
    }

    pub fn is_validated(&self) -> bool {
        self.connection_validated.load(Ordering::Acquire)
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt.load(Ordering::Acquire)
    }
}

/// Optional consumer of the video fan-out (on-video detection lives behind
/// this seam and is not part of the engine).
pub trait PacketTap: Send + Sync {
    fn on_video_packet(&self, stream: &str, pkt: &MediaPacket);
}

/// Everything a worker needs, bundled so the manager can spawn it on a
/// plain thread.
pub struct SupervisorDeps {
    pub cfg: StreamConfig,
    pub mp4_dir: std::path::PathBuf,
    pub record_mp4: bool,
    pub source_factory: Arc<dyn SourceFactory>,
    pub muxer_factory: Arc<dyn MuxerFactory>,
    pub ts_factory: Arc<dyn TsEncoderFactory>,
    pub registry: Arc<WriterRegistry>,
    pub events: Arc<dyn EventSink>,
    pub hls: Arc<HlsWriter>,
    pub coordinator: Arc<ShutdownCoordinator>,
    pub flags: Arc<SupervisorFlags>,
    pub status: Arc<SupervisorStatus>,
    pub tap: Option<Arc<dyn PacketTap>>,
}

/// Worker entry point; blocks until the state machine reaches Stopped.
pub fn run_supervisor(deps: SupervisorDeps) {
    let interrupter = Interrupter::new(deps.coordinator.clone(), deps.flags.clone());
    let mut worker = Worker {
        deps,
        interrupter,
        source: None,
        recorder: None,
        reconnect_attempt: 0,
        discarded: 0,
        packets_since_reset: 0,
        last_packet: Instant::now(),
    };
    worker.run();
}

struct Worker {
    deps: SupervisorDeps,
    interrupter: Interrupter,
    source: Option<Box<dyn PacketSource>>,
    recorder: Option<SegmentRecorder>,
    reconnect_attempt: u32,
    discarded: u32,
    packets_since_reset: u64,
    last_packet: Instant,
}

impl Worker {
    fn run(&mut self) {
        let mut state = SupervisorState::Initializing;
        loop {
            self.deps.status.set_state(state);
            state = match state {
                SupervisorState::Initializing => self.initialize(),
                SupervisorState::Connecting => self.connect(),
                SupervisorState::Running => self.run_connected(),
                SupervisorState::Reconnecting => self.reconnect(),
                SupervisorState::Stopping => {
                    self.stop();
                    self.deps.status.set_state(SupervisorState::Stopped);
                    return;
                }
                SupervisorState::Stopped => return,
            };
        }
    }

    fn initialize(&mut self) -> SupervisorState {
        if self.deps.record_mp4 {
            self.recorder = Some(SegmentRecorder::new(
                self.deps.cfg.name.clone(),
                self.deps.mp4_dir.clone(),
                Duration::from_secs(self.deps.cfg.segment_duration),
                self.deps.cfg.has_audio,
                self.deps.registry.clone(),
                self.deps.events.clone(),
                self.deps.muxer_factory.clone(),
            ));
        }
        self.reconnect_attempt = 0;
        SupervisorState::Connecting
    }

    fn connect(&mut self) -> SupervisorState {
        if self.interrupter.is_interrupted() {
            return SupervisorState::Stopping;
        }
        match self.try_open() {
            Ok(()) => SupervisorState::Running,
            Err(e) => {
                self.deps.status.set_last_error(e.category());
                self.bump_attempt(&e);
                let delay = backoff_delay(self.reconnect_attempt);
                if !self.interrupter.sleep_interruptibly(delay) {
                    return SupervisorState::Stopping;
                }
                SupervisorState::Connecting
            }
        }
    }

    fn reconnect(&mut self) -> SupervisorState {
        if let Some(rec) = self.recorder.as_mut() {
            rec.on_source_lost();
        }
        self.close_source();
        if self.interrupter.is_interrupted() {
            return SupervisorState::Stopping;
        }

        self.bump_attempt_plain();
        let delay = backoff_delay(self.reconnect_attempt);
        if !self.interrupter.sleep_interruptibly(delay) {
            return SupervisorState::Stopping;
        }

        match self.try_open() {
            Ok(()) => SupervisorState::Running,
            Err(e) => {
                self.deps.status.set_last_error(e.category());
                SupervisorState::Reconnecting
            }
        }
    }

    fn run_connected(&mut self) -> SupervisorState {
        loop {
            if self.interrupter.is_interrupted() {
                return SupervisorState::Stopping;
            }
            if self.deps.flags.take_reconnect_request() {
                info!(stream = self.deps.cfg.name, "Reconnect requested; reopening source");
                return SupervisorState::Reconnecting;
            }
            if self.packets_since_reset >= PERIODIC_RESET_PACKETS {
                if let Err(e) = self.periodic_reset() {
                    warn!(stream = self.deps.cfg.name, error = %e, "Periodic reset failed");
                    return SupervisorState::Reconnecting;
                }
            }

            let Some(source) = self.source.as_mut() else {
                return SupervisorState::Reconnecting;
            };
            match source.read(READ_TIMEOUT) {
                ReadOutcome::Packet(pkt) => {
                    self.last_packet = Instant::now();
                    self.packets_since_reset += 1;
                    self.dispatch(pkt);
                }
                ReadOutcome::Again => {
                    if self.last_packet.elapsed() >= READ_TIMEOUT {
                        warn!(
                            stream = self.deps.cfg.name,
                            "No packet within read timeout; reconnecting"
                        );
                        self.deps.status.set_last_error(ErrorCategory::Transient);
                        return SupervisorState::Reconnecting;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                ReadOutcome::Eof => {
                    warn!(stream = self.deps.cfg.name, "Source reported end of stream");
                    self.deps.status.set_last_error(ErrorCategory::Transient);
                    return SupervisorState::Reconnecting;
                }
                ReadOutcome::Fatal(reason) => {
                    warn!(stream = self.deps.cfg.name, reason, "Read failed");
                    self.deps.status.set_last_error(ErrorCategory::Transient);
                    return SupervisorState::Reconnecting;
                }
                ReadOutcome::Interrupted => return SupervisorState::Stopping,
            }
        }
    }

    fn stop(&mut self) {
        self.deps.flags.set_stopping(true);
        if let Some(rec) = self.recorder.as_mut() {
            rec.finish();
        }
        self.close_source();
        self.deps.hls.close();
        self.deps.flags.set_stopping(false);
        info!(stream = self.deps.cfg.name, "Supervisor stopped");
    }

    // ─────────────────────── helpers ────────────────────────────────────────

    /// Reachability probe, then the full open. Resets the per-connection
    /// validation state on success.
    fn try_open(&mut self) -> Result<(), NvrError> {
        match self.deps.source_factory.probe(&self.deps.cfg.url) {
            ProbeOutcome::NotFound => {
                return Err(NvrError::SourceNotFound { url: self.deps.cfg.url.clone() });
            }
            ProbeOutcome::Reachable | ProbeOutcome::Unknown => {}
        }

        let source = self
            .deps
            .source_factory
            .open(&self.deps.cfg, self.interrupter.clone())?;

        let params = source.codec_params().clone();
        if let Some(rec) = self.recorder.as_mut() {
            rec.on_connected(&params);
        }
        self.deps
            .hls
            .initialize(&params, self.deps.cfg.has_audio, self.deps.ts_factory.as_ref())?;

        self.source = Some(source);
        self.reconnect_attempt = 0;
        self.deps.status.reconnect_attempt.store(0, Ordering::Release);
        self.discarded = 0;
        self.packets_since_reset = 0;
        self.last_packet = Instant::now();
        self.deps.status.connection_validated.store(false, Ordering::Release);
        info!(
            stream = self.deps.cfg.name,
            width = params.video.width,
            height = params.video.height,
            codec = params.video.codec.name(),
            "Source connected"
        );
        Ok(())
    }

    /// Close and reopen the source in place, bounding demuxer memory growth.
    /// The carried keyframe dies with the old connection.
    fn periodic_reset(&mut self) -> Result<(), NvrError> {
        info!(stream = self.deps.cfg.name, "Periodic source reset");
        if let Some(rec) = self.recorder.as_mut() {
            rec.on_source_reset();
        }
        self.close_source();
        self.try_open()
    }

    fn dispatch(&mut self, pkt: MediaPacket) {
        if pkt.kind == StreamKind::Video && self.discarded < DISCARD_AFTER_CONNECT {
            self.discarded += 1;
            if self.discarded == DISCARD_AFTER_CONNECT {
                self.deps.status.connection_validated.store(true, Ordering::Release);
            }
            return;
        }
        if self.discarded < DISCARD_AFTER_CONNECT {
            // Audio arriving before the connection is validated.
            return;
        }

        match pkt.kind {
            StreamKind::Video => {
                self.deps.hls.write_packet(&pkt);
                if let Some(tap) = &self.deps.tap {
                    tap.on_video_packet(&self.deps.cfg.name, &pkt);
                }
                if let Some(rec) = self.recorder.as_mut() {
                    rec.handle_packet(&pkt);
                }
            }
            StreamKind::Audio => {
                if !self.deps.cfg.has_audio {
                    return;
                }
                self.deps.hls.write_packet(&pkt);
                if let Some(rec) = self.recorder.as_mut() {
                    rec.handle_packet(&pkt);
                }
            }
        }
    }

    fn close_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
    }

    fn bump_attempt(&mut self, e: &NvrError) {
        self.bump_attempt_plain();
        match e {
            NvrError::SourceNotFound { url } => {
                warn!(stream = self.deps.cfg.name, url, "Source not found; will keep probing");
            }
            _ => {
                error!(
                    stream = self.deps.cfg.name,
                    attempt = self.reconnect_attempt,
                    error = %e,
                    "Connect failed"
                );
            }
        }
    }

    fn bump_attempt_plain(&mut self) {
        self.reconnect_attempt = (self.reconnect_attempt + 1).min(MAX_RECONNECT_ATTEMPTS);
        self.deps
            .status
            .reconnect_attempt
            .store(self.reconnect_attempt, Ordering::Release);
    }
}
