// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! MP4 segment recorder.
//!
//! Consumes the supervisor's packet fan-out and produces a chronological
//! sequence of `recording_YYYYMMDD_HHMMSS.mp4` files, each about
//! `segment_duration` long and keyframe-aligned on both ends:
//!
//! * A segment closes on the first video keyframe after its deadline. That
//!   keyframe is written as the closing packet AND carried over as the next
//!   segment's first packet. Duplicating one frame is acceptable; a gap is
//!   not.
//! * If no keyframe shows up within 5 s of the deadline, the segment closes
//!   on whatever packet is current and `last_frame_was_key` records the
//!   degraded boundary; the next segment then starts without waiting.
//!
//! The carried keyframe is only valid while the same source connection
//! persists; reconnects and periodic source resets discard it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::error::{NvrError, Result};
use crate::events::EventSink;
use crate::mp4::writer::{Mp4Writer, MuxerFactory};
use crate::packet::{CodecParams, MediaPacket, StreamKind};
use crate::registry::WriterRegistry;
use crate::storage::paths::{self, recording_path};
use crate::timestamp::TimestampRewriter;

/// How long to wait past the rotation deadline for a closing keyframe.
pub const KEYFRAME_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay before retrying a failed rotation.
pub const ROTATION_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
enum Phase {
    /// No open segment; drop everything until an acceptable first packet.
    WaitingStart,
    /// Writing normally until the deadline.
    Writing,
    /// Past the deadline, waiting for the closing keyframe.
    WaitingFinalKeyframe { since: Instant },
    /// A rotation attempt failed; keep writing the old segment and retry.
    RotateRetry { at: Instant },
    /// The segment died (disk full, I/O); drop packets until the boundary.
    AbortedUntil { resume_at: Instant },
}

struct ActiveSegment {
    writer: Arc<Mp4Writer>,
    video_ts: TimestampRewriter,
    audio_ts: TimestampRewriter,
    deadline: Instant,
}

/// Per-stream recorder state. Lives as long as the supervisor; segment
/// counters and the keyframe carry-over persist across segments.
pub struct SegmentRecorder {
    stream_name: String,
    output_dir: PathBuf,
    segment_duration: Duration,
    audio_enabled: bool,
    registry: Arc<WriterRegistry>,
    events: Arc<dyn EventSink>,
    muxer_factory: Arc<dyn MuxerFactory>,

    params: Option<CodecParams>,
    segment_index: u32,
    last_frame_was_key: bool,
    pending_keyframe: Option<MediaPacket>,

    current: Option<ActiveSegment>,
    phase: Phase,
}

impl SegmentRecorder {
    pub fn new(
        stream_name: String,
        output_dir: PathBuf,
        segment_duration: Duration,
        audio_enabled: bool,
        registry: Arc<WriterRegistry>,
        events: Arc<dyn EventSink>,
        muxer_factory: Arc<dyn MuxerFactory>,
    ) -> Self {
        Self {
            stream_name,
            output_dir,
            segment_duration,
            audio_enabled,
            registry,
            events,
            muxer_factory,
            params: None,
            segment_index: 0,
            last_frame_was_key: true,
            pending_keyframe: None,
            current: None,
            phase: Phase::WaitingStart,
        }
    }

    pub fn segment_index(&self) -> u32 {
        self.segment_index
    }

    pub fn last_frame_was_key(&self) -> bool {
        self.last_frame_was_key
    }

    pub fn has_open_segment(&self) -> bool {
        self.current.is_some()
    }

    /// Called when the source (re)connects with fresh codec parameters.
    pub fn on_connected(&mut self, params: &CodecParams) {
        self.params = Some(params.clone());
    }

    /// The source connection was replaced (reconnect or periodic reset);
    /// the carried keyframe belongs to the old connection's clock and must
    /// not leak into a segment fed by the new one.
    pub fn on_source_reset(&mut self) {
        if self.pending_keyframe.take().is_some() {
            debug!(stream = self.stream_name, "Discarded carried keyframe on source reset");
        }
    }

    /// The source is gone. Close the open segment with a trailer; the
    /// partial file stays on disk.
    pub fn on_source_lost(&mut self) {
        self.on_source_reset();
        if self.current.is_some() {
            self.close_current();
        }
        // A fresh connection always opens on a keyframe; the ragged-start
        // exception only applies within one connection.
        self.last_frame_was_key = true;
        self.phase = Phase::WaitingStart;
    }

    /// Shutdown path: finalize whatever is open and release the registry
    /// slot.
    pub fn finish(&mut self) {
        if self.current.is_some() {
            self.close_current();
        }
        self.pending_keyframe = None;
        self.phase = Phase::WaitingStart;
        let _ = self.registry.unregister(&self.stream_name);
    }

    /// Feed one packet from the supervisor fan-out.
    pub fn handle_packet(&mut self, pkt: &MediaPacket) {
        if !pkt.is_valid() {
            return;
        }
        let now = Instant::now();

        match self.phase {
            Phase::WaitingStart => self.handle_waiting_start(pkt),
            Phase::Writing => {
                if self
                    .current
                    .as_ref()
                    .map(|seg| now >= seg.deadline)
                    .unwrap_or(false)
                {
                    self.phase = Phase::WaitingFinalKeyframe { since: now };
                    self.handle_final_wait(pkt, now);
                } else {
                    self.write_to_current(pkt);
                }
            }
            Phase::WaitingFinalKeyframe { since } => self.handle_final_wait(pkt, since),
            Phase::RotateRetry { at } => {
                if now >= at && pkt.kind == StreamKind::Video && pkt.keyframe {
                    self.rotate_on_keyframe(pkt);
                } else {
                    self.write_to_current(pkt);
                }
            }
            Phase::AbortedUntil { resume_at } => {
                if now >= resume_at {
                    self.phase = Phase::WaitingStart;
                    self.handle_waiting_start(pkt);
                }
            }
        }
    }

    // ─────────────────────── segment boundaries ─────────────────────────────

    fn handle_waiting_start(&mut self, pkt: &MediaPacket) {
        // Audio must not precede the first I-frame in the file.
        if pkt.kind == StreamKind::Audio {
            return;
        }
        let acceptable = pkt.keyframe || !self.last_frame_was_key;
        if !acceptable {
            return;
        }
        if let Err(e) = self.start_segment(pkt) {
            self.fail_segment_start(e);
        }
    }

    fn handle_final_wait(&mut self, pkt: &MediaPacket, since: Instant) {
        if pkt.kind == StreamKind::Video && pkt.keyframe {
            self.rotate_on_keyframe(pkt);
            return;
        }
        if since.elapsed() >= KEYFRAME_WAIT_TIMEOUT {
            // Give up on alignment: write this packet as the closing one and
            // let the next segment start ragged.
            self.write_to_current(pkt);
            self.last_frame_was_key = false;
            self.pending_keyframe = None;
            self.close_current();
            self.phase = Phase::WaitingStart;
            return;
        }
        self.write_to_current(pkt);
    }

    /// Keyframe-aligned rotation. The keyframe closes the old segment, is
    /// carried over raw (byte-identical, original timestamps), and opens the
    /// new segment. The old writer is only closed once the new one is
    /// registered, so the registry never has a gap.
    fn rotate_on_keyframe(&mut self, pkt: &MediaPacket) {
        self.pending_keyframe = Some(pkt.clone());
        self.write_to_current(pkt);
        self.last_frame_was_key = true;

        let old = self.current.take();
        let pending = self.pending_keyframe.take();
        match self.open_segment(pending.as_ref()) {
            Ok(()) => {
                if let Some(seg) = old {
                    self.finalize_writer(&seg.writer);
                }
            }
            Err(e) => {
                warn!(
                    stream = self.stream_name,
                    error = %e,
                    "Rotation failed; keeping current segment open"
                );
                // Put things back and retry shortly.
                self.current = old;
                self.pending_keyframe = pending;
                self.phase = Phase::RotateRetry { at: Instant::now() + ROTATION_RETRY_DELAY };
            }
        }
    }

    fn start_segment(&mut self, first_pkt: &MediaPacket) -> Result<()> {
        self.open_segment(Some(first_pkt))
    }

    /// Create, register, and prime a fresh segment. On success the recorder
    /// is in `Writing` with `first_pkt` (the carried or live keyframe)
    /// already written.
    fn open_segment(&mut self, first_pkt: Option<&MediaPacket>) -> Result<()> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| NvrError::SegmentAborted("no codec parameters".into()))?;
        if !params.video.has_dimensions() {
            // Never write a header with placeholder dimensions; the result
            // is an unplayable file and a reconnect death-loop.
            return Err(NvrError::MissingDimensions);
        }

        paths::ensure_writable_dir(&self.output_dir)?;
        let path = recording_path(&self.output_dir, Local::now());
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let writer = Mp4Writer::create(
            &path,
            &params,
            self.audio_enabled && params.audio.is_some(),
            self.muxer_factory.as_ref(),
        )?;
        self.registry.register(&self.stream_name, &writer)?;

        let video_fallback = params.video.frame_duration();
        let audio_fallback = params.audio.as_ref().map(|a| a.frame_duration()).unwrap_or(1);
        let mut segment = ActiveSegment {
            writer,
            video_ts: TimestampRewriter::new(self.segment_index, video_fallback),
            audio_ts: TimestampRewriter::new(self.segment_index, audio_fallback),
            deadline: Instant::now() + self.segment_duration,
        };

        info!(
            stream = self.stream_name,
            segment = self.segment_index,
            path = %path.display(),
            "Segment started"
        );
        self.events.recording_started(&self.stream_name, &path);
        self.segment_index += 1;

        if let Some(pkt) = first_pkt {
            let mut first = pkt.clone();
            Self::write_packet(&self.stream_name, &mut segment, &mut first)?;
        }
        self.current = Some(segment);
        self.phase = Phase::Writing;
        Ok(())
    }

    fn fail_segment_start(&mut self, e: NvrError) {
        match &e {
            NvrError::UnsupportedAudioCodec { codec } => {
                error!(
                    stream = self.stream_name,
                    codec = codec.as_str(),
                    "Audio codec cannot be remuxed; disabling audio for subsequent segments"
                );
                self.audio_enabled = false;
                self.phase = Phase::WaitingStart;
            }
            NvrError::DiskFull { .. } => {
                error!(stream = self.stream_name, error = %e, "Segment start failed, disk full");
                self.phase = Phase::AbortedUntil { resume_at: Instant::now() + self.segment_duration };
            }
            _ => {
                error!(stream = self.stream_name, error = %e, "Segment start failed");
                self.phase = Phase::WaitingStart;
            }
        }
    }

    // ─────────────────────── packet writing ─────────────────────────────────

    fn write_to_current(&mut self, pkt: &MediaPacket) {
        let Some(segment) = self.current.as_mut() else {
            return;
        };
        if pkt.kind == StreamKind::Audio && !self.audio_enabled {
            return;
        }
        let mut owned = pkt.clone();
        match Self::write_packet(&self.stream_name, segment, &mut owned) {
            Ok(()) => {
                if pkt.kind == StreamKind::Video {
                    self.last_frame_was_key = pkt.keyframe;
                }
            }
            Err(e @ (NvrError::DiskFull { .. } | NvrError::WriteFailed { .. })) => {
                // Fatal for the segment: no trailer, resume at the boundary.
                error!(stream = self.stream_name, error = %e, "Segment aborted");
                let seg = self.current.take().expect("segment checked above");
                let path = seg.writer.path().to_path_buf();
                seg.writer.abort();
                self.events.recording_stopped(&self.stream_name, &path);
                self.pending_keyframe = None;
                self.phase = Phase::AbortedUntil { resume_at: seg.deadline };
            }
            Err(e) => {
                debug!(stream = self.stream_name, error = %e, "Packet write failed");
            }
        }
    }

    fn write_packet(
        stream_name: &str,
        segment: &mut ActiveSegment,
        pkt: &mut MediaPacket,
    ) -> Result<()> {
        let rewriter = match pkt.kind {
            StreamKind::Video => &mut segment.video_ts,
            StreamKind::Audio => &mut segment.audio_ts,
        };
        let outcome = rewriter.rewrite(pkt);
        if outcome.full_rebase {
            warn!(stream = stream_name, "Timestamp tracking rebased after repeated errors");
        } else if outcome.limit_rebased {
            warn!(stream = stream_name, "Timestamps rebased below 32-bit ceiling");
        }
        segment.writer.write_packet(pkt)
    }

    fn close_current(&mut self) {
        if let Some(seg) = self.current.take() {
            self.finalize_writer(&seg.writer);
        }
    }

    fn finalize_writer(&self, writer: &Arc<Mp4Writer>) {
        let path = writer.path().to_path_buf();
        if let Err(e) = writer.close() {
            error!(stream = self.stream_name, path = %path.display(), error = %e,
                "Segment close failed");
        }
        let _ = paths::set_output_file_mode(&path);
        self.events.recording_stopped(&self.stream_name, &path);
        info!(stream = self.stream_name, path = %path.display(), "Segment closed");
    }
}
