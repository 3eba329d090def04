// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! MP4 output: one [`Mp4Writer`] per open segment file.
//!
//! The writer owns the muxer behind a mutex shared with the closing path and
//! with event-driven callers that reach it through the registry. The actual
//! muxing runs in a GStreamer pipeline:
//!
//! ```text
//!   appsrc (video) ─ h264parse ─┐
//!                               ├─ mp4mux faststart=true ─ filesink
//!   appsrc (audio) ─ aacparse ──┘
//! ```
//!
//! The trailer (`moov`) is produced by sending EOS and waiting for the EOS
//! message on the pipeline bus. Tests substitute the pipeline through the
//! [`SegmentMuxer`] trait.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{NvrError, Result};
use crate::packet::{AudioCodec, CodecParams, MediaPacket, StreamKind, VideoCodec, TIME_BASE};

/// Sink for one segment's packets, timestamps already rewritten.
pub trait SegmentMuxer: Send {
    fn write(&mut self, pkt: &MediaPacket) -> Result<()>;
    /// Write the trailer and release the file handle.
    fn finalize(&mut self) -> Result<()>;
    /// Release the file handle without writing a trailer.
    fn discard(&mut self);
}

/// Creates muxers; the recorder never constructs pipelines directly.
pub trait MuxerFactory: Send + Sync {
    fn create(
        &self,
        path: &Path,
        params: &CodecParams,
        audio_enabled: bool,
    ) -> Result<Box<dyn SegmentMuxer>>;
}

// ───────────────────────────── Mp4Writer ─────────────────────────────────────

struct WriterInner {
    muxer: Option<Box<dyn SegmentMuxer>>,
    trailer_written: bool,
}

/// Exclusive owner of one output file and its muxer state.
pub struct Mp4Writer {
    path: PathBuf,
    created_at: DateTime<Utc>,
    is_recording: AtomicBool,
    inner: Mutex<WriterInner>,
}

impl Mp4Writer {
    /// Open the muxer for `path`. The muxer's header is written as part of
    /// pipeline startup; failure here aborts the segment before any file
    /// content exists.
    pub fn create(
        path: &Path,
        params: &CodecParams,
        audio_enabled: bool,
        factory: &dyn MuxerFactory,
    ) -> Result<Arc<Self>> {
        let muxer = factory.create(path, params, audio_enabled)?;
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            created_at: Utc::now(),
            is_recording: AtomicBool::new(true),
            inner: Mutex::new(WriterInner { muxer: Some(muxer), trailer_written: false }),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// A writer is healthy while its muxer is open and accepting packets.
    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::Acquire)
    }

    /// Write one packet under the writer mutex. Disk-full and I/O failures
    /// mark the writer dead; the segment is then abandoned without a trailer.
    pub fn write_packet(&self, pkt: &MediaPacket) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(muxer) = inner.muxer.as_mut() else {
            return Err(NvrError::WriteFailed {
                path: self.path.display().to_string(),
                reason: "writer already closed".into(),
            });
        };
        match muxer.write(pkt) {
            Ok(()) => Ok(()),
            Err(e @ (NvrError::DiskFull { .. } | NvrError::WriteFailed { .. })) => {
                self.is_recording.store(false, Ordering::Release);
                if let Some(mut m) = inner.muxer.take() {
                    m.discard();
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Finalize the file. The trailer is written at most once; calling
    /// `close` on an already-closed writer is a no-op returning `Ok`.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.is_recording.store(false, Ordering::Release);
        if inner.trailer_written {
            return Ok(());
        }
        if let Some(mut muxer) = inner.muxer.take() {
            inner.trailer_written = true;
            muxer.finalize()?;
            debug!(path = %self.path.display(), "Segment finalized");
        }
        Ok(())
    }

    /// Drop the file without a trailer (fatal-for-segment path).
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        self.is_recording.store(false, Ordering::Release);
        if let Some(mut muxer) = inner.muxer.take() {
            muxer.discard();
        }
    }
}

// ───────────────────────────── GStreamer muxer ───────────────────────────────

/// Convert 90 kHz ticks to the pipeline clock.
pub(crate) fn ticks_to_clocktime(ticks: i64) -> gst::ClockTime {
    let ns = (ticks.max(0) as u64).saturating_mul(1_000_000_000) / TIME_BASE as u64;
    gst::ClockTime::from_nseconds(ns)
}

pub struct GstMp4Muxer {
    pipeline: gst::Pipeline,
    video_src: gst_app::AppSrc,
    audio_src: Option<gst_app::AppSrc>,
    path: PathBuf,
}

impl GstMp4Muxer {
    pub fn open(path: &Path, params: &CodecParams, audio_enabled: bool) -> Result<Self> {
        gst::init().map_err(|e| NvrError::Gst(format!("gst::init: {e}")))?;

        if !params.video.has_dimensions() {
            return Err(NvrError::MissingDimensions);
        }

        let audio = if audio_enabled { params.audio.as_ref() } else { None };
        if let Some(a) = audio {
            // PCM variants must be transcoded upstream; refusing here names
            // the codec so the supervisor can retry audio-disabled.
            if a.codec != AudioCodec::Aac {
                return Err(NvrError::UnsupportedAudioCodec { codec: a.codec.name().to_string() });
            }
        }
        if params.video.extradata.is_empty() {
            warn!(
                path = %path.display(),
                "Source supplied no codec extradata; players may show grey video"
            );
        }

        let parse = match params.video.codec {
            VideoCodec::H264 => "h264parse",
            VideoCodec::H265 => "h265parse",
        };
        let mut desc = format!(
            "appsrc name=vsrc format=time block=true max-bytes=0 ! {parse} ! \
             mp4mux name=mux faststart=true ! filesink name=out sync=false"
        );
        if audio.is_some() {
            desc.push_str(" appsrc name=asrc format=time block=true max-bytes=0 ! aacparse ! mux.");
        }

        let pipeline = gst::parse::launch(&desc)
            .map_err(|e| NvrError::Gst(format!("parse_launch: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| NvrError::Gst("Not a pipeline".into()))?;

        let filesink = pipeline
            .by_name("out")
            .ok_or_else(|| NvrError::Gst("filesink not found".into()))?;
        filesink.set_property("location", path.display().to_string());

        let video_src = pipeline
            .by_name("vsrc")
            .ok_or_else(|| NvrError::Gst("video appsrc not found".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| NvrError::Gst("Cast to AppSrc failed".into()))?;
        let caps_name = match params.video.codec {
            VideoCodec::H264 => "video/x-h264",
            VideoCodec::H265 => "video/x-h265",
        };
        let video_caps = gst::Caps::builder(caps_name)
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .field("width", params.video.width as i32)
            .field("height", params.video.height as i32)
            .build();
        video_src.set_caps(Some(&video_caps));

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

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| NvrError::Gst(format!("set_state Playing: {e}")))?;

        Ok(Self { pipeline, video_src, audio_src, path: path.to_path_buf() })
    }

    /// Map a bus error (where filesink failures surface) onto the segment
    /// error taxonomy.
    fn check_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = msg.view() {
                let text = err.error().to_string();
                return Err(classify_write_error(&self.path, &text));
            }
        }
        Ok(())
    }
}

fn classify_write_error(path: &Path, text: &str) -> NvrError {
    if text.contains("No space left") {
        NvrError::DiskFull { path: path.display().to_string() }
    } else {
        NvrError::WriteFailed { path: path.display().to_string(), reason: text.to_string() }
    }
}

impl SegmentMuxer for GstMp4Muxer {
    fn write(&mut self, pkt: &MediaPacket) -> Result<()> {
        let mut buffer = gst::Buffer::from_slice(pkt.data.clone());
        {
            let b = buffer.get_mut().expect("fresh buffer is unique");
            b.set_pts(pkt.pts.map(ticks_to_clocktime));
            b.set_dts(pkt.dts.map(ticks_to_clocktime));
            b.set_duration(Some(ticks_to_clocktime(pkt.duration)));
            if pkt.kind == StreamKind::Video && !pkt.keyframe {
                b.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        let src = match pkt.kind {
            StreamKind::Video => &self.video_src,
            StreamKind::Audio => self.audio_src.as_ref().ok_or_else(|| {
                NvrError::Gst("audio packet on video-only writer".into())
            })?,
        };
        src.push_buffer(buffer)
            .map_err(|e| NvrError::Gst(format!("push_buffer: {e:?}")))?;
        self.check_bus()
    }

    fn finalize(&mut self) -> Result<()> {
        let _ = self.video_src.end_of_stream();
        if let Some(a) = &self.audio_src {
            let _ = a.end_of_stream();
        }

        let result = match self.pipeline.bus() {
            Some(bus) => {
                match bus.timed_pop_filtered(
                    gst::ClockTime::from_seconds(5),
                    &[gst::MessageType::Eos, gst::MessageType::Error],
                ) {
                    Some(msg) => match msg.view() {
                        gst::MessageView::Eos(..) => Ok(()),
                        gst::MessageView::Error(err) => {
                            Err(classify_write_error(&self.path, &err.error().to_string()))
                        }
                        _ => Ok(()),
                    },
                    None => Err(NvrError::WriteFailed {
                        path: self.path.display().to_string(),
                        reason: "timed out waiting for EOS".into(),
                    }),
                }
            }
            None => Ok(()),
        };

        let _ = self.pipeline.set_state(gst::State::Null);
        result
    }

    fn discard(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

pub struct GstMuxerFactory;

impl MuxerFactory for GstMuxerFactory {
    fn create(
        &self,
        path: &Path,
        params: &CodecParams,
        audio_enabled: bool,
    ) -> Result<Box<dyn SegmentMuxer>> {
        Ok(Box::new(GstMp4Muxer::open(path, params, audio_enabled)?))
    }
}
