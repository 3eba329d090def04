// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Timestamp rewriting for one output stream of one segment.
//!
//! MP4 track timestamps must start near zero, increase strictly, keep
//! PTS >= DTS, and never cross the 32-bit signed boundary the `moov` tables
//! can express. Sources violate all of these in practice: cameras restart
//! their clocks mid-stream, reorder timestamps around dropped frames, and
//! drift past 2^31 after a few days of uptime. Every correction lives here,
//! in one place, instead of being scattered across the recorder and writer.

use crate::packet::MediaPacket;

/// DTS values must stay strictly below this (signed 32-bit ceiling).
pub const DTS_ABSOLUTE_LIMIT: i64 = 0x7FFF_FFFF;
/// Rebase early, at ~75% of the ceiling, so PTS offsets cannot overflow.
pub const DTS_SAFETY_LIMIT: i64 = 0x7000_0000;
/// Where a rebased DTS lands.
pub const REBASE_TARGET: i64 = 1_000;
/// A PTS-DTS delta outside [0, this) is discarded during a rebase.
pub const MAX_PTS_DELTA_ON_REBASE: i64 = 10_000;
/// Durations above this are treated as garbage and capped.
pub const DURATION_SANITY_LIMIT: i64 = 10_000_000;
/// Cap applied to oversized durations (one second at 90 kHz).
pub const DURATION_CAP: i64 = 90_000;
/// Consecutive monotonicity failures that trigger a full rebase.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// What `rewrite` did to a packet, for the caller's occasional warn logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rewrite {
    /// The packet's DTS was not strictly greater than its predecessor's.
    pub monotonicity_fixed: bool,
    /// The running timestamps crossed the safety limit and were rebased.
    pub limit_rebased: bool,
    /// Five consecutive monotonicity failures forced a full rebase.
    pub full_rebase: bool,
}

/// Per-output-stream rewriter. Create one per stream per segment; segment
/// index 0 maps the first packet to 0, later segments to 1 so consecutive
/// files remain distinguishable without carrying absolute timestamps.
#[derive(Debug)]
pub struct TimestampRewriter {
    segment_index: u32,
    fallback_duration: i64,
    first_dts: Option<i64>,
    first_pts: Option<i64>,
    last_dts: Option<i64>,
    consecutive_errors: u32,
}

impl TimestampRewriter {
    pub fn new(segment_index: u32, fallback_duration: i64) -> Self {
        Self {
            segment_index,
            fallback_duration: fallback_duration.max(1),
            first_dts: None,
            first_pts: None,
            last_dts: None,
            consecutive_errors: 0,
        }
    }

    /// The offset added after base subtraction: 0 for the first segment,
    /// 1 for every later one.
    fn base_offset(&self) -> i64 {
        if self.segment_index > 0 { 1 } else { 0 }
    }

    /// Rewrite `pkt`'s timestamps in place. After this call `pkt.dts` and
    /// `pkt.pts` are `Some`, `pts >= dts`, `dts` is strictly greater than the
    /// previous packet's (except across a limit rebase), and `duration > 0`.
    pub fn rewrite(&mut self, pkt: &mut MediaPacket) -> Rewrite {
        let mut outcome = Rewrite::default();

        let (mut dts, mut pts) = self.map_to_base(pkt);

        // PTS must never precede DTS.
        if pts < dts {
            pts = dts;
        }

        // Strict DTS monotonicity.
        if let Some(last) = self.last_dts {
            if dts <= last {
                outcome.monotonicity_fixed = true;
                self.consecutive_errors += 1;
                if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    // The source clock is not coming back. Re-anchor the base
                    // on this packet, continuing one tick past the previous
                    // one so the file stays strictly monotonic.
                    outcome.full_rebase = true;
                    self.consecutive_errors = 0;
                    let offset = self.base_offset();
                    let resume = last + 1;
                    let raw_dts = pkt.dts.or(pkt.pts).unwrap_or(0);
                    let raw_pts = pkt.pts.or(pkt.dts).unwrap_or(raw_dts);
                    self.first_dts = Some(raw_dts - resume + offset);
                    self.first_pts = Some(raw_pts - resume + offset);
                    dts = resume;
                    pts = resume + (raw_pts - raw_dts).max(0);
                } else {
                    let delta = (pts - dts).max(0);
                    dts = last + 1;
                    pts = dts + delta;
                }
            } else {
                self.consecutive_errors = 0;
            }
        }

        // Keep well below the 32-bit table limit.
        if dts >= DTS_SAFETY_LIMIT || dts >= DTS_ABSOLUTE_LIMIT {
            outcome.limit_rebased = true;
            let delta = pts - dts;
            // Shift the base so this packet lands on the target and the
            // following packets stay contiguous with it.
            let shift = dts - REBASE_TARGET;
            if let Some(fd) = self.first_dts.as_mut() {
                *fd += shift;
            }
            if let Some(fp) = self.first_pts.as_mut() {
                *fp += shift;
            }
            dts = REBASE_TARGET;
            pts = if (0..MAX_PTS_DELTA_ON_REBASE).contains(&delta) {
                dts + delta
            } else {
                dts
            };
        }

        self.last_dts = Some(dts);

        pkt.dts = Some(dts);
        pkt.pts = Some(pts);
        pkt.duration = self.fill_duration(pkt.duration);

        outcome
    }

    /// Map the packet's raw timestamps onto the segment-local base.
    fn map_to_base(&mut self, pkt: &MediaPacket) -> (i64, i64) {
        let offset = self.base_offset();
        match (pkt.dts.or(pkt.pts), pkt.pts.or(pkt.dts)) {
            (Some(raw_dts), Some(raw_pts)) => {
                if self.first_dts.is_none() {
                    self.first_dts = Some(raw_dts);
                    self.first_pts = Some(raw_pts);
                }
                let fd = self.first_dts.unwrap_or(0);
                let fp = self.first_pts.unwrap_or(0);
                let dts = (raw_dts - fd).max(0) + offset;
                let pts = (raw_pts - fp).max(0) + offset;
                (dts, pts)
            }
            _ => {
                // Source gave us nothing; continue one tick past the
                // previous packet.
                let next = self.last_dts.map_or(offset, |l| l + 1);
                (next, next)
            }
        }
    }

    fn fill_duration(&self, duration: i64) -> i64 {
        if duration <= 0 {
            self.fallback_duration
        } else if duration > DURATION_SANITY_LIMIT {
            DURATION_CAP
        } else {
            duration
        }
    }
}
