// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Timestamp rewriter invariants.

mod common;

use common::{vdelta, vkey};
use sentinel_nvr::packet::MediaPacket;
use sentinel_nvr::timestamp::{
    TimestampRewriter, DTS_SAFETY_LIMIT, DURATION_CAP, MAX_CONSECUTIVE_ERRORS, REBASE_TARGET,
};

fn rewrite(rw: &mut TimestampRewriter, pts: i64, dts: i64) -> MediaPacket {
    let mut pkt = vdelta(0, 0);
    pkt.pts = Some(pts);
    pkt.dts = Some(dts);
    rw.rewrite(&mut pkt);
    pkt
}

#[test]
fn test_first_segment_starts_at_zero() {
    let mut rw = TimestampRewriter::new(0, 3000);
    let pkt = rewrite(&mut rw, 90_000, 90_000);
    assert_eq!(pkt.dts, Some(0));
    assert_eq!(pkt.pts, Some(0));

    let pkt = rewrite(&mut rw, 93_000, 93_000);
    assert_eq!(pkt.dts, Some(3000));
}

#[test]
fn test_later_segments_start_at_one() {
    let mut rw = TimestampRewriter::new(3, 3000);
    let pkt = rewrite(&mut rw, 500_000, 500_000);
    assert_eq!(pkt.dts, Some(1));
    assert_eq!(pkt.pts, Some(1));
}

#[test]
fn test_pts_never_precedes_dts() {
    let mut rw = TimestampRewriter::new(0, 3000);
    rewrite(&mut rw, 1000, 1000);
    // Raw PTS falls behind raw DTS; the rewriter pins PTS to DTS.
    let pkt = rewrite(&mut rw, 1500, 4000);
    let dts = pkt.dts.unwrap();
    assert!(pkt.pts.unwrap() >= dts);
}

#[test]
fn test_non_monotonic_dts_forced_forward() {
    let mut rw = TimestampRewriter::new(0, 3000);
    rewrite(&mut rw, 6000, 6000);
    rewrite(&mut rw, 9000, 9000);
    // Stale timestamp: equal to the base packet.
    let pkt = rewrite(&mut rw, 6600, 6000);
    // Forced to prev + 1 with the (pts - dts) offset preserved.
    assert_eq!(pkt.dts, Some(3001));
    assert_eq!(pkt.pts, Some(3001 + 600));
}

#[test]
fn test_full_rebase_after_consecutive_errors() {
    let mut rw = TimestampRewriter::new(0, 3000);
    rewrite(&mut rw, 90_000, 90_000);
    rewrite(&mut rw, 93_000, 93_000);

    // A clock jump far backwards produces repeated monotonicity failures.
    let mut last_outcome = Default::default();
    for i in 0..MAX_CONSECUTIVE_ERRORS {
        let mut pkt = vdelta(0, 0);
        pkt.pts = Some(10 + i64::from(i));
        pkt.dts = Some(10 + i64::from(i));
        last_outcome = rw.rewrite(&mut pkt);
    }
    assert!(
        matches!(last_outcome, o if o.full_rebase),
        "fifth consecutive error must trigger a full rebase"
    );

    // After the rebase the stream continues monotonically from the new base.
    let pkt = rewrite(&mut rw, 3020, 3020);
    assert!(pkt.dts.unwrap() > 0);
}

#[test]
fn test_limit_rebase() {
    let mut rw = TimestampRewriter::new(0, 3000);
    rewrite(&mut rw, 0, 0);
    // Jump straight past the safety margin.
    let pkt = rewrite(&mut rw, DTS_SAFETY_LIMIT + 700, DTS_SAFETY_LIMIT + 500);
    assert_eq!(pkt.dts, Some(REBASE_TARGET));
    // Small delta preserved.
    assert_eq!(pkt.pts, Some(REBASE_TARGET + 200));

    // Subsequent packets stay contiguous with the rebased value.
    let pkt = rewrite(&mut rw, DTS_SAFETY_LIMIT + 3500, DTS_SAFETY_LIMIT + 3500);
    assert_eq!(pkt.dts, Some(REBASE_TARGET + 3000));
}

#[test]
fn test_limit_rebase_discards_huge_pts_delta() {
    let mut rw = TimestampRewriter::new(0, 3000);
    rewrite(&mut rw, 0, 0);
    let pkt = rewrite(&mut rw, DTS_SAFETY_LIMIT + 50_000, DTS_SAFETY_LIMIT + 100);
    assert_eq!(pkt.dts, Some(REBASE_TARGET));
    assert_eq!(pkt.pts, Some(REBASE_TARGET));
}

#[test]
fn test_duration_filling() {
    let mut rw = TimestampRewriter::new(0, 3000);
    let mut pkt = vkey(1, 0);
    pkt.duration = 0;
    rw.rewrite(&mut pkt);
    assert_eq!(pkt.duration, 3000);

    let mut pkt = vdelta(1, 3000);
    pkt.duration = 50_000_000; // garbage
    rw.rewrite(&mut pkt);
    assert_eq!(pkt.duration, DURATION_CAP);

    let mut pkt = vdelta(2, 6000);
    pkt.duration = 2999;
    rw.rewrite(&mut pkt);
    assert_eq!(pkt.duration, 2999);
}

#[test]
fn test_missing_timestamps_continue_from_previous() {
    let mut rw = TimestampRewriter::new(0, 3000);
    rewrite(&mut rw, 9000, 9000);
    let mut pkt = vdelta(0, 0);
    pkt.pts = None;
    pkt.dts = None;
    rw.rewrite(&mut pkt);
    assert_eq!(pkt.dts, Some(1), "one tick past the previous packet's 0");
}

#[test]
fn test_invariants_over_jittery_sequence() {
    let mut rw = TimestampRewriter::new(1, 3000);
    // Deliberately nasty input: duplicates, backwards jumps, B-frame-style
    // PTS reordering, a wild spike past the safety limit.
    let inputs: &[(i64, i64)] = &[
        (9000, 3000),
        (6000, 6000),
        (6000, 6000),
        (4000, 3500),
        (12_000, 9000),
        (DTS_SAFETY_LIMIT + 10, DTS_SAFETY_LIMIT + 10),
        (DTS_SAFETY_LIMIT + 3010, DTS_SAFETY_LIMIT + 3010),
        (15_000, 15_000),
        (18_000, 18_000),
    ];

    let mut previous: Option<i64> = None;
    let mut rebase_seen = false;
    for &(pts, dts) in inputs {
        let mut pkt = vdelta(0, 0);
        pkt.pts = Some(pts);
        pkt.dts = Some(dts);
        let outcome = rw.rewrite(&mut pkt);
        rebase_seen |= outcome.limit_rebased || outcome.full_rebase;

        let dts = pkt.dts.unwrap();
        let pts = pkt.pts.unwrap();
        assert!(pts >= dts);
        assert!(dts < 0x7FFF_FFFF);
        assert!(pkt.duration > 0);
        if let Some(prev) = previous {
            // Strict monotonicity holds except immediately across a rebase.
            if !(outcome.limit_rebased || outcome.full_rebase) {
                assert!(dts > prev, "dts {dts} not greater than {prev}");
            }
        }
        previous = Some(dts);
    }
    assert!(rebase_seen, "sequence was designed to trip a rebase");
}
