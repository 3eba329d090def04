// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Supervisor + manager end-to-end tests over scripted sources.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    stream_cfg, vdelta, vkey, CountingEventSink, MockMuxerFactory, MockSourceFactory,
    MockTsEncoderFactory, ScriptItem,
};
use sentinel_nvr::config::{ApiConfig, Config, StorageConfig};
use sentinel_nvr::error::NvrError;
use sentinel_nvr::manager::StreamManager;
use sentinel_nvr::shutdown::ShutdownCoordinator;
use sentinel_nvr::supervisor::backoff_delay;
use tempfile::TempDir;

fn test_config(root: &Path, record_mp4: bool, streams: Vec<&str>) -> Config {
    Config {
        storage: StorageConfig {
            storage_path: root.to_path_buf(),
            storage_path_hls: None,
            mp4_storage_path: None,
            record_mp4_directly: record_mp4,
        },
        streams: streams.into_iter().map(stream_cfg).collect(),
        api: ApiConfig::default(),
    }
}

/// Enough keyframes to clear the discard window and start a segment.
fn warmup_script(count: u8) -> Vec<ScriptItem> {
    let mut script = Vec::new();
    for i in 0..count {
        script.push(ScriptItem::Pkt(vkey(i, i64::from(i) * 3000)));
    }
    script
}

fn wait_for(mut cond: impl FnMut() -> bool, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

struct Rig {
    manager: Arc<StreamManager>,
    sources: Arc<MockSourceFactory>,
    muxers: MockMuxerFactory,
    events: Arc<CountingEventSink>,
    _dir: TempDir,
}

fn rig(record_mp4: bool, streams: Vec<&str>, scripts: Vec<Vec<ScriptItem>>) -> Rig {
    let dir = tempfile::tempdir().expect("create tempdir");
    let cfg = test_config(dir.path(), record_mp4, streams);
    let sources = Arc::new(MockSourceFactory::new(scripts));
    let muxer_factory = MockMuxerFactory::new();
    let muxers = MockMuxerFactory {
        log: muxer_factory.log.clone(),
        disk_full: muxer_factory.disk_full.clone(),
        fail_create: muxer_factory.fail_create.clone(),
    };
    let events = Arc::new(CountingEventSink::default());
    let manager = StreamManager::new(
        cfg,
        ShutdownCoordinator::new(),
        sources.clone(),
        Arc::new(muxer_factory),
        Arc::new(MockTsEncoderFactory),
        events.clone(),
        None,
    )
    .expect("manager");
    Rig { manager, sources, muxers, events, _dir: dir }
}

#[test]
fn test_start_validates_after_discard_window() {
    let rig = rig(true, vec!["cam1"], vec![warmup_script(10)]);
    rig.manager.start("cam1").expect("start");

    // The first five video packets are discarded; the connection is only
    // declared valid afterwards.
    assert!(
        wait_for(|| rig.manager.is_active("cam1"), Duration::from_secs(3)),
        "stream should become active"
    );
    assert!(
        wait_for(|| rig.muxers.log.segment_count() >= 1, Duration::from_secs(2)),
        "a segment should open once packets flow"
    );

    rig.manager.stop("cam1").expect("stop");
    assert!(!rig.manager.is_active("cam1"));
    rig.muxers.log.with_segment(0, |seg| {
        assert!(seg.finalized, "stop finalizes the open segment");
    });
    assert!(rig.events.count("stop") >= 1);
}

#[test]
fn test_stop_unblocks_silent_read_within_budget() {
    // Empty script: the source never produces a packet and reads block.
    let rig = rig(false, vec!["cam1"], vec![Vec::new()]);
    rig.manager.start("cam1").expect("start");
    std::thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    rig.manager.stop("cam1").expect("stop");
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "stop must return within its join budget"
    );

    // The slot is free; a second stop reports the name as unknown.
    match rig.manager.stop("cam1") {
        Err(NvrError::StreamNotFound { .. }) => {}
        other => panic!("expected StreamNotFound, got {other:?}"),
    }
}

#[test]
fn test_start_is_rejected_while_healthy_and_idempotent_via_start_recording() {
    let rig = rig(true, vec!["cam1"], vec![warmup_script(10)]);
    rig.manager.start("cam1").expect("start");
    assert!(wait_for(|| rig.manager.is_active("cam1"), Duration::from_secs(3)));

    match rig.manager.start("cam1") {
        Err(NvrError::AlreadyRunning { .. }) => {}
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    // The event-driven entry point treats a healthy stream as success and
    // changes nothing.
    let opens_before = rig.sources.open_count();
    rig.manager
        .start_recording("cam1", None, None)
        .expect("idempotent start_recording");
    assert_eq!(rig.sources.open_count(), opens_before);

    rig.manager.stop("cam1").expect("stop");
}

#[test]
fn test_unknown_stream_and_shutdown_refusal() {
    let rig = rig(false, vec!["cam1"], vec![Vec::new()]);
    match rig.manager.start("nope") {
        Err(NvrError::StreamNotFound { .. }) => {}
        other => panic!("expected StreamNotFound, got {other:?}"),
    }

    rig.manager.shutdown();
    match rig.manager.start("cam1") {
        Err(NvrError::ShuttingDown) => {}
        other => panic!("expected ShuttingDown, got {other:?}"),
    }
}

#[test]
fn test_eof_triggers_reconnect_with_fresh_source() {
    let mut first = warmup_script(8);
    first.push(ScriptItem::Eof);
    let rig = rig(false, vec!["cam1"], vec![first, warmup_script(10)]);

    rig.manager.start("cam1").expect("start");
    assert!(
        wait_for(|| rig.sources.open_count() >= 2, Duration::from_secs(5)),
        "EOF should force a reconnect and a second open"
    );
    rig.manager.stop("cam1").expect("stop");
}

#[test]
fn test_reconnect_all_reopens_sources() {
    // A long-lived script: packets spaced out so the stream stays busy.
    let mut script = warmup_script(8);
    for i in 0..200u8 {
        script.push(ScriptItem::Wait(Duration::from_millis(50)));
        script.push(ScriptItem::Pkt(vdelta(i, 30_000 + i64::from(i) * 3000)));
    }
    let rig = rig(false, vec!["cam1"], vec![script, warmup_script(10)]);

    rig.manager.start("cam1").expect("start");
    assert!(wait_for(|| rig.manager.is_active("cam1"), Duration::from_secs(3)));
    assert_eq!(rig.sources.open_count(), 1);

    rig.manager.signal_reconnect_all();
    assert!(
        wait_for(|| rig.sources.open_count() >= 2, Duration::from_secs(5)),
        "reconnect signal should reopen the source"
    );
    rig.manager.stop("cam1").expect("stop");
}

#[test]
fn test_periodic_reset_reopens_after_packet_quota() {
    // One keyframe then a long run of deltas: more than the reset quota.
    let mut script = warmup_script(6);
    for i in 0..1100u32 {
        script.push(ScriptItem::Pkt(vdelta((i % 250) as u8, 20_000 + i64::from(i) * 3000)));
    }
    let rig = rig(false, vec!["cam1"], vec![script, warmup_script(10)]);

    rig.manager.start("cam1").expect("start");
    assert!(
        wait_for(|| rig.sources.open_count() >= 2, Duration::from_secs(10)),
        "the periodic reset should reopen the source"
    );
    rig.manager.stop("cam1").expect("stop");
}

#[test]
fn test_restart_clears_hls_leftovers() {
    let rig = rig(false, vec!["cam1"], vec![warmup_script(10), warmup_script(10)]);
    rig.manager.start("cam1").expect("start");
    assert!(wait_for(|| rig.manager.is_active("cam1"), Duration::from_secs(3)));

    let hls_dir = rig.manager.layout().stream_hls_dir("cam1");
    let leftover = hls_dir.join("fragment_99999.ts");
    std::fs::write(&leftover, b"stale").expect("write leftover");

    rig.manager.restart("cam1").expect("restart");
    assert!(!leftover.exists(), "restart clears HLS segment files");
    assert!(wait_for(|| rig.manager.is_active("cam1"), Duration::from_secs(3)));
    rig.manager.stop("cam1").expect("stop");
}

#[test]
fn test_slot_table_is_bounded() {
    let names: Vec<String> = (0..17).map(|i| format!("cam{i}")).collect();
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let rig = rig(false, name_refs, Vec::new());

    for name in names.iter().take(16) {
        rig.manager.start(name).expect("start within slot budget");
    }
    match rig.manager.start("cam16") {
        Err(NvrError::NoSlot { .. }) => {}
        other => panic!("expected NoSlot, got {other:?}"),
    }
    rig.manager.shutdown();
}

#[test]
fn test_backoff_sequence() {
    let expected = [
        Duration::from_millis(500),
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
        Duration::from_secs(8),
        Duration::from_secs(16),
        Duration::from_secs(30),
        Duration::from_secs(30),
    ];
    for (i, want) in expected.iter().enumerate() {
        assert_eq!(backoff_delay(i as u32 + 1), *want, "attempt {}", i + 1);
    }
    // The cap holds arbitrarily far out.
    assert_eq!(backoff_delay(1000), Duration::from_secs(30));
}
