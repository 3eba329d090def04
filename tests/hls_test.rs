// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HLS writer behavior: fragment cutting, window eviction, playlist
//! publication, and directory discipline.

mod common;

use common::{apkt, test_params, vdelta, vkey, MockTsEncoderFactory};
use sentinel_nvr::hls::writer::HlsWriter;
use sentinel_nvr::packet::MediaPacket;
use tempfile::TempDir;

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

/// Fragment duration 0 cuts on every keyframe, which keeps the tests free
/// of wall-clock sleeps.
fn writer(dir: &TempDir, window: usize) -> std::sync::Arc<HlsWriter> {
    let w = HlsWriter::new(None, &dir.path().join("hls"), "cam1", 0, window).expect("writer");
    w.initialize(&test_params(), false, &MockTsEncoderFactory).expect("initialize");
    w
}

#[test]
fn test_fragments_cut_on_keyframes() {
    let dir = tmp_dir();
    let w = writer(&dir, 4);

    w.write_packet(&vkey(1, 0));
    w.write_packet(&vdelta(1, 3000));
    // Next keyframe closes the first fragment.
    w.write_packet(&vkey(2, 6000));

    let frag = dir.path().join("hls").join("cam1").join("fragment_00000.ts");
    assert!(frag.is_file(), "first fragment written on the keyframe cut");
    let data = std::fs::read(&frag).unwrap();
    // Pass-through encoder: fragment holds the first keyframe + delta bytes.
    assert_eq!(data, [vkey(1, 0).data.as_ref(), vdelta(1, 3000).data.as_ref()].concat());

    let playlist = w.playlist_snapshot().expect("playlist after first cut");
    assert!(playlist.contains("fragment_00000.ts"));
    assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0"));
}

#[test]
fn test_window_eviction_removes_fragment_files() {
    let dir = tmp_dir();
    let w = writer(&dir, 2);
    let stream_dir = dir.path().join("hls").join("cam1");

    for i in 0..4u8 {
        w.write_packet(&vkey(i, i64::from(i) * 3000));
        w.write_packet(&vdelta(i, i64::from(i) * 3000 + 1500));
    }
    // Three fragments cut (0, 1, 2); window of 2 evicts the first.
    assert!(!stream_dir.join("fragment_00000.ts").exists(), "evicted from window");
    assert!(stream_dir.join("fragment_00001.ts").is_file());
    assert!(stream_dir.join("fragment_00002.ts").is_file());

    let playlist = w.playlist_snapshot().expect("playlist");
    assert!(!playlist.contains("fragment_00000.ts"));
    assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:1"));
}

#[test]
fn test_close_flushes_final_fragment() {
    let dir = tmp_dir();
    let w = writer(&dir, 4);
    w.write_packet(&vkey(1, 0));
    w.write_packet(&vdelta(1, 3000));
    w.close();

    let stream_dir = dir.path().join("hls").join("cam1");
    assert!(stream_dir.join("fragment_00000.ts").is_file(), "close cuts the open fragment");

    // Closing twice is harmless.
    w.close();
}

#[test]
fn test_packets_before_initialize_are_dropped() {
    let dir = tmp_dir();
    let w = HlsWriter::new(None, &dir.path().join("hls"), "cam1", 0, 4).expect("writer");
    // No encoder yet; must not panic or create fragments.
    w.write_packet(&vkey(1, 0));
    assert!(w.playlist_snapshot().is_none());
}

#[test]
fn test_invalid_packets_are_dropped() {
    let dir = tmp_dir();
    let w = writer(&dir, 4);
    let empty = MediaPacket::video(bytes::Bytes::new(), Some(0), Some(0), true);
    w.write_packet(&empty);
    w.write_packet(&apkt(1, 0)); // audio on an audio-disabled writer
    w.write_packet(&vkey(1, 0));
    w.write_packet(&vkey(2, 3000));

    let frag = dir.path().join("hls").join("cam1").join("fragment_00000.ts");
    let data = std::fs::read(&frag).unwrap();
    assert_eq!(data, vkey(1, 0).data.as_ref(), "only the valid video packet was encoded");
}

#[test]
fn test_requested_path_is_redirected_to_expected_layout() {
    let dir = tmp_dir();
    let base = dir.path().join("hls");
    let rogue = dir.path().join("somewhere-else");
    let w = HlsWriter::new(Some(&rogue), &base, "cam1", 0, 4).expect("writer");
    assert_eq!(w.dir(), base.join("cam1"));
    assert!(base.join(".hls_parent_check").is_file(), "parent marker dropped");
}
