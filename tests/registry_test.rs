// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Writer registry semantics: replace-and-close, weak handles, slot bounds.

mod common;

use std::sync::Arc;

use common::{test_params, MockMuxerFactory};
use sentinel_nvr::error::NvrError;
use sentinel_nvr::mp4::writer::Mp4Writer;
use sentinel_nvr::registry::{WriterRegistry, MAX_STREAMS};
use tempfile::TempDir;

struct Rig {
    factory: MockMuxerFactory,
    registry: Arc<WriterRegistry>,
    dir: TempDir,
}

fn rig() -> Rig {
    Rig {
        factory: MockMuxerFactory::new(),
        registry: WriterRegistry::new(),
        dir: tempfile::tempdir().expect("create tempdir"),
    }
}

impl Rig {
    fn writer(&self, name: &str) -> Arc<Mp4Writer> {
        let path = self.dir.path().join(format!("{name}.mp4"));
        Mp4Writer::create(&path, &test_params(), false, &self.factory).expect("writer")
    }
}

#[test]
fn test_register_get_unregister() {
    let rig = rig();
    let w = rig.writer("a");

    assert!(rig.registry.get("cam1").is_none());
    rig.registry.register("cam1", &w).expect("register");
    assert!(Arc::ptr_eq(&rig.registry.get("cam1").expect("get"), &w));
    assert!(rig.registry.is_healthy("cam1"));

    // Unregister clears the slot but does NOT close; the caller owns
    // closure.
    let returned = rig.registry.unregister("cam1").expect("unregister");
    assert!(Arc::ptr_eq(&returned, &w));
    assert!(w.is_recording(), "unregister must not close the writer");
    assert!(rig.registry.get("cam1").is_none());
}

#[test]
fn test_register_replaces_and_closes_prior() {
    let rig = rig();
    let w1 = rig.writer("a");
    let w2 = rig.writer("b");

    rig.registry.register("cam1", &w1).expect("register w1");
    rig.registry.register("cam1", &w2).expect("register w2");

    assert!(!w1.is_recording(), "replaced writer is closed");
    rig.factory.log.with_segment(0, |seg| assert!(seg.finalized));
    assert!(Arc::ptr_eq(&rig.registry.get("cam1").expect("get"), &w2));
    assert!(w2.is_recording());
}

#[test]
fn test_stale_handle_does_not_resolve() {
    let rig = rig();
    let w1 = rig.writer("a");
    let w2 = rig.writer("b");

    let handle1 = rig.registry.register("cam1", &w1).expect("register w1");
    assert!(rig.registry.resolve(handle1).is_some());

    let handle2 = rig.registry.register("cam1", &w2).expect("register w2");
    assert!(rig.registry.resolve(handle1).is_none(), "old generation is invalid");
    assert!(rig.registry.resolve(handle2).is_some());
}

#[test]
fn test_dropped_writer_fails_weak_lookup() {
    let rig = rig();
    let w = rig.writer("a");
    rig.registry.register("cam1", &w).expect("register");
    drop(w);
    assert!(rig.registry.get("cam1").is_none(), "registry holds only a weak handle");
    assert!(!rig.registry.is_healthy("cam1"));
}

#[test]
fn test_slot_capacity() {
    let rig = rig();
    let mut writers = Vec::new();
    for i in 0..MAX_STREAMS {
        let w = rig.writer(&format!("w{i}"));
        rig.registry.register(&format!("cam{i}"), &w).expect("register");
        writers.push(w);
    }
    let extra = rig.writer("extra");
    match rig.registry.register("cam-extra", &extra) {
        Err(NvrError::NoSlot { .. }) => {}
        other => panic!("expected NoSlot, got {other:?}"),
    }

    // Freeing one slot makes room again.
    rig.registry.unregister("cam0");
    rig.registry.register("cam-extra", &extra).expect("register after free");
}

#[test]
fn test_registered_names() {
    let rig = rig();
    let w1 = rig.writer("a");
    let w2 = rig.writer("b");
    rig.registry.register("cam1", &w1).unwrap();
    rig.registry.register("cam2", &w2).unwrap();
    let mut names = rig.registry.registered_names();
    names.sort();
    assert_eq!(names, vec!["cam1".to_string(), "cam2".to_string()]);
}
