// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Process-wide writer registry.
//!
//! Maps stream names to the currently-installed [`Mp4Writer`] so that
//! event-driven recording starts (motion, alarms) can find and manipulate the
//! active writer. The supervisor owns its writer exclusively; the registry
//! holds weak handles validated by a slot + generation pair, so a stale
//! handle observed after a rotation simply fails to resolve instead of
//! touching a freed writer.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{NvrError, Result};
use crate::mp4::writer::Mp4Writer;

/// Upper bound on concurrently-registered streams.
pub const MAX_STREAMS: usize = 16;

/// Stable reference to a registered writer; resolves only while the same
/// registration is still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterHandle {
    slot: usize,
    generation: u64,
}

#[derive(Default)]
struct Slot {
    name: Option<String>,
    generation: u64,
    writer: Weak<Mp4Writer>,
}

/// Fixed-size slot table guarded by one registry-wide lock. Every insert,
/// lookup, and removal holds the lock for the duration of the slot scan.
pub struct WriterRegistry {
    slots: Mutex<[Slot; MAX_STREAMS]>,
}

impl WriterRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { slots: Mutex::new(std::array::from_fn(|_| Slot::default())) })
    }

    /// Install `writer` for `name`. Any prior entry for the same name is
    /// replaced and its writer closed, so rotation never leaves a gap
    /// visible to external callers: the new writer must already be open
    /// when this is called.
    pub fn register(&self, name: &str, writer: &Arc<Mp4Writer>) -> Result<WriterHandle> {
        let mut slots = self.slots.lock();

        let mut free: Option<usize> = None;
        let mut existing: Option<usize> = None;
        for (i, slot) in slots.iter().enumerate() {
            match &slot.name {
                Some(n) if n == name => existing = Some(i),
                None if free.is_none() => free = Some(i),
                _ => {}
            }
        }

        let idx = match existing.or(free) {
            Some(i) => i,
            None => return Err(NvrError::NoSlot { max: MAX_STREAMS }),
        };

        let previous = std::mem::replace(&mut slots[idx].writer, Arc::downgrade(writer));
        slots[idx].name = Some(name.to_string());
        slots[idx].generation += 1;
        let handle = WriterHandle { slot: idx, generation: slots[idx].generation };
        drop(slots);

        if let Some(old) = previous.upgrade() {
            if !Arc::ptr_eq(&old, writer) {
                if let Err(e) = old.close() {
                    debug!(stream = name, error = %e, "Closing replaced writer failed");
                }
            }
        }
        Ok(handle)
    }

    /// Resolve the writer currently registered for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Mp4Writer>> {
        let slots = self.slots.lock();
        slots
            .iter()
            .find(|s| s.name.as_deref() == Some(name))
            .and_then(|s| s.writer.upgrade())
    }

    /// Resolve a handle, failing if the registration it points at has been
    /// replaced since.
    pub fn resolve(&self, handle: WriterHandle) -> Option<Arc<Mp4Writer>> {
        let slots = self.slots.lock();
        let slot = slots.get(handle.slot)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.writer.upgrade()
    }

    /// Clear the slot for `name` without closing the writer; the caller owns
    /// closure.
    pub fn unregister(&self, name: &str) -> Option<Arc<Mp4Writer>> {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if slot.name.as_deref() == Some(name) {
                let writer = slot.writer.upgrade();
                slot.name = None;
                slot.writer = Weak::new();
                slot.generation += 1;
                return writer;
            }
        }
        None
    }

    /// True if `name` has a registered writer whose `is_recording` flag is
    /// still set.
    pub fn is_healthy(&self, name: &str) -> bool {
        self.get(name).map(|w| w.is_recording()).unwrap_or(false)
    }

    /// Names with any registration, healthy or not.
    pub fn registered_names(&self) -> Vec<String> {
        let slots = self.slots.lock();
        slots.iter().filter_map(|s| s.name.clone()).collect()
    }
}
