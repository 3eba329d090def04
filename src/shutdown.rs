// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Shutdown coordination.
//!
//! Two layers of flags: a process-wide coordinator flipped once at shutdown,
//! and per-supervisor flags flipped by `stop(name)`. The ingest read path
//! polls the OR of both so an in-flight blocking read unwinds promptly
//! instead of waiting for the camera's next packet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Process-wide shutdown flag. One instance per process, shared by every
/// supervisor, the HTTP API, and the CLI signal handler.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    initiated: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Flip the process-wide flag. Idempotent.
    pub fn initiate(&self) {
        self.initiated.store(true, Ordering::Release);
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.initiated.load(Ordering::Acquire)
    }
}

/// Per-supervisor control flags, shared between the manager, the worker
/// thread, and the ingest interrupt path.
#[derive(Debug, Default)]
pub struct SupervisorFlags {
    running: AtomicBool,
    shutdown_requested: AtomicBool,
    reconnect_requested: AtomicBool,
    stopping: AtomicBool,
}

impl SupervisorFlags {
    pub fn new() -> Arc<Self> {
        let flags = Self::default();
        flags.running.store(true, Ordering::Release);
        Arc::new(flags)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown_requested.store(true, Ordering::Release);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Ask the worker to close and reopen its source on the next read.
    pub fn request_reconnect(&self) {
        self.reconnect_requested.store(true, Ordering::Release);
    }

    /// Consume a pending reconnect request.
    pub fn take_reconnect_request(&self) -> bool {
        self.reconnect_requested.swap(false, Ordering::AcqRel)
    }

    pub fn set_stopping(&self, value: bool) {
        self.stopping.store(value, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

/// The interrupt hook handed to packet sources: polls the per-supervisor and
/// process-wide flags. Allocation-free on the read path.
#[derive(Clone)]
pub struct Interrupter {
    coordinator: Arc<ShutdownCoordinator>,
    flags: Arc<SupervisorFlags>,
}

impl Interrupter {
    pub fn new(coordinator: Arc<ShutdownCoordinator>, flags: Arc<SupervisorFlags>) -> Self {
        Self { coordinator, flags }
    }

    pub fn is_interrupted(&self) -> bool {
        self.coordinator.is_shutdown_initiated() || self.flags.is_shutdown_requested()
    }

    /// Sleep in 100 ms slices, waking early when interrupted. Used for the
    /// reconnect backoff so `stop` is never blocked behind a long sleep.
    pub fn sleep_interruptibly(&self, total: Duration) -> bool {
        let slice = Duration::from_millis(100);
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.is_interrupted() {
                return false;
            }
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        !self.is_interrupted()
    }
}
