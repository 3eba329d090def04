// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Stream manager: the process-wide singleton owning every supervisor slot.
//!
//! All start/stop/restart operations go through the manager's lock over a
//! fixed-size slot table. Replacing a supervisor requires observing that the
//! previous worker has exited (or exhausting the join budget), so at most
//! one supervisor exists per stream name at any time.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Config, StreamConfig, TriggerType};
use crate::error::{ErrorCategory, NvrError, Result};
use crate::events::EventSink;
use crate::hls;
use crate::hls::writer::{HlsWriter, TsEncoderFactory, FRAGMENT_SECONDS, WINDOW_SIZE};
use crate::ingest::SourceFactory;
use crate::mp4::writer::MuxerFactory;
use crate::registry::{WriterRegistry, MAX_STREAMS};
use crate::shutdown::{ShutdownCoordinator, SupervisorFlags};
use crate::storage::paths::{self, StorageLayout};
use crate::supervisor::{
    run_supervisor, PacketTap, SupervisorDeps, SupervisorState, SupervisorStatus,
};

/// Total budget for joining a stopping worker.
pub const STOP_JOIN_BUDGET: Duration = Duration::from_secs(5);
/// After this much of the budget, the worker is considered stuck and the
/// slot is reclaimed regardless.
const STOP_SOFT_BUDGET: Duration = Duration::from_millis(2500);
const STOP_POLL: Duration = Duration::from_millis(50);

struct SupervisorEntry {
    cfg: StreamConfig,
    flags: Arc<SupervisorFlags>,
    status: Arc<SupervisorStatus>,
    hls: Arc<HlsWriter>,
    handle: Option<JoinHandle<()>>,
}

/// JSON-friendly snapshot of one stream's supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatusView {
    pub name: String,
    pub configured: bool,
    pub supervised: bool,
    pub state: &'static str,
    pub is_active: bool,
    pub last_error: ErrorCategory,
    pub reconnect_attempt: u32,
}

pub struct StreamManager {
    config: Config,
    layout: StorageLayout,
    slots: Mutex<Vec<Option<SupervisorEntry>>>,
    registry: Arc<WriterRegistry>,
    coordinator: Arc<ShutdownCoordinator>,
    source_factory: Arc<dyn SourceFactory>,
    muxer_factory: Arc<dyn MuxerFactory>,
    ts_factory: Arc<dyn TsEncoderFactory>,
    events: Arc<dyn EventSink>,
    tap: Option<Arc<dyn PacketTap>>,
}

impl StreamManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        coordinator: Arc<ShutdownCoordinator>,
        source_factory: Arc<dyn SourceFactory>,
        muxer_factory: Arc<dyn MuxerFactory>,
        ts_factory: Arc<dyn TsEncoderFactory>,
        events: Arc<dyn EventSink>,
        tap: Option<Arc<dyn PacketTap>>,
    ) -> Result<Arc<Self>> {
        let layout = StorageLayout::from_config(&config.storage);
        paths::ensure_writable_dir(layout.root())?;
        paths::ensure_writable_dir(layout.mp4_base())?;
        paths::ensure_writable_dir(layout.hls_base())?;

        let mut slots = Vec::with_capacity(MAX_STREAMS);
        slots.resize_with(MAX_STREAMS, || None);

        Ok(Arc::new(Self {
            config,
            layout,
            slots: Mutex::new(slots),
            registry: WriterRegistry::new(),
            coordinator,
            source_factory,
            muxer_factory,
            ts_factory,
            events,
            tap,
        }))
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WriterRegistry> {
        &self.registry
    }

    /// Start a supervisor for `name`. Idempotent against a healthy
    /// supervisor; a dead one (slot occupied, worker gone or writer no
    /// longer recording) is torn down first.
    pub fn start(&self, name: &str) -> Result<()> {
        self.start_with_url(name, None)
    }

    /// `start` variant allowing event-driven callers to supply a resolved
    /// URL that overrides the configured one.
    pub fn start_with_url(&self, name: &str, url_override: Option<&str>) -> Result<()> {
        if self.coordinator.is_shutdown_initiated() {
            return Err(NvrError::ShuttingDown);
        }
        let mut cfg = self
            .config
            .stream(name)
            .cloned()
            .ok_or_else(|| NvrError::StreamNotFound { name: name.to_string() })?;
        if let Some(url) = url_override {
            cfg.url = url.to_string();
        }

        let mut slots = self.slots.lock();

        if let Some(idx) = Self::slot_of(&slots, name) {
            let entry = slots[idx].as_ref().expect("slot checked");
            if self.entry_is_healthy(entry) {
                info!(stream = name, "Supervisor already running");
                return Err(NvrError::AlreadyRunning { name: name.to_string() });
            }
            warn!(stream = name, "Tearing down dead supervisor before restart");
            let entry = slots[idx].take().expect("slot checked");
            self.teardown_entry(name, entry);
        }

        let Some(free) = slots.iter().position(|s| s.is_none()) else {
            return Err(NvrError::NoSlot { max: MAX_STREAMS });
        };

        // Output directories must exist and be writable before the worker
        // starts; failure here is fatal and leaves the slot unoccupied.
        let mp4_dir = self.layout.stream_mp4_dir(name);
        if self.config.storage.record_mp4_directly {
            paths::ensure_writable_dir(&mp4_dir)?;
        }
        let hls_writer = HlsWriter::new(
            None,
            self.layout.hls_base(),
            name,
            FRAGMENT_SECONDS,
            WINDOW_SIZE,
        )?;

        let flags = SupervisorFlags::new();
        let status = SupervisorStatus::new();
        let deps = SupervisorDeps {
            cfg: cfg.clone(),
            mp4_dir,
            record_mp4: self.config.storage.record_mp4_directly,
            source_factory: self.source_factory.clone(),
            muxer_factory: self.muxer_factory.clone(),
            ts_factory: self.ts_factory.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            hls: hls_writer.clone(),
            coordinator: self.coordinator.clone(),
            flags: flags.clone(),
            status: status.clone(),
            tap: self.tap.clone(),
        };

        let handle = std::thread::Builder::new()
            .name(format!("stream-{name}"))
            .spawn(move || run_supervisor(deps))
            .map_err(|e| NvrError::Worker(format!("spawn worker: {e}")))?;

        slots[free] = Some(SupervisorEntry {
            cfg,
            flags,
            status,
            hls: hls_writer,
            handle: Some(handle),
        });
        info!(stream = name, slot = free, "Supervisor started");
        Ok(())
    }

    /// Stop the supervisor for `name`. When this returns the slot is free
    /// and the name can be reused, even if the worker had to be abandoned.
    pub fn stop(&self, name: &str) -> Result<()> {
        let entry = {
            let mut slots = self.slots.lock();
            match Self::slot_of(&slots, name) {
                Some(idx) => slots[idx].take().expect("slot checked"),
                None => return Err(NvrError::StreamNotFound { name: name.to_string() }),
            }
        };
        self.teardown_entry(name, entry);
        Ok(())
    }

    /// `stop` followed by `start`, clearing all HLS segment files in
    /// between.
    pub fn restart(&self, name: &str) -> Result<()> {
        match self.stop(name) {
            Ok(()) | Err(NvrError::StreamNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        let dir = self.layout.stream_hls_dir(name);
        if let Err(e) = hls::cleanup::cleanup_stream_dir(&dir, false) {
            warn!(stream = name, error = %e, "HLS cleanup before restart failed");
        }
        self.start(name)
    }

    /// Ask every live supervisor to close and reopen its source; used when
    /// the upstream proxy restarts and all sessions are stale.
    pub fn signal_reconnect_all(&self) {
        let slots = self.slots.lock();
        for entry in slots.iter().flatten() {
            entry.flags.request_reconnect();
        }
    }

    /// True iff a supervisor exists, its running flag is set, and its last
    /// connection was validated.
    pub fn is_active(&self, name: &str) -> bool {
        let slots = self.slots.lock();
        Self::slot_of(&slots, name)
            .and_then(|idx| slots[idx].as_ref())
            .map(|e| e.flags.is_running() && e.status.is_validated())
            .unwrap_or(false)
    }

    /// Event-driven recording start: succeed idempotently against a healthy
    /// writer; stop and replace an unhealthy one.
    pub fn start_recording(
        &self,
        name: &str,
        url_override: Option<&str>,
        trigger: Option<TriggerType>,
    ) -> Result<()> {
        if self.registry.is_healthy(name) {
            return Ok(());
        }
        if let Some(writer) = self.registry.get(name) {
            // Unhealthy leftover; close it and clear the slot before the
            // fresh start.
            let _ = writer.close();
            let _ = self.registry.unregister(name);
        }
        if let Some(trigger) = trigger {
            info!(stream = name, trigger = ?trigger, "Recording start requested");
        }
        match self.start_with_url(name, url_override) {
            Ok(()) | Err(NvrError::AlreadyRunning { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Status snapshot across configured and supervised streams.
    pub fn statuses(&self) -> Vec<StreamStatusView> {
        let slots = self.slots.lock();
        self.config
            .streams
            .iter()
            .map(|cfg| {
                let entry = Self::slot_of(&slots, &cfg.name).and_then(|i| slots[i].as_ref());
                match entry {
                    Some(e) => StreamStatusView {
                        name: cfg.name.clone(),
                        configured: true,
                        supervised: true,
                        state: e.status.state().name(),
                        is_active: e.flags.is_running() && e.status.is_validated(),
                        last_error: e.status.last_error(),
                        reconnect_attempt: e.status.reconnect_attempt(),
                    },
                    None => StreamStatusView {
                        name: cfg.name.clone(),
                        configured: true,
                        supervised: false,
                        state: SupervisorState::Stopped.name(),
                        is_active: false,
                        last_error: ErrorCategory::None,
                        reconnect_attempt: 0,
                    },
                }
            })
            .collect()
    }

    /// Names of currently-supervised streams.
    pub fn active_stream_names(&self) -> Vec<String> {
        let slots = self.slots.lock();
        slots
            .iter()
            .flatten()
            .map(|e| e.cfg.name.clone())
            .collect()
    }

    /// Consistent playlist snapshot for HTTP readers (briefly holds the
    /// writer mutex).
    pub fn playlist_snapshot(&self, name: &str) -> Option<String> {
        let hls = {
            let slots = self.slots.lock();
            Self::slot_of(&slots, name).and_then(|i| slots[i].as_ref()).map(|e| e.hls.clone())
        }?;
        hls.playlist_snapshot()
    }

    /// Stop everything and run the process-wide HLS cleanup. Called once
    /// from the shutdown orchestrator.
    pub fn shutdown(&self) {
        self.coordinator.initiate();
        let names = self.active_stream_names();
        for name in &names {
            if let Err(e) = self.stop(name) {
                warn!(stream = name, error = %e, "Stop during shutdown failed");
            }
        }
        if let Err(e) = hls::cleanup::cleanup_all(self.layout.hls_base(), &[]) {
            warn!(error = %e, "HLS cleanup during shutdown failed");
        }
        info!("Stream manager shut down");
    }

    // ─────────────────────── internals ──────────────────────────────────────

    fn slot_of(slots: &[Option<SupervisorEntry>], name: &str) -> Option<usize> {
        slots
            .iter()
            .position(|s| s.as_ref().map(|e| e.cfg.name == name).unwrap_or(false))
    }

    /// A supervisor is dead when its worker has exited on its own, or when
    /// it claims to be recording but its writer's recording flag is clear.
    fn entry_is_healthy(&self, entry: &SupervisorEntry) -> bool {
        if !entry.flags.is_running() {
            return false;
        }
        if entry.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true) {
            return false;
        }
        if self.config.storage.record_mp4_directly {
            if let Some(writer) = self.registry.get(&entry.cfg.name) {
                if !writer.is_recording() {
                    return false;
                }
            }
        }
        true
    }

    /// Signal the worker and join it within the budget. The slot has already
    /// been vacated; cleanup proceeds regardless of whether the join
    /// completes so the name is reusable.
    fn teardown_entry(&self, name: &str, mut entry: SupervisorEntry) {
        entry.flags.request_stop();
        let Some(handle) = entry.handle.take() else {
            return;
        };

        let started = Instant::now();
        let mut nudged = false;
        while started.elapsed() < STOP_JOIN_BUDGET {
            if handle.is_finished() {
                let _ = handle.join();
                info!(stream = name, "Worker joined");
                return;
            }
            if !nudged && started.elapsed() >= STOP_SOFT_BUDGET {
                // Re-assert the flags in case the worker raced past the
                // first observation, then give it one more grace period.
                entry.flags.request_stop();
                nudged = true;
            }
            std::thread::sleep(STOP_POLL);
        }

        warn!(stream = name, "Worker did not exit within budget; abandoning thread");
        // The worker will still observe the flags at its next blocking
        // point; meanwhile the registry slot must not leak.
        let _ = self.registry.unregister(name);
    }
}
