//! Process lifecycle: heartbeat thread plus the reclaim path that cleans up
//! after a process that died without unregistering.
//!
//! `Registry::reclaim_dead_processes` (`src/registry/mod.rs`) implements the
//! cross-process half of the cascade: mark the process inactive, unregister
//! its owned blocks, and drop the implicit reference each buffer it created
//! still holds, freeing the pool block if nothing else referenced it. A
//! crashed process's own input-port consumer slots are not reachable from
//! here — that half of the cascade (`BlockContext::unbind_all_inputs`,
//! called from its `Drop` and from the scheduler when a block finishes or
//! errors) only runs inside the process that owns the `PortQueue` handle.
//! This module owns the two pieces spec.md §4.7 describes around the
//! cross-process call: the periodic heartbeat writer, and a convenience loop
//! for running reclaim on an interval from a supervisor process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::ids::ProcessSlot;
use crate::registry::Registry;

/// Background heartbeat writer for one process's slot. Write `now_ns()`
/// into the process entry roughly every `interval`; `spawn` returns a
/// handle whose `Drop` stops the thread and joins it, so a process that
/// simply lets the `Heartbeat` go out of scope stops heartbeating cleanly.
pub struct Heartbeat {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Spawn a thread that calls `registry.update_heartbeat(slot)` every
    /// `interval` until stopped.
    pub fn spawn(registry: Arc<Registry>, slot: ProcessSlot, interval: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let handle = thread::Builder::new()
            .name(format!("flowmesh-heartbeat-{slot}"))
            .spawn(move || {
                while thread_running.load(Ordering::Acquire) {
                    if let Err(e) = registry.update_heartbeat(slot) {
                        warn!(slot, error = %e, "heartbeat update failed, stopping");
                        break;
                    }
                    thread::sleep(interval);
                }
            })
            .expect("failed to spawn heartbeat thread");

        Self {
            running,
            handle: Some(handle),
        }
    }

    /// Stop the heartbeat thread and wait for it to exit.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Run `registry.reclaim_dead_processes` once every `interval`, forever,
/// until `running` is cleared. Intended for a supervisor process; any
/// process may also call `registry.reclaim_dead_processes` directly
/// on-demand (e.g. right after `open_or_create`) per spec.md §4.7.
pub fn run_reclaim_loop(registry: Arc<Registry>, liveness_timeout: Duration, interval: Duration, running: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("flowmesh-reclaim".into())
        .spawn(move || {
            let timeout_ns = liveness_timeout.as_nanos() as u64;
            while running.load(Ordering::Acquire) {
                let reclaimed = registry.reclaim_dead_processes(timeout_ns);
                if !reclaimed.is_empty() {
                    info!(count = reclaimed.len(), "reclaimed dead processes");
                }
                thread::sleep(interval);
            }
        })
        .expect("failed to spawn reclaim loop thread")
}
