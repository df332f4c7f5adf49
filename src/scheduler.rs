//! Worker pool: drives every runnable block's `work()` method within one
//! process. Multiple processes each run their own scheduler; coordination
//! across processes happens only through the shared-memory structures in
//! `registry`, `pool`, and `queue` — there is no cross-process scheduling
//! dependency here.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::block::{Block, BlockContext, WorkStatus};

const INSUFFICIENT_INPUT_BACKOFF: Duration = Duration::from_millis(1);
const OUTPUT_FULL_BACKOFF: Duration = Duration::from_millis(10);

/// One block entry in the scheduler's ready set.
///
/// `block`/`ctx` are wrapped in `UnsafeCell` because only `in_work` (a CAS
/// flag, spec's §4.6 "per-block in-work flag acquired with CAS") guards
/// access to them — the scheduler never takes a lock across a `work()` call.
/// A worker may only dereference the cells after winning the CAS below.
struct Entry {
    block: UnsafeCell<Box<dyn Block>>,
    ctx: UnsafeCell<BlockContext>,
    in_work: AtomicBool,
    done: AtomicBool,
}

unsafe impl Send for Entry {}
unsafe impl Sync for Entry {}

/// Cooperative, polling worker pool. `start` spawns `thread_count` workers
/// that round-robin over the ready set and call `work()` on whichever block
/// is not currently being polled by another worker; `stop` signals them to
/// exit and joins.
pub struct Scheduler {
    entries: Arc<Mutex<Vec<Arc<Entry>>>>,
    running: Arc<AtomicBool>,
    next: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            next: Arc::new(AtomicUsize::new(0)),
            workers: Vec::new(),
        }
    }

    /// Add a block to the ready set, calling `initialize` and `start` on it
    /// before it becomes eligible for polling.
    pub fn add_block(
        &self,
        mut block: Box<dyn Block>,
        mut ctx: BlockContext,
    ) -> crate::error::RuntimeResult<()> {
        block.initialize(&mut ctx)?;
        block.start(&mut ctx)?;
        let entry = Arc::new(Entry {
            block: UnsafeCell::new(block),
            ctx: UnsafeCell::new(ctx),
            in_work: AtomicBool::new(false),
            done: AtomicBool::new(false),
        });
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    /// Spawn `thread_count` worker threads, each running the round-robin
    /// poll loop until `stop` is called.
    pub fn start(&mut self, thread_count: usize) {
        self.running.store(true, Ordering::Release);
        for worker_id in 0..thread_count.max(1) {
            let entries = self.entries.clone();
            let running = self.running.clone();
            let next = self.next.clone();
            let handle = thread::Builder::new()
                .name(format!("flowmesh-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, entries, running, next))
                .expect("failed to spawn scheduler worker thread");
            self.workers.push(handle);
        }
        info!(thread_count, "scheduler started");
    }

    /// Signal every worker to stop and join them. Blocks still in the ready
    /// set do not receive `stop`/`cleanup` here; callers that need orderly
    /// teardown should drain the ready set themselves first.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        info!("scheduler stopped");
    }

    /// Number of blocks still in the ready set (including ones reporting
    /// `Done`, until a worker next visits and removes them).
    pub fn block_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    entries: Arc<Mutex<Vec<Arc<Entry>>>>,
    running: Arc<AtomicBool>,
    next: Arc<AtomicUsize>,
) {
    debug!(worker_id, "scheduler worker started");
    while running.load(Ordering::Acquire) {
        let snapshot: Vec<Arc<Entry>> = entries.lock().unwrap().clone();

        if snapshot.is_empty() {
            thread::sleep(INSUFFICIENT_INPUT_BACKOFF);
            continue;
        }

        let start = next.fetch_add(1, Ordering::Relaxed) % snapshot.len();
        let mut polled_any = false;

        for offset in 0..snapshot.len() {
            let entry = &snapshot[(start + offset) % snapshot.len()];
            if entry.done.load(Ordering::Acquire) {
                continue;
            }
            if entry
                .in_work
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            polled_any = true;
            // Safety: winning the `in_work` CAS above is the only
            // authorization needed to touch `block`/`ctx`. For a terminal
            // status we unbind before releasing `in_work` so no other worker
            // can start a `work()` call against a block mid-teardown.
            let status = unsafe {
                let block = &mut *entry.block.get();
                let ctx = &mut *entry.ctx.get();
                ctx.touch_work();
                block.work(ctx)
            };

            match status {
                WorkStatus::Progress => {
                    entry.in_work.store(false, Ordering::Release);
                }
                WorkStatus::InsufficientInput => {
                    entry.in_work.store(false, Ordering::Release);
                    thread::sleep(INSUFFICIENT_INPUT_BACKOFF);
                }
                WorkStatus::OutputFull => {
                    entry.in_work.store(false, Ordering::Release);
                    thread::sleep(OUTPUT_FULL_BACKOFF);
                }
                WorkStatus::Done => {
                    unsafe { (*entry.ctx.get()).unbind_all_inputs() };
                    entry.done.store(true, Ordering::Release);
                    entry.in_work.store(false, Ordering::Release);
                    remove_done(&entries);
                }
                WorkStatus::Error(kind) => {
                    error!(worker_id, error = %kind, "block failed, removing from ready set");
                    unsafe { (*entry.ctx.get()).unbind_all_inputs() };
                    entry.done.store(true, Ordering::Release);
                    entry.in_work.store(false, Ordering::Release);
                    remove_done(&entries);
                }
            }
            break;
        }

        if !polled_any {
            thread::sleep(INSUFFICIENT_INPUT_BACKOFF);
        }
    }
    debug!(worker_id, "scheduler worker stopped");
}

fn remove_done(entries: &Arc<Mutex<Vec<Arc<Entry>>>>) {
    entries
        .lock()
        .unwrap()
        .retain(|e| !e.done.load(Ordering::Acquire));
}
