//! Broadcast Port Queue: a single-producer, multi-independent-consumer ring
//! living in its own shared-memory segment. Every registered consumer reads
//! every pushed buffer id exactly once, at its own pace; backpressure is
//! governed by the slowest consumer's cursor.
//!
//! Refcount policy (spec's open question, resolved): a push increments the
//! buffer's refcount by the number of currently-registered consumers;
//! each consumer's pop is paired with exactly one decrement (via dropping
//! the [`crate::handle::Handle`] built from it). A consumer that unbinds
//! before draining owes a decrement for every id still between its cursor
//! and `head`; [`PortQueue::unregister_consumer`] hands those ids back to
//! the caller rather than releasing them itself, since doing so needs the
//! registry/pool this queue has no handle to. The ring itself carries only
//! a `buffer_id` per slot, not a richer struct — the buffer metadata table
//! remains the authoritative source for size/timestamp.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::registry::MAX_CONSUMERS;
use crate::shm;
use crate::sync::ShmMutex;
use crate::sync::ShmCondvar;

const QUEUE_MAGIC: u64 = 0x464D51554500; // "FMQUE\0"
const QUEUE_VERSION: u32 = 1;
const CACHE_LINE: usize = 64;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[repr(C)]
struct ConsumerSlot {
    active: AtomicU32,
    cursor: AtomicU64,
}

#[repr(C, align(64))]
struct QueueHeader {
    magic: u64,
    version: u32,
    capacity: u32,
    closed: AtomicU32,
    head: AtomicU64,
    mutex: ShmMutex,
    not_full: ShmCondvar,
    not_empty: ShmCondvar,
}

/// A single consumer's registration handle for a [`PortQueue`]. Holding one
/// is how a process remembers which cursor slot it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerId(pub u32);

/// Handle to an open Broadcast Port Queue segment.
pub struct PortQueue {
    ptr: *mut u8,
    fd: i32,
    segment_name: String,
    total_size: usize,
    capacity: u32,
    owner: bool,
}

unsafe impl Send for PortQueue {}
unsafe impl Sync for PortQueue {}

impl PortQueue {
    fn layout(capacity: u32) -> (usize, usize, usize, usize) {
        let header_size = align_up(std::mem::size_of::<QueueHeader>(), CACHE_LINE);
        let consumers_size = align_up(
            std::mem::size_of::<ConsumerSlot>() * MAX_CONSUMERS,
            CACHE_LINE,
        );
        let slots_offset = header_size + consumers_size;
        let slots_size = align_up(std::mem::size_of::<AtomicU64>() * capacity as usize, CACHE_LINE);
        let total = slots_offset + slots_size;
        (header_size, consumers_size, slots_offset, total)
    }

    /// Create a new queue segment with room for `capacity` in-flight buffer
    /// ids (must be a power of two, per spec's recommendation, enforced by
    /// [`crate::config::Config::validate`] upstream).
    pub fn create(segment_name: &str, capacity: u32) -> RuntimeResult<Self> {
        let (_, _, _, total_size) = Self::layout(capacity);
        let (ptr, fd) = shm::create_shm(segment_name, total_size)?;

        unsafe {
            let header = &mut *(ptr as *mut QueueHeader);
            header.magic = QUEUE_MAGIC;
            header.version = QUEUE_VERSION;
            header.capacity = capacity;
            header.closed = AtomicU32::new(0);
            header.head = AtomicU64::new(0);
            header.mutex.init_in_place()?;
            header.not_full.init_in_place()?;
            header.not_empty.init_in_place()?;

            for slot in Self::consumers_mut(ptr) {
                slot.active.store(0, Ordering::Relaxed);
                slot.cursor.store(0, Ordering::Relaxed);
            }
            for slot in Self::ring_mut(ptr, capacity) {
                slot.store(0, Ordering::Relaxed);
            }
        }

        debug!(segment_name, capacity, "port queue created");

        Ok(Self {
            ptr,
            fd,
            segment_name: segment_name.to_string(),
            total_size,
            capacity,
            owner: true,
        })
    }

    /// Open an existing queue segment, validating its header.
    pub fn open(segment_name: &str, capacity: u32) -> RuntimeResult<Self> {
        let (_, _, _, total_size) = Self::layout(capacity);
        let (ptr, fd) = shm::open_shm(segment_name, total_size)?;

        unsafe {
            let header = &*(ptr as *const QueueHeader);
            if header.magic != QUEUE_MAGIC {
                shm::close_shm(ptr, total_size, fd);
                return Err(RuntimeError::BadMagic);
            }
            if header.version != QUEUE_VERSION {
                shm::close_shm(ptr, total_size, fd);
                return Err(RuntimeError::IncompatibleVersion);
            }
            if header.capacity != capacity {
                shm::close_shm(ptr, total_size, fd);
                return Err(RuntimeError::Config(format!(
                    "queue '{segment_name}' capacity mismatch: expected {capacity}, segment has {}",
                    header.capacity
                )));
            }
        }

        Ok(Self {
            ptr,
            fd,
            segment_name: segment_name.to_string(),
            total_size,
            capacity,
            owner: false,
        })
    }

    fn header(&self) -> &QueueHeader {
        unsafe { &*(self.ptr as *const QueueHeader) }
    }

    unsafe fn consumers_mut<'a>(ptr: *mut u8) -> &'a [ConsumerSlot] {
        let header_size = align_up(std::mem::size_of::<QueueHeader>(), CACHE_LINE);
        let base = ptr.add(header_size) as *const ConsumerSlot;
        std::slice::from_raw_parts(base, MAX_CONSUMERS)
    }

    unsafe fn ring_mut<'a>(ptr: *mut u8, capacity: u32) -> &'a [AtomicU64] {
        let (_, _, slots_offset, _) = Self::layout(capacity);
        let base = ptr.add(slots_offset) as *const AtomicU64;
        std::slice::from_raw_parts(base, capacity as usize)
    }

    fn consumers(&self) -> &[ConsumerSlot] {
        unsafe { Self::consumers_mut(self.ptr) }
    }

    fn ring(&self) -> &[AtomicU64] {
        unsafe { Self::ring_mut(self.ptr, self.capacity) }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Register a new consumer, starting its cursor at the current head so
    /// it only sees buffers pushed after registration, not backlog.
    pub fn register_consumer(&self) -> RuntimeResult<ConsumerId> {
        let header = self.header();
        let _guard = unsafe { header.mutex.lock() };

        let consumers = self.consumers();
        for (i, slot) in consumers.iter().enumerate() {
            if slot
                .active
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.cursor.store(header.head.load(Ordering::Acquire), Ordering::Release);
                return Ok(ConsumerId(i as u32));
            }
        }
        Err(RuntimeError::NoConsumerSlot)
    }

    /// Unregister `id`, freeing its consumer slot, and return every buffer id
    /// still between its cursor and `head` so the caller can release the
    /// reference each one would have consumed had the consumer kept reading.
    pub fn unregister_consumer(&self, id: ConsumerId) -> RuntimeResult<Vec<u64>> {
        let header = self.header();
        let _guard = unsafe { header.mutex.lock() };

        let slot = self
            .consumers()
            .get(id.0 as usize)
            .ok_or(RuntimeError::InvalidTransition)?;

        let cursor = slot.cursor.load(Ordering::Acquire);
        let head = header.head.load(Ordering::Acquire);
        let mut pending = Vec::with_capacity((head - cursor) as usize);
        let mut i = cursor;
        while i < head {
            pending.push(self.ring()[(i % self.capacity as u64) as usize].load(Ordering::Acquire));
            i += 1;
        }

        slot.active.store(0, Ordering::Release);
        unsafe {
            header.not_full.notify_all();
        }
        Ok(pending)
    }

    fn slowest_cursor(&self) -> Option<u64> {
        self.consumers()
            .iter()
            .filter(|slot| slot.active.load(Ordering::Acquire) != 0)
            .map(|slot| slot.cursor.load(Ordering::Acquire))
            .min()
    }

    fn active_consumer_count(&self) -> u32 {
        self.consumers()
            .iter()
            .filter(|slot| slot.active.load(Ordering::Acquire) != 0)
            .count() as u32
    }

    /// Push a buffer id, blocking until there is room (bounded by the
    /// slowest active consumer's cursor) or the queue is closed.
    /// `on_admit` is called with the number of consumers the push will fan
    /// out to, while still holding the queue's lock, so the caller can bump
    /// the buffer's refcount atomically with the write (e.g.
    /// `Handle::add_ref`).
    pub fn push(&self, buffer_id: u64, on_admit: impl FnOnce(u32) -> RuntimeResult<()>) -> RuntimeResult<()> {
        self.push_with_timeout(buffer_id, None, on_admit)
    }

    pub fn push_with_timeout(
        &self,
        buffer_id: u64,
        timeout: Option<Duration>,
        on_admit: impl FnOnce(u32) -> RuntimeResult<()>,
    ) -> RuntimeResult<()> {
        let header = self.header();
        let mut guard = unsafe { header.mutex.lock() };

        loop {
            if header.closed.load(Ordering::Acquire) != 0 {
                return Err(RuntimeError::QueueClosed);
            }
            let head = header.head.load(Ordering::Acquire);
            let slowest = self.slowest_cursor().unwrap_or(head);
            if head.saturating_sub(slowest) < self.capacity as u64 {
                break;
            }
            guard = match timeout {
                None => unsafe { header.not_full.wait(guard) },
                Some(t) => {
                    let (g, woken) = unsafe { header.not_full.wait_timeout(guard, t) };
                    if !woken {
                        return Err(RuntimeError::Timeout);
                    }
                    g
                }
            };
        }

        let consumer_count = self.active_consumer_count();
        on_admit(consumer_count)?;

        let head = header.head.load(Ordering::Acquire);
        self.ring()[(head % self.capacity as u64) as usize].store(buffer_id, Ordering::Release);
        header.head.store(head + 1, Ordering::Release);

        unsafe {
            header.not_empty.notify_all();
        }
        drop(guard);
        Ok(())
    }

    /// Pop the next buffer id for `id`, blocking until one is available or
    /// the queue is closed with nothing left for this consumer.
    pub fn pop(&self, id: ConsumerId) -> RuntimeResult<u64> {
        self.pop_with_timeout(id, None)
    }

    pub fn pop_with_timeout(&self, id: ConsumerId, timeout: Option<Duration>) -> RuntimeResult<u64> {
        let header = self.header();
        let consumer = self
            .consumers()
            .get(id.0 as usize)
            .ok_or(RuntimeError::InvalidTransition)?;

        let mut guard = unsafe { header.mutex.lock() };

        loop {
            let cursor = consumer.cursor.load(Ordering::Acquire);
            let head = header.head.load(Ordering::Acquire);
            if cursor < head {
                let buffer_id = self.ring()[(cursor % self.capacity as u64) as usize].load(Ordering::Acquire);
                consumer.cursor.store(cursor + 1, Ordering::Release);
                unsafe {
                    header.not_full.notify_all();
                }
                return Ok(buffer_id);
            }
            if header.closed.load(Ordering::Acquire) != 0 {
                return Err(RuntimeError::QueueClosed);
            }
            guard = match timeout {
                None => unsafe { header.not_empty.wait(guard) },
                Some(t) => {
                    let (g, woken) = unsafe { header.not_empty.wait_timeout(guard, t) };
                    if !woken {
                        return Err(RuntimeError::Timeout);
                    }
                    g
                }
            };
        }
    }

    /// Number of buffers pushed but not yet popped by `id`, without
    /// consuming any of them.
    pub fn pending(&self, id: ConsumerId) -> RuntimeResult<u64> {
        let header = self.header();
        let consumer = self
            .consumers()
            .get(id.0 as usize)
            .ok_or(RuntimeError::InvalidTransition)?;
        let _guard = unsafe { header.mutex.lock() };
        let cursor = consumer.cursor.load(Ordering::Acquire);
        let head = header.head.load(Ordering::Acquire);
        Ok(head.saturating_sub(cursor))
    }

    /// Close the queue: wakes every blocked pusher/popper. Consumers with
    /// unread data can still drain it; `pop` only returns `QueueClosed`
    /// once a consumer's cursor has caught up to `head`.
    pub fn close(&self) {
        let header = self.header();
        let _guard = unsafe { header.mutex.lock() };
        header.closed.store(1, Ordering::Release);
        unsafe {
            header.not_full.notify_all();
            header.not_empty.notify_all();
        }
        warn!(segment_name = %self.segment_name, "queue closed");
    }
}

impl Drop for PortQueue {
    fn drop(&mut self) {
        unsafe {
            shm::close_shm(self.ptr, self.total_size, self.fd);
        }
        if self.owner {
            let _ = shm::unlink_shm(&self.segment_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/flowmesh_test_queue_{tag}_{}", std::process::id())
    }

    #[test]
    fn single_consumer_sees_pushed_buffers_in_order() {
        let queue = PortQueue::create(&unique_name("order"), 4).unwrap();
        let consumer = queue.register_consumer().unwrap();

        for i in 1..=3u64 {
            queue.push(i, |_n| Ok(())).unwrap();
        }
        for i in 1..=3u64 {
            assert_eq!(queue.pop(consumer).unwrap(), i);
        }
    }

    #[test]
    fn broadcast_delivers_to_every_registered_consumer() {
        let queue = PortQueue::create(&unique_name("broadcast"), 4).unwrap();
        let a = queue.register_consumer().unwrap();
        let b = queue.register_consumer().unwrap();

        queue.push(42, |n| {
            assert_eq!(n, 2);
            Ok(())
        }).unwrap();

        assert_eq!(queue.pop(a).unwrap(), 42);
        assert_eq!(queue.pop(b).unwrap(), 42);
    }

    #[test]
    fn push_blocks_on_slowest_consumer_then_admits_after_pop() {
        let queue = PortQueue::create(&unique_name("backpressure"), 2).unwrap();
        let slow = queue.register_consumer().unwrap();

        queue.push(1, |_| Ok(())).unwrap();
        queue.push(2, |_| Ok(())).unwrap();

        // Queue full relative to `slow`'s cursor; push must time out.
        let result = queue.push_with_timeout(3, Some(Duration::from_millis(20)), |_| Ok(()));
        assert!(matches!(result, Err(RuntimeError::Timeout)));

        assert_eq!(queue.pop(slow).unwrap(), 1);
        queue.push_with_timeout(3, Some(Duration::from_millis(50)), |_| Ok(())).unwrap();
    }

    #[test]
    fn close_wakes_blocked_pop_with_queue_closed() {
        let queue = PortQueue::create(&unique_name("close"), 4).unwrap();
        let consumer = queue.register_consumer().unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                queue.close();
            });
            let result = queue.pop(consumer);
            assert!(matches!(result, Err(RuntimeError::QueueClosed)));
        });
    }

    #[test]
    fn pending_counts_without_consuming() {
        let queue = PortQueue::create(&unique_name("pending"), 4).unwrap();
        let consumer = queue.register_consumer().unwrap();

        queue.push(1, |_| Ok(())).unwrap();
        queue.push(2, |_| Ok(())).unwrap();
        assert_eq!(queue.pending(consumer).unwrap(), 2);
        assert_eq!(queue.pending(consumer).unwrap(), 2, "pending must not consume");

        assert_eq!(queue.pop(consumer).unwrap(), 1);
        assert_eq!(queue.pending(consumer).unwrap(), 1);
    }

    #[test]
    fn new_consumer_does_not_see_backlog_pushed_before_registration() {
        let queue = PortQueue::create(&unique_name("backlog"), 4).unwrap();
        queue.push(1, |_| Ok(())).unwrap();

        let late = queue.register_consumer().unwrap();
        queue.push(2, |_| Ok(())).unwrap();

        assert_eq!(queue.pop(late).unwrap(), 2);
    }
}
