//! Boundary and conservation properties that don't fit a single named
//! scenario: table exhaustion, refcount round-trips, and the free-list
//! invariants the registry and pool both rely on.
#![cfg(unix)]

use std::sync::Arc;

use flowmesh_rt::registry::{MAX_BUFFERS, MAX_CONSUMERS};
use flowmesh_rt::{Handle, Pool, PortQueue, Registry, RuntimeError};
use uuid::Uuid;

fn unique(tag: &str) -> String {
    format!("/flowmesh_property_{tag}_{}", Uuid::new_v4().simple())
}

/// Registering `MAX_CONSUMERS` cursors on one queue succeeds; the next
/// registration fails with `NoConsumerSlot` rather than silently wrapping or
/// overwriting an existing cursor.
#[test]
fn consumer_table_exhaustion_returns_no_consumer_slot() {
    let queue = PortQueue::create(&unique("consumer_exhaustion"), 8).unwrap();

    for _ in 0..MAX_CONSUMERS {
        queue.register_consumer().unwrap();
    }

    match queue.register_consumer() {
        Err(RuntimeError::NoConsumerSlot) => {}
        other => panic!("expected NoConsumerSlot, got {other:?}"),
    }
}

/// Allocating `MAX_BUFFERS` buffer-metadata slots succeeds; the next
/// allocation fails with `NoBufferSlot` even though the backing pool still
/// has free blocks.
#[test]
fn buffer_metadata_exhaustion_returns_no_buffer_slot() {
    let registry = Registry::open_or_create(&unique("buffer_exhaustion_registry")).unwrap();
    let pool = Pool::create(&unique("buffer_exhaustion_pool"), 16, MAX_BUFFERS as u32 + 8).unwrap();
    let registry = Arc::new(registry);
    let pool = Arc::new(pool);

    let mut handles = Vec::with_capacity(MAX_BUFFERS);
    for _ in 0..MAX_BUFFERS {
        handles.push(Handle::allocate(registry.clone(), pool.clone(), 1, 0, 16).unwrap());
    }

    match Handle::allocate(registry.clone(), pool.clone(), 1, 0, 16) {
        Err(RuntimeError::NoBufferSlot) => {}
        other => panic!("expected NoBufferSlot, got {other:?}"),
    }

    // Releasing one slot makes room for exactly one more allocation.
    handles.pop();
    Handle::allocate(registry, pool, 1, 0, 16).unwrap();
}

/// Round-tripping `register_process`/`unregister_process` MAX_PROCESSES
/// times in a row never exhausts the slot table: each unregister returns its
/// slot to the free list for the next register to reuse.
#[test]
fn process_register_unregister_round_trip_does_not_leak_slots() {
    let registry = Registry::open_or_create(&unique("process_round_trip")).unwrap();

    for _ in 0..200 {
        let slot = registry
            .register_process(std::process::id() as i32, flowmesh_rt::ProcessRole::Worker, "p")
            .unwrap();
        registry.unregister_process(slot).unwrap();
    }
}

/// A buffer's refcount is conserved exactly across a fan-out push: N
/// consumers registered before the push means the pool block is freed only
/// after exactly N pops-and-drops, never before and never requiring more.
#[test]
fn refcount_conservation_across_fan_out() {
    let registry = Arc::new(Registry::open_or_create(&unique("refcount_registry")).unwrap());
    let pool = Arc::new(Pool::create(&unique("refcount_pool"), 16, 4).unwrap());
    let queue = Arc::new(PortQueue::create(&unique("refcount_queue"), 8).unwrap());

    const CONSUMERS: usize = 5;
    let consumers: Vec<_> = (0..CONSUMERS).map(|_| queue.register_consumer().unwrap()).collect();

    let initial_free = pool.free_count();
    let handle = Handle::allocate(registry.clone(), pool.clone(), 1, 0, 16).unwrap();
    let buffer_id = handle.buffer_id();
    queue.push(buffer_id, |n| handle.add_ref(n)).unwrap();
    drop(handle);

    assert_eq!(pool.free_count(), initial_free - 1, "block must still be held");

    let mut opened: Vec<_> = Vec::new();
    for (i, &consumer) in consumers.iter().enumerate() {
        let id = queue.pop(consumer).unwrap();
        assert_eq!(id, buffer_id);
        opened.push(Handle::open(registry.clone(), pool.clone(), id).unwrap());
        if i + 1 < CONSUMERS {
            assert_eq!(
                pool.free_count(),
                initial_free - 1,
                "block must stay held until the last consumer drops its handle"
            );
        }
    }

    drop(opened);
    assert_eq!(pool.free_count(), initial_free, "block returns to the pool exactly once");
}

/// A consumer registered after some buffers were already published sees only
/// what is pushed from that point on, never the backlog.
#[test]
fn late_consumer_does_not_see_backlog() {
    let registry = Arc::new(Registry::open_or_create(&unique("late_consumer_registry")).unwrap());
    let pool = Arc::new(Pool::create(&unique("late_consumer_pool"), 16, 16).unwrap());
    let queue = Arc::new(PortQueue::create(&unique("late_consumer_queue"), 16).unwrap());

    let early = queue.register_consumer().unwrap();
    for _ in 0..4 {
        let handle = Handle::allocate(registry.clone(), pool.clone(), 1, 0, 16).unwrap();
        queue.push(handle.buffer_id(), |n| handle.add_ref(n)).unwrap();
    }

    let late = queue.register_consumer().unwrap();
    assert_eq!(queue.pending(late).unwrap(), 0);
    assert_eq!(queue.pending(early).unwrap(), 4);

    for _ in 0..2 {
        let handle = Handle::allocate(registry.clone(), pool.clone(), 1, 0, 16).unwrap();
        queue.push(handle.buffer_id(), |n| handle.add_ref(n)).unwrap();
    }
    assert_eq!(queue.pending(late).unwrap(), 2);
    assert_eq!(queue.pending(early).unwrap(), 6);
}

/// `register_consumer` then `unregister_consumer` releases exactly the refs
/// the consumer would have consumed between join and leave: buffers pushed
/// before registration are untouched, buffers pushed and popped are already
/// released by the pop's own handle drop, and buffers pushed but never
/// popped have their pending ref dropped by `unregister_consumer` itself.
#[test]
fn unregister_consumer_releases_pending_refs_between_cursor_and_tail() {
    let registry = Arc::new(Registry::open_or_create(&unique("unregister_registry")).unwrap());
    let pool_segment = unique("unregister_pool");
    let pool = Arc::new(Pool::create(&pool_segment, 16, 8).unwrap());
    let pool_id = registry.register_pool("p", 16, 8, &pool_segment).unwrap();
    let queue = Arc::new(PortQueue::create(&unique("unregister_queue"), 8).unwrap());

    // Published before the consumer joins; it never sees or owes a ref for this one.
    let before = Handle::allocate(registry.clone(), pool.clone(), pool_id, 0, 16).unwrap();
    queue.push(before.buffer_id(), |n| before.add_ref(n)).unwrap();
    drop(before);
    let initial_free = pool.free_count();

    let consumer = queue.register_consumer().unwrap();

    let popped = Handle::allocate(registry.clone(), pool.clone(), pool_id, 0, 16).unwrap();
    queue.push(popped.buffer_id(), |n| popped.add_ref(n)).unwrap();
    drop(popped);
    let popped_id = queue.pop(consumer).unwrap();
    drop(Handle::open(registry.clone(), pool.clone(), popped_id).unwrap());
    assert_eq!(pool.free_count(), initial_free, "popped-and-dropped buffer already released");

    let pending = Handle::allocate(registry.clone(), pool.clone(), pool_id, 0, 16).unwrap();
    let pending_id = pending.buffer_id();
    queue.push(pending_id, |n| pending.add_ref(n)).unwrap();
    drop(pending);
    assert_eq!(pool.free_count(), initial_free - 1, "never-popped buffer still held for this consumer");

    let still_pending = queue.unregister_consumer(consumer).unwrap();
    assert_eq!(still_pending, vec![pending_id]);
    for buffer_id in still_pending {
        registry.release_buffer_ref(buffer_id).unwrap();
    }
    assert_eq!(
        pool.free_count(),
        initial_free,
        "releasing the refs unregister_consumer reports must free the pending buffer"
    );
    assert!(registry.find_slot(pending_id).is_none());
}

/// Allocating and freeing well past `MAX_BUFFERS` buffers, one at a time,
/// forces the hash index's bucket range to wrap and collide with slots
/// freed earlier in the run. Every buffer still alive must remain
/// findable even when its bucket was vacated by an unrelated, already-freed
/// buffer ahead of it in the same collision chain.
#[test]
fn find_slot_survives_wraparound_after_interleaved_frees() {
    let registry = Arc::new(Registry::open_or_create(&unique("wraparound_registry")).unwrap());
    let pool = Arc::new(Pool::create(&unique("wraparound_pool"), 16, 8).unwrap());

    let mut held: Vec<Handle> = Vec::new();
    for round in 0..(MAX_BUFFERS * 3) {
        let handle = Handle::allocate(registry.clone(), pool.clone(), 1, 0, 16).unwrap();
        held.push(handle);
        // Keep only the latest few alive so allocation keeps recycling pool
        // blocks and metadata slots (and hash-index buckets) while a buffer
        // allocated several rounds ago is still reachable by id.
        if held.len() > 3 {
            held.remove(0);
        }
        if round % 7 == 0 {
            for h in &held {
                let id = h.buffer_id();
                let reopened = Handle::open(registry.clone(), pool.clone(), id)
                    .unwrap_or_else(|e| panic!("buffer {id} should still be findable: {e}"));
                drop(reopened);
            }
        }
    }
}
