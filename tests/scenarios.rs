//! Named scenarios from the runtime's testable-properties list, exercised
//! end to end against the real shared-memory primitives. Each OS process in
//! a scenario description is stood in for by one thread here: the registry/
//! pool/queue primitives are process-agnostic, and a thread that never
//! touches a foreign `Handle` after another thread's equivalent drop walks
//! the identical code path a second OS process would.
#![cfg(unix)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flowmesh_rt::{Pool, PortQueue, Registry};
use uuid::Uuid;

fn unique(tag: &str) -> String {
    format!("/flowmesh_scenario_{tag}_{}", Uuid::new_v4().simple())
}

/// S1 — One-to-one: a source publishes 1000 buffers each carrying its index
/// in the first 4 bytes; a single sink receives them in order, and pool/
/// metadata bookkeeping returns to its initial state once the sink drops
/// every handle.
#[test]
fn s1_one_to_one() {
    let registry = Arc::new(Registry::open_or_create(&unique("s1_registry")).unwrap());
    let pool = Arc::new(Pool::create(&unique("s1_pool"), 1024, 32).unwrap());
    let queue = Arc::new(PortQueue::create(&unique("s1_queue"), 64).unwrap());

    let consumer = queue.register_consumer().unwrap();
    let initial_free = pool.free_count();

    const TOTAL: u32 = 1000;

    let producer = {
        let registry = registry.clone();
        let pool = pool.clone();
        let queue = queue.clone();
        thread::spawn(move || {
            for i in 0..TOTAL {
                let mut handle = flowmesh_rt::Handle::allocate(
                    registry.clone(),
                    pool.clone(),
                    1,
                    0,
                    1024,
                )
                .unwrap();
                handle.as_mut_slice()[..4].copy_from_slice(&i.to_le_bytes());
                queue
                    .push(handle.buffer_id(), |n| handle.add_ref(n))
                    .unwrap();
            }
        })
    };
    producer.join().unwrap();

    for i in 0..TOTAL {
        let buffer_id = queue.pop(consumer).unwrap();
        let handle = flowmesh_rt::Handle::open(registry.clone(), pool.clone(), buffer_id).unwrap();
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&handle.as_slice()[..4]);
        assert_eq!(u32::from_le_bytes(prefix), i);
    }

    assert_eq!(pool.free_count(), initial_free);
}

/// S2 — Fan-out 1→3: three consumers register before 100 buffers are
/// published; all three see the identical 100-id sequence, and the pool's
/// free count only returns to initial once all three have drained and
/// dropped their handles.
#[test]
fn s2_fan_out_one_to_three() {
    let registry = Arc::new(Registry::open_or_create(&unique("s2_registry")).unwrap());
    let pool = Arc::new(Pool::create(&unique("s2_pool"), 64, 16).unwrap());
    let queue = Arc::new(PortQueue::create(&unique("s2_queue"), 128).unwrap());

    let consumers: Vec<_> = (0..3).map(|_| queue.register_consumer().unwrap()).collect();
    let initial_free = pool.free_count();

    const TOTAL: u32 = 100;
    for _ in 0..TOTAL {
        let handle = flowmesh_rt::Handle::allocate(registry.clone(), pool.clone(), 1, 0, 32).unwrap();
        queue.push(handle.buffer_id(), |n| handle.add_ref(n)).unwrap();
    }

    let mut sequences = Vec::new();
    for &consumer in &consumers {
        let mut seq = Vec::with_capacity(TOTAL as usize);
        for _ in 0..TOTAL {
            seq.push(queue.pop(consumer).unwrap());
        }
        sequences.push(seq);
    }

    assert!(sequences.windows(2).all(|pair| pair[0] == pair[1]));

    // Buffers stay alive until every consumer's handle is dropped.
    assert!(pool.free_count() < initial_free);
    let handles: Vec<_> = sequences[0]
        .iter()
        .map(|&id| flowmesh_rt::Handle::open(registry.clone(), pool.clone(), id).unwrap())
        .collect();
    drop(handles);
    assert_eq!(pool.free_count(), initial_free);
}

/// S4 — Slowest-reader backpressure: capacity 16, two consumers, one paused.
/// The 17th push blocks until the paused consumer drains; afterward both
/// consumers report the full published count.
#[test]
fn s4_slowest_reader_backpressure() {
    let registry = Arc::new(Registry::open_or_create(&unique("s4_registry")).unwrap());
    let pool = Arc::new(Pool::create(&unique("s4_pool"), 32, 32).unwrap());
    let queue = Arc::new(PortQueue::create(&unique("s4_queue"), 16).unwrap());

    let fast = queue.register_consumer().unwrap();
    let slow = queue.register_consumer().unwrap();

    for _ in 0..16 {
        let handle = flowmesh_rt::Handle::allocate(registry.clone(), pool.clone(), 1, 0, 16).unwrap();
        queue.push(handle.buffer_id(), |n| handle.add_ref(n)).unwrap();
    }

    // Queue is full relative to `slow`'s untouched cursor.
    let handle17 = flowmesh_rt::Handle::allocate(registry.clone(), pool.clone(), 1, 0, 16).unwrap();
    let blocked = {
        let queue = queue.clone();
        let buffer_id = handle17.buffer_id();
        thread::spawn(move || {
            queue
                .push_with_timeout(buffer_id, Some(Duration::from_secs(5)), |n| handle17.add_ref(n))
                .unwrap();
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished(), "push must still be blocked on the slow reader");

    for _ in 0..16 {
        queue.pop(slow).unwrap();
    }
    blocked.join().unwrap();

    for _ in 0..17 {
        queue.pop(fast).unwrap();
    }
    // `slow` already drained its 16; one more (the 17th, unblocked push) remains.
    assert_eq!(queue.pending(slow).unwrap(), 1);
    queue.pop(slow).unwrap();
}

/// S3 — Fan-in 3→1: three producers each publish 50 buffers carrying
/// `(producer_id, seq)` as an 8-byte prefix; a single sink receives all 150
/// and, grouped back by producer_id, each producer's subsequence is strictly
/// increasing 0..49 even though deliveries from different producers may
/// interleave in arbitrary order.
#[test]
fn s3_fan_in_three_to_one() {
    let registry = Arc::new(Registry::open_or_create(&unique("s3_registry")).unwrap());
    let pool = Arc::new(Pool::create(&unique("s3_pool"), 32, 64).unwrap());
    let queue = Arc::new(PortQueue::create(&unique("s3_queue"), 32).unwrap());

    let consumer = queue.register_consumer().unwrap();
    const PER_PRODUCER: u32 = 50;

    let producers: Vec<_> = (0..3u32)
        .map(|producer_id| {
            let registry = registry.clone();
            let pool = pool.clone();
            let queue = queue.clone();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let mut handle =
                        flowmesh_rt::Handle::allocate(registry.clone(), pool.clone(), 1, 0, 16)
                            .unwrap();
                    let slice = handle.as_mut_slice();
                    slice[..4].copy_from_slice(&producer_id.to_le_bytes());
                    slice[4..8].copy_from_slice(&seq.to_le_bytes());
                    queue.push(handle.buffer_id(), |n| handle.add_ref(n)).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let mut last_seq = [None; 3];
    let mut counts = [0u32; 3];
    for _ in 0..(PER_PRODUCER * 3) {
        let buffer_id = queue.pop(consumer).unwrap();
        let handle = flowmesh_rt::Handle::open(registry.clone(), pool.clone(), buffer_id).unwrap();
        let slice = handle.as_slice();
        let mut producer_id_bytes = [0u8; 4];
        let mut seq_bytes = [0u8; 4];
        producer_id_bytes.copy_from_slice(&slice[..4]);
        seq_bytes.copy_from_slice(&slice[4..8]);
        let producer_id = u32::from_le_bytes(producer_id_bytes) as usize;
        let seq = u32::from_le_bytes(seq_bytes);

        if let Some(prev) = last_seq[producer_id] {
            assert!(seq > prev, "producer {producer_id} regressed: {prev} -> {seq}");
        } else {
            assert_eq!(seq, 0, "producer {producer_id}'s first delivery must be seq 0");
        }
        last_seq[producer_id] = Some(seq);
        counts[producer_id] += 1;
    }

    assert_eq!(counts, [PER_PRODUCER; 3]);
}

/// S5 — Crash reclaim: a producer registers, allocates buffers, then "dies"
/// (its heartbeat is never refreshed and its pid is replaced with one
/// guaranteed not to be running). Reclaim marks it dead and cascades; a
/// buffer a live consumer still holds remains valid until that consumer
/// drops it.
#[test]
fn s5_crash_reclaim_does_not_disturb_live_consumer() {
    let registry = Arc::new(Registry::open_or_create(&unique("s5_registry")).unwrap());
    let pool = Arc::new(Pool::create(&unique("s5_pool"), 32, 16).unwrap());
    let queue = Arc::new(PortQueue::create(&unique("s5_queue"), 32).unwrap());

    // A pid astronomically unlikely to exist on this host.
    let dead_pid = 2_000_000_001;
    let producer_slot = registry
        .register_process(dead_pid, flowmesh_rt::ProcessRole::Worker, "crashed-producer")
        .unwrap();
    let (_block_id, _block_slot) = registry
        .register_block(producer_slot, flowmesh_rt::BlockKind::Source, "src")
        .unwrap();

    let consumer = queue.register_consumer().unwrap();
    let initial_free = pool.free_count();

    for _ in 0..10 {
        let handle =
            flowmesh_rt::Handle::allocate(registry.clone(), pool.clone(), 1, producer_slot, 16)
                .unwrap();
        queue.push(handle.buffer_id(), |n| handle.add_ref(n)).unwrap();
    }
    assert!(pool.free_count() < initial_free);

    // The consumer reads (and keeps) one buffer before the crash is reclaimed.
    let held = flowmesh_rt::Handle::open(
        registry.clone(),
        pool.clone(),
        queue.pop(consumer).unwrap(),
    )
    .unwrap();

    let reclaimed = registry.reclaim_dead_processes(0);
    assert!(reclaimed.contains(&producer_slot));

    // The buffer the live consumer still holds must remain readable.
    assert_eq!(held.len(), 16);

    drop(held);
    for _ in 0..9 {
        let id = queue.pop(consumer).unwrap();
        drop(flowmesh_rt::Handle::open(registry.clone(), pool.clone(), id).unwrap());
    }
    assert_eq!(pool.free_count(), initial_free);
}

/// S5b — Crash reclaim of an allocate-without-push buffer: a producer
/// allocates a buffer and crashes before ever pushing it to a queue, so
/// nothing else holds a reference. Reclaim must drop the creator's implicit
/// reference, free the metadata slot, and return the pool block to the
/// free-list rather than leaking it forever.
#[test]
fn s5b_crash_reclaim_frees_never_pushed_buffer() {
    let registry = Arc::new(Registry::open_or_create(&unique("s5b_registry")).unwrap());
    let pool_segment = unique("s5b_pool");
    let pool = Arc::new(Pool::create(&pool_segment, 32, 16).unwrap());
    let pool_id = registry.register_pool("p", 32, 16, &pool_segment).unwrap();

    let dead_pid = 2_000_000_002;
    let producer_slot = registry
        .register_process(dead_pid, flowmesh_rt::ProcessRole::Worker, "crashed-producer")
        .unwrap();

    let initial_free = pool.free_count();

    // Allocate but never push: the producer's initial reference is the only
    // one that will ever exist.
    let handle =
        flowmesh_rt::Handle::allocate(registry.clone(), pool.clone(), pool_id, producer_slot, 16)
            .unwrap();
    let buffer_id = handle.buffer_id();
    std::mem::forget(handle); // simulate the process vanishing without running `Handle::drop`

    assert_eq!(pool.free_count(), initial_free - 1);
    assert!(registry.find_slot(buffer_id).is_some());

    let reclaimed = registry.reclaim_dead_processes(0);
    assert!(reclaimed.contains(&producer_slot));

    assert_eq!(pool.free_count(), initial_free, "reclaim must free the never-pushed block");
    assert!(registry.find_slot(buffer_id).is_none(), "metadata slot must be freed");
}

/// S6 — High throughput, single process multi-thread: one producer
/// publishes 10,000 buffers to three consumers; every consumer must report
/// exactly 10,000 with no drops or duplicates.
#[test]
fn s6_high_throughput_fan_out() {
    let registry = Arc::new(Registry::open_or_create(&unique("s6_registry")).unwrap());
    let pool = Arc::new(Pool::create(&unique("s6_pool"), 64, 256).unwrap());
    let queue = Arc::new(PortQueue::create(&unique("s6_queue"), 256).unwrap());

    const TOTAL: u32 = 10_000;
    let consumers: Vec<_> = (0..3).map(|_| queue.register_consumer().unwrap()).collect();

    let producer = {
        let registry = registry.clone();
        let pool = pool.clone();
        let queue = queue.clone();
        thread::spawn(move || {
            for i in 0..TOTAL {
                let mut handle =
                    flowmesh_rt::Handle::allocate(registry.clone(), pool.clone(), 1, 0, 64).unwrap();
                handle.as_mut_slice()[..4].copy_from_slice(&i.to_le_bytes());
                queue.push(handle.buffer_id(), |n| handle.add_ref(n)).unwrap();
            }
        })
    };

    let consumer_threads: Vec<_> = consumers
        .into_iter()
        .map(|consumer| {
            let registry = registry.clone();
            let pool = pool.clone();
            let queue = queue.clone();
            thread::spawn(move || {
                let mut seen = std::collections::HashSet::new();
                for expected in 0..TOTAL {
                    let buffer_id = queue.pop(consumer).unwrap();
                    assert!(seen.insert(buffer_id), "duplicate delivery of {buffer_id}");
                    let handle =
                        flowmesh_rt::Handle::open(registry.clone(), pool.clone(), buffer_id).unwrap();
                    let mut prefix = [0u8; 4];
                    prefix.copy_from_slice(&handle.as_slice()[..4]);
                    assert_eq!(u32::from_le_bytes(prefix), expected);
                }
                seen.len()
            })
        })
        .collect();

    producer.join().unwrap();
    for handle in consumer_threads {
        assert_eq!(handle.join().unwrap(), TOTAL as usize);
    }
}
