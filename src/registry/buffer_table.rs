//! Buffer metadata table: one entry per live buffer handle, carrying the
//! pool/block-index it lives in, its refcount, and timestamp metadata. Also
//! owns the open-addressing hash index used for O(1) `find_slot` lookups
//! (spec's open question on `find_slot` performance, resolved in favor of
//! the hash index; [`find_slot_linear`] is kept to cross-check it).

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use super::{alloc_slot, free_slot as free_list_slot, FreeListEntry, Registry, MAX_BUFFERS};
use crate::clock::now_ns;
use crate::error::{RuntimeError, RuntimeResult};
use crate::ids::{BufferId, ProcessSlot};

/// Sentinel meaning "no time range end" for a buffer whose timestamp is a
/// single instant rather than a span.
pub const NO_TIME_RANGE_END: i64 = i64::MIN;

#[repr(C)]
pub struct BufferMetaEntry {
    pub(crate) buffer_id: AtomicU64,
    pub(crate) pool_id: u32,
    pub(crate) block_index: u32,
    pub(crate) size: u32,
    pub(crate) refcount: AtomicU32,
    pub(crate) data_offset: u64,
    pub(crate) timestamp_ns: i64,
    pub(crate) time_range_end_ns: i64,
    pub(crate) valid: AtomicU32,
    pub(crate) creator_slot: u32,
    pub(crate) alloc_time_ns: u64,
    /// Pool block generation at allocation time (supplement to spec's field
    /// list, needed so releasing a buffer can free its block with the
    /// generation the pool's double-free check expects; see DESIGN.md).
    pub(crate) generation: u32,
    pub(crate) next_free: i32,
}

impl FreeListEntry for BufferMetaEntry {
    fn next_free(&self) -> i32 {
        self.next_free
    }
    fn set_next_free(&mut self, value: i32) {
        self.next_free = value;
    }
}

/// A point-in-time, non-atomic copy of a buffer metadata entry for callers
/// that just need to read its fields.
#[derive(Debug, Clone, Copy)]
pub struct BufferMetaSnapshot {
    pub buffer_id: u64,
    pub pool_id: u32,
    pub block_index: u32,
    pub size: u32,
    pub refcount: u32,
    pub data_offset: u64,
    pub timestamp_ns: i64,
    pub time_range_end_ns: i64,
    pub creator_slot: ProcessSlot,
    pub generation: u32,
}

/// Empty slot: probing stops here, nothing was ever inserted past it.
const INDEX_EMPTY: i32 = -1;
/// Removed slot: a collision chain may continue past it, so lookups must
/// keep probing (unlike `INDEX_EMPTY`); insertions may reclaim it.
const INDEX_TOMBSTONE: i32 = -2;

fn hash_probe(index: &[AtomicI32], key: u32) -> usize {
    (key as usize) % index.len()
}

fn index_insert(index: &[AtomicI32], key: u32, slot: usize) {
    let mut i = hash_probe(index, key);
    for _ in 0..index.len() {
        if index[i]
            .compare_exchange(INDEX_EMPTY, slot as i32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
        if index[i]
            .compare_exchange(INDEX_TOMBSTONE, slot as i32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
        i = (i + 1) % index.len();
    }
}

/// Mark `slot`'s index entry removed without breaking the probe chain of
/// entries that hashed to the same bucket and landed further along it: a
/// plain `-1` (empty) write here would make `find_slot` stop early and
/// report entries still live past this point as `UnknownBuffer`.
fn index_remove(index: &[AtomicI32], key: u32, slot: usize) {
    let mut i = hash_probe(index, key);
    for _ in 0..index.len() {
        if index[i].load(Ordering::Acquire) == slot as i32 {
            index[i].store(INDEX_TOMBSTONE, Ordering::Release);
            return;
        }
        i = (i + 1) % index.len();
    }
}

pub(super) fn allocate_slot(
    registry: &Registry,
    buffer_id: u64,
    pool_id: u32,
    block_index: u32,
    size: u32,
    creator_slot: ProcessSlot,
    generation: u32,
) -> RuntimeResult<()> {
    let header = registry.header();
    let table = &header.buffer_table;
    let _guard = unsafe { table.mutex.lock() };

    let entries = registry.buffers();
    let slot = alloc_slot(table, entries).ok_or(RuntimeError::NoBufferSlot)?;

    let entry = &mut entries[slot];
    entry.buffer_id.store(buffer_id, Ordering::Release);
    entry.pool_id = pool_id;
    entry.block_index = block_index;
    entry.size = size;
    entry.refcount.store(1, Ordering::Release);
    entry.data_offset = 0;
    entry.timestamp_ns = now_ns() as i64;
    entry.time_range_end_ns = NO_TIME_RANGE_END;
    entry.valid.store(1, Ordering::Release);
    entry.creator_slot = creator_slot;
    entry.alloc_time_ns = now_ns();
    entry.generation = generation;

    index_insert(registry.buffer_index(), BufferId::hash_key(buffer_id), slot);

    Ok(())
}

pub(super) fn free_slot(registry: &Registry, buffer_id: u64) -> RuntimeResult<()> {
    let header = registry.header();
    let table = &header.buffer_table;
    let _guard = unsafe { table.mutex.lock() };

    let slot = find_slot_linear(registry, buffer_id).ok_or(RuntimeError::UnknownBuffer(buffer_id))?;

    let entries = registry.buffers();
    entries[slot].valid.store(0, Ordering::Release);
    entries[slot].buffer_id.store(0, Ordering::Release);
    index_remove(registry.buffer_index(), BufferId::hash_key(buffer_id), slot);
    free_list_slot(table, entries, slot);
    Ok(())
}

/// Which pool block a reclaimed buffer's creator-held reference released,
/// so the caller can return the block to its pool's free-list.
#[derive(Debug, Clone, Copy)]
pub struct ReclaimedBuffer {
    pub pool_id: u32,
    pub block_index: u32,
    pub generation: u32,
}

/// Drop the one reference a dead process's creation of a buffer is
/// presumed to still hold (spec §4.7 step 3: "decrement by 1... trust the
/// transferred-to queues to hold their own refs"). Any entry whose
/// decrement observes 1→0 is released here and there (metadata slot freed,
/// index entry removed) and returned so the caller can free the pool block
/// too; entries still referenced by a live queue/handle elsewhere are left
/// alone.
pub(super) fn reclaim_creator(registry: &Registry, creator_slot: ProcessSlot) -> Vec<ReclaimedBuffer> {
    let header = registry.header();
    let table = &header.buffer_table;
    let _guard = unsafe { table.mutex.lock() };

    let index = registry.buffer_index();
    let entries = registry.buffers();
    let mut released = Vec::new();

    for slot in 0..entries.len() {
        if entries[slot].valid.load(Ordering::Acquire) == 0 {
            continue;
        }
        if entries[slot].creator_slot != creator_slot {
            continue;
        }

        let buffer_id = entries[slot].buffer_id.load(Ordering::Acquire);
        let previous = entries[slot].refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "refcount underflow reclaiming buffer {buffer_id}");
        if previous != 1 {
            continue;
        }

        let pool_id = entries[slot].pool_id;
        let block_index = entries[slot].block_index;
        let generation = entries[slot].generation;
        entries[slot].valid.store(0, Ordering::Release);
        entries[slot].buffer_id.store(0, Ordering::Release);
        index_remove(index, BufferId::hash_key(buffer_id), slot);
        free_list_slot(table, entries, slot);

        released.push(ReclaimedBuffer {
            pool_id,
            block_index,
            generation,
        });
    }

    released
}

pub(super) fn add_ref(registry: &Registry, buffer_id: u64, count: u32) -> RuntimeResult<()> {
    let slot = find_slot(registry, buffer_id).ok_or(RuntimeError::UnknownBuffer(buffer_id))?;
    registry.buffers()[slot].refcount.fetch_add(count, Ordering::AcqRel);
    Ok(())
}

pub(super) fn sub_ref(registry: &Registry, buffer_id: u64) -> RuntimeResult<bool> {
    let slot = find_slot(registry, buffer_id).ok_or(RuntimeError::UnknownBuffer(buffer_id))?;
    let previous = registry.buffers()[slot].refcount.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(previous > 0, "refcount underflow on buffer {buffer_id}");
    Ok(previous == 1)
}

pub(super) fn find_slot(registry: &Registry, buffer_id: u64) -> Option<usize> {
    let index = registry.buffer_index();
    let key = BufferId::hash_key(buffer_id);
    let mut i = hash_probe(index, key);
    for _ in 0..index.len() {
        let slot = index[i].load(Ordering::Acquire);
        if slot == INDEX_EMPTY {
            return None;
        }
        if slot != INDEX_TOMBSTONE {
            let entry = &registry.buffers()[slot as usize];
            if entry.valid.load(Ordering::Acquire) != 0
                && entry.buffer_id.load(Ordering::Acquire) == buffer_id
            {
                return Some(slot as usize);
            }
        }
        i = (i + 1) % index.len();
    }
    None
}

pub(super) fn find_slot_linear(registry: &Registry, buffer_id: u64) -> Option<usize> {
    registry.buffers().iter().position(|e| {
        e.valid.load(Ordering::Acquire) != 0 && e.buffer_id.load(Ordering::Acquire) == buffer_id
    })
}

pub(super) fn snapshot(registry: &Registry, slot: usize) -> BufferMetaSnapshot {
    let entry = &registry.buffers()[slot];
    BufferMetaSnapshot {
        buffer_id: entry.buffer_id.load(Ordering::Acquire),
        pool_id: entry.pool_id,
        block_index: entry.block_index,
        size: entry.size,
        refcount: entry.refcount.load(Ordering::Acquire),
        data_offset: entry.data_offset,
        timestamp_ns: entry.timestamp_ns,
        time_range_end_ns: entry.time_range_end_ns,
        creator_slot: entry.creator_slot,
        generation: entry.generation,
    }
}

#[allow(dead_code)]
const fn _assert_max_buffers_fits_hash_key(_: [(); MAX_BUFFERS]) {}
