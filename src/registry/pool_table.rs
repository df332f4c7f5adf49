//! Pool table: records every registered buffer pool's identity and segment
//! name so any process can discover and `Pool::open` a pool it did not
//! create.

use std::sync::atomic::{AtomicU32, Ordering};

use super::{alloc_slot, free_slot, read_name, write_name, FreeListEntry, Registry};
use crate::error::{RuntimeError, RuntimeResult};

#[repr(C)]
pub struct PoolEntry {
    pub(crate) pool_id: u32,
    pub(crate) name: [u8; 32],
    pub(crate) block_size: u32,
    pub(crate) block_count: u32,
    pub(crate) segment_name: [u8; 64],
    pub(crate) allocated: AtomicU32,
    pub(crate) free_count: AtomicU32,
    pub(crate) next_free: i32,
}

impl FreeListEntry for PoolEntry {
    fn next_free(&self) -> i32 {
        self.next_free
    }
    fn set_next_free(&mut self, value: i32) {
        self.next_free = value;
    }
}

impl Clone for PoolEntry {
    fn clone(&self) -> Self {
        Self {
            pool_id: self.pool_id,
            name: self.name,
            block_size: self.block_size,
            block_count: self.block_count,
            segment_name: self.segment_name,
            allocated: AtomicU32::new(self.allocated.load(Ordering::Acquire)),
            free_count: AtomicU32::new(self.free_count.load(Ordering::Acquire)),
            next_free: self.next_free,
        }
    }
}

impl PoolEntry {
    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    pub fn name(&self) -> String {
        read_name(&self.name)
    }

    pub fn segment_name(&self) -> String {
        read_name(&self.segment_name)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }
}

fn next_pool_id() -> u32 {
    static COUNTER: AtomicU32 = AtomicU32::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

pub(super) fn register(
    registry: &Registry,
    name: &str,
    block_size: u32,
    block_count: u32,
    segment_name: &str,
) -> RuntimeResult<u32> {
    let pool_id = next_pool_id();

    let header = registry.header();
    let table = &header.pool_table;
    let _guard = unsafe { table.mutex.lock() };

    let entries = registry.pools();
    let slot = alloc_slot(table, entries).ok_or(RuntimeError::NoPoolSlot)?;

    let entry = &mut entries[slot];
    entry.pool_id = pool_id;
    write_name(&mut entry.name, name);
    entry.block_size = block_size;
    entry.block_count = block_count;
    write_name(&mut entry.segment_name, segment_name);
    entry.allocated.store(0, Ordering::Release);
    entry.free_count.store(block_count, Ordering::Release);

    Ok(pool_id)
}

pub(super) fn unregister(registry: &Registry, pool_id: u32) -> RuntimeResult<()> {
    let header = registry.header();
    let table = &header.pool_table;
    let _guard = unsafe { table.mutex.lock() };

    let entries = registry.pools();
    let slot = entries
        .iter()
        .position(|e| e.pool_id == pool_id)
        .ok_or(RuntimeError::UnknownPool(pool_id))?;
    entries[slot].pool_id = 0;
    free_slot(table, entries, slot);
    Ok(())
}

pub(super) fn find_by_name(registry: &Registry, name: &str) -> Option<PoolEntry> {
    registry
        .pools()
        .iter()
        .find(|e| e.pool_id != 0 && e.name() == name)
        .cloned()
}

pub(super) fn find_by_id(registry: &Registry, pool_id: u32) -> Option<PoolEntry> {
    registry.pools().iter().find(|e| e.pool_id == pool_id).cloned()
}
