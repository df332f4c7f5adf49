//! Connection table: records which block/port feeds which block/port, so a
//! producing block's `BlockContext::produce_output` knows every downstream
//! queue to fan out to.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::{alloc_slot, free_slot, read_name, write_name, FreeListEntry, Registry};
use crate::error::{RuntimeError, RuntimeResult};
use crate::ids::{BlockId, ConnectionId};

#[repr(C)]
pub struct ConnectionEntry {
    pub(crate) connection_id: u64,
    pub(crate) src_block: u64,
    pub(crate) src_port: [u8; 32],
    pub(crate) dst_block: u64,
    pub(crate) dst_port: [u8; 32],
    pub(crate) active: AtomicU32,
    pub(crate) buffers_transferred: AtomicU64,
    pub(crate) bytes_transferred: AtomicU64,
    pub(crate) next_free: i32,
}

impl FreeListEntry for ConnectionEntry {
    fn next_free(&self) -> i32 {
        self.next_free
    }
    fn set_next_free(&mut self, value: i32) {
        self.next_free = value;
    }
}

impl Clone for ConnectionEntry {
    fn clone(&self) -> Self {
        Self {
            connection_id: self.connection_id,
            src_block: self.src_block,
            src_port: self.src_port,
            dst_block: self.dst_block,
            dst_port: self.dst_port,
            active: AtomicU32::new(self.active.load(Ordering::Acquire)),
            buffers_transferred: AtomicU64::new(self.buffers_transferred.load(Ordering::Acquire)),
            bytes_transferred: AtomicU64::new(self.bytes_transferred.load(Ordering::Acquire)),
            next_free: self.next_free,
        }
    }
}

impl ConnectionEntry {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn src_block(&self) -> BlockId {
        self.src_block
    }

    pub fn src_port(&self) -> String {
        read_name(&self.src_port)
    }

    pub fn dst_block(&self) -> BlockId {
        self.dst_block
    }

    pub fn dst_port(&self) -> String {
        read_name(&self.dst_port)
    }

    pub fn record_transfer(&self, bytes: u64) {
        self.buffers_transferred.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }
}

fn next_connection_id() -> ConnectionId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

pub(super) fn add(
    registry: &Registry,
    src_block: BlockId,
    src_port: &str,
    dst_block: BlockId,
    dst_port: &str,
) -> RuntimeResult<ConnectionId> {
    let connection_id = next_connection_id();

    let header = registry.header();
    let table = &header.connection_table;
    let _guard = unsafe { table.mutex.lock() };

    let entries = registry.connections();
    let slot = alloc_slot(table, entries).ok_or(RuntimeError::NoConnectionSlot)?;

    let entry = &mut entries[slot];
    entry.connection_id = connection_id;
    entry.src_block = src_block;
    write_name(&mut entry.src_port, src_port);
    entry.dst_block = dst_block;
    write_name(&mut entry.dst_port, dst_port);
    entry.active.store(1, Ordering::Release);
    entry.buffers_transferred.store(0, Ordering::Release);
    entry.bytes_transferred.store(0, Ordering::Release);

    Ok(connection_id)
}

pub(super) fn remove(registry: &Registry, connection_id: ConnectionId) -> RuntimeResult<()> {
    let header = registry.header();
    let table = &header.connection_table;
    let _guard = unsafe { table.mutex.lock() };

    let entries = registry.connections();
    let slot = entries
        .iter()
        .position(|e| e.active.load(Ordering::Acquire) != 0 && e.connection_id == connection_id)
        .ok_or(RuntimeError::UnknownConnection(connection_id))?;

    entries[slot].active.store(0, Ordering::Release);
    free_slot(table, entries, slot);
    Ok(())
}

pub(super) fn connections_from(registry: &Registry, block_id: BlockId) -> Vec<ConnectionEntry> {
    registry
        .connections()
        .iter()
        .filter(|e| e.active.load(Ordering::Acquire) != 0 && e.src_block == block_id)
        .cloned()
        .collect()
}

pub(super) fn record_transfer(
    registry: &Registry,
    connection_id: ConnectionId,
    bytes: u64,
) -> RuntimeResult<()> {
    let entry = registry
        .connections()
        .iter()
        .find(|e| e.active.load(Ordering::Acquire) != 0 && e.connection_id == connection_id)
        .ok_or(RuntimeError::UnknownConnection(connection_id))?;
    entry.record_transfer(bytes);
    Ok(())
}
