//! Block table: one entry per registered processing block (source,
//! processing, or sink), with up to `MAX_PORTS_PER_BLOCK` named ports.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::{
    alloc_slot, free_slot, process_table, read_name, write_name, FreeListEntry, Registry,
    MAX_PORTS_PER_BLOCK,
};
use crate::clock::now_ns;
use crate::error::{RuntimeError, RuntimeResult};
use crate::ids::{BlockId, BlockSlot, ProcessSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Source = 0,
    Processing = 1,
    Sink = 2,
}

impl BlockKind {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BlockKind::Source,
            2 => BlockKind::Sink,
            _ => BlockKind::Processing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortDirection {
    In = 0,
    Out = 1,
}

/// Sentinel `queue_offset` meaning "this port exists but is not bound to a
/// queue segment yet".
pub const UNBOUND_QUEUE_OFFSET: u64 = u64::MAX;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PortDescriptor {
    pub(crate) name: [u8; 32],
    pub(crate) direction: u8,
    pub(crate) queue_offset: u64,
}

impl PortDescriptor {
    const EMPTY: Self = Self {
        name: [0; 32],
        direction: 0,
        queue_offset: UNBOUND_QUEUE_OFFSET,
    };

    pub fn name(&self) -> String {
        super::read_name(&self.name)
    }

    pub fn direction(&self) -> PortDirection {
        if self.direction == 1 {
            PortDirection::Out
        } else {
            PortDirection::In
        }
    }

    fn is_empty(&self) -> bool {
        self.queue_offset == UNBOUND_QUEUE_OFFSET && self.name[0] == 0
    }
}

#[repr(C)]
pub struct BlockEntry {
    pub(crate) block_id: u64,
    pub(crate) owner_slot: u32,
    pub(crate) name: [u8; 64],
    pub(crate) kind: u8,
    pub(crate) active: AtomicU32,
    pub(crate) last_work_ns: AtomicU64,
    pub(crate) ports: [PortDescriptor; MAX_PORTS_PER_BLOCK],
    pub(crate) port_count: u32,
    pub(crate) buffers_produced: AtomicU64,
    pub(crate) buffers_consumed: AtomicU64,
    pub(crate) next_free: i32,
}

impl FreeListEntry for BlockEntry {
    fn next_free(&self) -> i32 {
        self.next_free
    }
    fn set_next_free(&mut self, value: i32) {
        self.next_free = value;
    }
}

impl BlockEntry {
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn kind(&self) -> BlockKind {
        BlockKind::from_u8(self.kind)
    }

    pub fn name(&self) -> String {
        read_name(&self.name)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    pub fn ports(&self) -> impl Iterator<Item = &PortDescriptor> {
        self.ports[..self.port_count as usize].iter()
    }

    pub fn touch_work(&self) {
        self.last_work_ns.store(now_ns(), Ordering::Release);
    }
}

fn next_block_id() -> BlockId {
    use std::sync::atomic::AtomicU64 as Counter;
    static COUNTER: Counter = Counter::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

pub(super) fn register(
    registry: &Registry,
    owner_slot: ProcessSlot,
    kind: BlockKind,
    name: &str,
) -> RuntimeResult<(BlockId, BlockSlot)> {
    let block_id = next_block_id();

    let header = registry.header();
    let table = &header.block_table;
    let slot = {
        let _guard = unsafe { table.mutex.lock() };
        let entries = registry.blocks();
        let slot = alloc_slot(table, entries).ok_or(RuntimeError::NoBlockSlot)?;

        let entry = &mut entries[slot];
        entry.block_id = block_id;
        entry.owner_slot = owner_slot;
        write_name(&mut entry.name, name);
        entry.kind = kind as u8;
        entry.active.store(1, Ordering::Release);
        entry.last_work_ns.store(now_ns(), Ordering::Release);
        entry.ports = [PortDescriptor::EMPTY; MAX_PORTS_PER_BLOCK];
        entry.port_count = 0;
        entry.buffers_produced.store(0, Ordering::Release);
        entry.buffers_consumed.store(0, Ordering::Release);
        slot
    };

    process_table::add_owned_block(registry, owner_slot, slot as u32)?;

    Ok((block_id, slot as BlockSlot))
}

pub(super) fn unregister(registry: &Registry, slot: BlockSlot) -> RuntimeResult<()> {
    let header = registry.header();
    let table = &header.block_table;
    let _guard = unsafe { table.mutex.lock() };

    let entries = registry.blocks();
    let entry = entries
        .get_mut(slot as usize)
        .ok_or(RuntimeError::UnknownBlock(slot as u64))?;
    if entry.active.load(Ordering::Acquire) == 0 {
        return Err(RuntimeError::InvalidTransition);
    }
    entry.active.store(0, Ordering::Release);
    free_slot(table, entries, slot as usize);
    Ok(())
}

pub(super) fn register_port(
    registry: &Registry,
    block_slot: BlockSlot,
    name: &str,
    direction: PortDirection,
) -> RuntimeResult<()> {
    let header = registry.header();
    let table = &header.block_table;
    let _guard = unsafe { table.mutex.lock() };

    let entries = registry.blocks();
    let entry = entries
        .get_mut(block_slot as usize)
        .ok_or(RuntimeError::UnknownBlock(block_slot as u64))?;

    let count = entry.port_count as usize;
    if count >= MAX_PORTS_PER_BLOCK {
        return Err(RuntimeError::NoBlockSlot);
    }
    for existing in &entry.ports[..count] {
        if existing.name() == name {
            return Err(RuntimeError::AlreadyRegistered);
        }
    }

    let port = &mut entry.ports[count];
    write_name(&mut port.name, name);
    port.direction = direction as u8;
    port.queue_offset = UNBOUND_QUEUE_OFFSET;
    entry.port_count += 1;

    Ok(())
}

pub(super) fn find_by_id(registry: &Registry, block_id: BlockId) -> Option<BlockSlot> {
    registry
        .blocks()
        .iter()
        .enumerate()
        .find(|(_, entry)| entry.active.load(Ordering::Acquire) != 0 && entry.block_id == block_id)
        .map(|(i, _)| i as BlockSlot)
}
