//! Process table: one entry per live process participating in the
//! topology, used for heartbeat liveness tracking and ownership of blocks.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use nix::sys::signal::kill;
use nix::unistd::Pid;

use super::{alloc_slot, free_slot, read_name, write_name, FreeListEntry, Registry};
use crate::clock::now_ns;
use crate::error::{RuntimeError, RuntimeResult};
use crate::ids::ProcessSlot;

/// Role a process plays in the topology, used mainly for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessRole {
    Standalone = 0,
    Supervisor = 1,
    Worker = 2,
}

impl ProcessRole {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ProcessRole::Supervisor,
            2 => ProcessRole::Worker,
            _ => ProcessRole::Standalone,
        }
    }
}

#[repr(C)]
pub struct ProcessEntry {
    pub(crate) pid: i32,
    pub(crate) role: u8,
    pub(crate) name: [u8; 64],
    pub(crate) alive: AtomicU32,
    pub(crate) last_heartbeat_ns: AtomicU64,
    pub(crate) start_time_ns: u64,
    pub(crate) owned_blocks: [u32; 16],
    pub(crate) owned_block_count: u32,
    pub(crate) next_free: i32,
}

impl FreeListEntry for ProcessEntry {
    fn next_free(&self) -> i32 {
        self.next_free
    }
    fn set_next_free(&mut self, value: i32) {
        self.next_free = value;
    }
}

impl ProcessEntry {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn role(&self) -> ProcessRole {
        ProcessRole::from_u8(self.role)
    }

    pub fn name(&self) -> String {
        read_name(&self.name)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) != 0
    }
}

pub(super) fn register(
    registry: &Registry,
    pid: i32,
    role: ProcessRole,
    name: &str,
) -> RuntimeResult<ProcessSlot> {
    let header = registry.header();
    let table = &header.process_table;
    let _guard = unsafe { table.mutex.lock() };

    let entries = registry.processes();
    let slot = alloc_slot(table, entries).ok_or(RuntimeError::NoProcessSlot)?;

    let entry = &mut entries[slot];
    entry.pid = pid;
    entry.role = role as u8;
    write_name(&mut entry.name, name);
    entry.alive.store(1, Ordering::Release);
    entry.start_time_ns = now_ns();
    entry.last_heartbeat_ns = AtomicU64::new(entry.start_time_ns);
    entry.owned_blocks = [0; 16];
    entry.owned_block_count = 0;

    Ok(slot as ProcessSlot)
}

pub(super) fn unregister(registry: &Registry, slot: ProcessSlot) -> RuntimeResult<()> {
    let header = registry.header();
    let table = &header.process_table;
    let _guard = unsafe { table.mutex.lock() };

    let entries = registry.processes();
    let entry = entries
        .get_mut(slot as usize)
        .ok_or(RuntimeError::InvalidTransition)?;
    if entry.alive.load(Ordering::Acquire) == 0 {
        return Err(RuntimeError::InvalidTransition);
    }
    entry.alive.store(0, Ordering::Release);
    free_slot(table, entries, slot as usize);
    Ok(())
}

pub(super) fn update_heartbeat(registry: &Registry, slot: ProcessSlot) -> RuntimeResult<()> {
    let entries = registry.processes();
    let entry = entries
        .get(slot as usize)
        .ok_or(RuntimeError::InvalidTransition)?;
    if entry.alive.load(Ordering::Acquire) == 0 {
        return Err(RuntimeError::InvalidTransition);
    }
    entry.last_heartbeat_ns.store(now_ns(), Ordering::Release);
    Ok(())
}

/// Record that `slot`'s owning process now owns `block_slot` too.
pub(super) fn add_owned_block(registry: &Registry, slot: ProcessSlot, block_slot: u32) -> RuntimeResult<()> {
    let header = registry.header();
    let table = &header.process_table;
    let _guard = unsafe { table.mutex.lock() };

    let entry = &mut registry.processes()[slot as usize];
    let count = entry.owned_block_count as usize;
    if count >= entry.owned_blocks.len() {
        return Err(RuntimeError::NoBlockSlot);
    }
    entry.owned_blocks[count] = block_slot;
    entry.owned_block_count += 1;
    Ok(())
}

/// `kill(pid, 0)`-style liveness probe: `ESRCH` means the process is gone.
pub(super) fn is_pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true, // EPERM etc still means the pid exists
    }
}
