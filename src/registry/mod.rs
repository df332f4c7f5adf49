//! Global Registry: the single shared-memory segment every process in a
//! flowmesh topology opens first. It holds five fixed-capacity tables
//! (processes, blocks, connections, pools, buffer metadata), each guarded by
//! its own [`ShmMutex`] and backed by an intrusive free list so slot
//! allocation never allocates heap memory and never blocks on anything but
//! that table's own lock.

mod block_table;
mod buffer_table;
mod connection_table;
mod pool_table;
mod process_table;

pub use block_table::BlockEntry;
pub use buffer_table::BufferMetaEntry;
pub use connection_table::ConnectionEntry;
pub use pool_table::PoolEntry;
pub use process_table::ProcessEntry;

pub use block_table::{BlockKind, PortDescriptor, PortDirection};
pub use process_table::ProcessRole;

use std::sync::atomic::{AtomicI32, Ordering};

use tracing::{info, warn};

use crate::clock::now_ns;
use crate::error::{RuntimeError, RuntimeResult};
use crate::ids::{BlockId, BlockSlot, ConnectionId, ProcessSlot};
use crate::shm;
use crate::sync::ShmMutex;

pub const MAX_PROCESSES: usize = 64;
pub const MAX_BLOCKS: usize = 256;
pub const MAX_CONNECTIONS: usize = 512;
pub const MAX_POOLS: usize = 16;
pub const MAX_BUFFERS: usize = 4096;
pub const MAX_PORTS_PER_BLOCK: usize = 16;
pub const MAX_CONSUMERS: usize = 32;
pub const MAX_QUEUE_SIZE: usize = 256;

const REGISTRY_MAGIC: u64 = 0x4D5147524547; // ASCII "MQGREG"
const REGISTRY_VERSION: u32 = 1;
const CACHE_LINE: usize = 64;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A table's free-list head plus the mutex guarding every mutation of that
/// table (slot alloc/free and any field write that must be atomic with slot
/// state).
#[repr(C)]
pub(crate) struct TableHeader {
    pub(crate) free_head: AtomicI32,
    pub(crate) mutex: ShmMutex,
}

/// Entries participating in a table's intrusive free list implement this so
/// the generic alloc/free helpers below work across all five table kinds.
pub(crate) trait FreeListEntry {
    fn next_free(&self) -> i32;
    fn set_next_free(&mut self, value: i32);
}

/// Pop a slot off `table`'s free list. Caller must already hold `table.mutex`.
pub(crate) fn alloc_slot<T: FreeListEntry>(
    table: &TableHeader,
    entries: &mut [T],
) -> Option<usize> {
    let head = table.free_head.load(Ordering::Acquire);
    if head < 0 {
        return None;
    }
    let next = entries[head as usize].next_free();
    table.free_head.store(next, Ordering::Release);
    Some(head as usize)
}

/// Push a slot back onto `table`'s free list. Caller must already hold
/// `table.mutex`.
pub(crate) fn free_slot<T: FreeListEntry>(table: &TableHeader, entries: &mut [T], index: usize) {
    let head = table.free_head.load(Ordering::Acquire);
    entries[index].set_next_free(head);
    table.free_head.store(index as i32, Ordering::Release);
}

/// Initialize `entries` as a fully-linked free list `0 -> 1 -> ... -> n-1 -> -1`.
pub(crate) fn init_free_list<T: FreeListEntry>(table: &mut TableHeader, entries: &mut [T]) {
    let n = entries.len();
    for i in 0..n {
        let next = if i + 1 < n { i as i32 + 1 } else { -1 };
        entries[i].set_next_free(next);
    }
    table.free_head = AtomicI32::new(if n == 0 { -1 } else { 0 });
}

/// Fixed-width, length-prefixed name storage used by every table entry that
/// carries a human-readable name (`[u8; N]`, first byte is the length).
pub(crate) fn write_name<const N: usize>(buf: &mut [u8; N], name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(N - 1);
    buf[0] = len as u8;
    buf[1..1 + len].copy_from_slice(&bytes[..len]);
}

pub(crate) fn read_name<const N: usize>(buf: &[u8; N]) -> String {
    let len = (buf[0] as usize).min(N - 1);
    String::from_utf8_lossy(&buf[1..1 + len]).into_owned()
}

#[repr(C, align(64))]
struct RegistryHeader {
    magic: u64,
    version: u32,
    reserved: u32,
    total_size: u64,
    process_table: TableHeader,
    block_table: TableHeader,
    connection_table: TableHeader,
    pool_table: TableHeader,
    buffer_table: TableHeader,
}

struct Layout {
    header_size: usize,
    processes_offset: usize,
    blocks_offset: usize,
    connections_offset: usize,
    pools_offset: usize,
    buffers_offset: usize,
    buffer_index_offset: usize,
    total_size: usize,
}

fn layout() -> Layout {
    let header_size = align_up(std::mem::size_of::<RegistryHeader>(), CACHE_LINE);
    let processes_offset = header_size;
    let processes_size = align_up(
        std::mem::size_of::<ProcessEntry>() * MAX_PROCESSES,
        CACHE_LINE,
    );
    let blocks_offset = processes_offset + processes_size;
    let blocks_size = align_up(std::mem::size_of::<BlockEntry>() * MAX_BLOCKS, CACHE_LINE);
    let connections_offset = blocks_offset + blocks_size;
    let connections_size = align_up(
        std::mem::size_of::<ConnectionEntry>() * MAX_CONNECTIONS,
        CACHE_LINE,
    );
    let pools_offset = connections_offset + connections_size;
    let pools_size = align_up(std::mem::size_of::<PoolEntry>() * MAX_POOLS, CACHE_LINE);
    let buffers_offset = pools_offset + pools_size;
    let buffers_size = align_up(
        std::mem::size_of::<BufferMetaEntry>() * MAX_BUFFERS,
        CACHE_LINE,
    );
    // Open-addressing hash index over the buffer table, keyed on
    // `BufferId::hash_key`. Resolves the find_slot performance question in
    // favor of O(1) lookup; `find_slot_linear` (buffer_table.rs) scans the
    // array above directly and is kept for cross-checking in tests.
    let buffer_index_offset = buffers_offset + buffers_size;
    let buffer_index_size = align_up(std::mem::size_of::<AtomicI32>() * MAX_BUFFERS, CACHE_LINE);
    let total_size = buffer_index_offset + buffer_index_size;

    Layout {
        header_size,
        processes_offset,
        blocks_offset,
        connections_offset,
        pools_offset,
        buffers_offset,
        buffer_index_offset,
        total_size,
    }
}

/// Handle to an open Global Registry segment.
pub struct Registry {
    ptr: *mut u8,
    fd: i32,
    segment_name: String,
    total_size: usize,
    owner: bool,
}

unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl Registry {
    /// Open the registry segment if it exists, or create and initialize it.
    ///
    /// Asserts the platform provides the lock-free atomics this design
    /// depends on (spec's startup check; stable Rust exposes this via
    /// `AtomicU64::is_lock_free`/`AtomicU32::is_lock_free` rather than a
    /// runtime `is_lock_free()` free function as in C++).
    pub fn open_or_create(segment_name: &str) -> RuntimeResult<Self> {
        if !std::sync::atomic::AtomicU64::is_lock_free()
            || !std::sync::atomic::AtomicU32::is_lock_free()
        {
            return Err(RuntimeError::NotLockFree);
        }

        match Self::open(segment_name) {
            Ok(registry) => Ok(registry),
            Err(_) => Self::create(segment_name),
        }
    }

    fn create(segment_name: &str) -> RuntimeResult<Self> {
        let l = layout();
        let (ptr, fd) = shm::create_shm(segment_name, l.total_size)?;

        unsafe {
            let header = &mut *(ptr as *mut RegistryHeader);
            header.magic = REGISTRY_MAGIC;
            header.version = REGISTRY_VERSION;
            header.reserved = 0;
            header.total_size = l.total_size as u64;

            header.process_table.mutex.init_in_place()?;
            header.block_table.mutex.init_in_place()?;
            header.connection_table.mutex.init_in_place()?;
            header.pool_table.mutex.init_in_place()?;
            header.buffer_table.mutex.init_in_place()?;

            init_free_list(&mut header.process_table, Self::processes_mut(ptr));
            init_free_list(&mut header.block_table, Self::blocks_mut(ptr));
            init_free_list(&mut header.connection_table, Self::connections_mut(ptr));
            init_free_list(&mut header.pool_table, Self::pools_mut(ptr));
            init_free_list(&mut header.buffer_table, Self::buffers_mut(ptr));

            for slot in Self::buffer_index_mut(ptr) {
                slot.store(-1, Ordering::Relaxed);
            }
        }

        info!(segment_name, size = l.total_size, "registry created");

        Ok(Self {
            ptr,
            fd,
            segment_name: segment_name.to_string(),
            total_size: l.total_size,
            owner: true,
        })
    }

    fn open(segment_name: &str) -> RuntimeResult<Self> {
        let l = layout();
        let (ptr, fd) = shm::open_shm(segment_name, l.total_size)?;

        unsafe {
            let header = &*(ptr as *const RegistryHeader);
            if header.magic != REGISTRY_MAGIC {
                shm::close_shm(ptr, l.total_size, fd);
                return Err(RuntimeError::BadMagic);
            }
            if header.version != REGISTRY_VERSION {
                shm::close_shm(ptr, l.total_size, fd);
                return Err(RuntimeError::IncompatibleVersion);
            }
        }

        Ok(Self {
            ptr,
            fd,
            segment_name: segment_name.to_string(),
            total_size: l.total_size,
            owner: false,
        })
    }

    fn header(&self) -> &RegistryHeader {
        unsafe { &*(self.ptr as *const RegistryHeader) }
    }

    unsafe fn processes_mut<'a>(ptr: *mut u8) -> &'a mut [ProcessEntry] {
        let l = layout();
        std::slice::from_raw_parts_mut(
            ptr.add(l.processes_offset) as *mut ProcessEntry,
            MAX_PROCESSES,
        )
    }

    unsafe fn blocks_mut<'a>(ptr: *mut u8) -> &'a mut [BlockEntry] {
        let l = layout();
        std::slice::from_raw_parts_mut(ptr.add(l.blocks_offset) as *mut BlockEntry, MAX_BLOCKS)
    }

    unsafe fn connections_mut<'a>(ptr: *mut u8) -> &'a mut [ConnectionEntry] {
        let l = layout();
        std::slice::from_raw_parts_mut(
            ptr.add(l.connections_offset) as *mut ConnectionEntry,
            MAX_CONNECTIONS,
        )
    }

    unsafe fn pools_mut<'a>(ptr: *mut u8) -> &'a mut [PoolEntry] {
        let l = layout();
        std::slice::from_raw_parts_mut(ptr.add(l.pools_offset) as *mut PoolEntry, MAX_POOLS)
    }

    unsafe fn buffers_mut<'a>(ptr: *mut u8) -> &'a mut [BufferMetaEntry] {
        let l = layout();
        std::slice::from_raw_parts_mut(
            ptr.add(l.buffers_offset) as *mut BufferMetaEntry,
            MAX_BUFFERS,
        )
    }

    unsafe fn buffer_index_mut<'a>(ptr: *mut u8) -> &'a [AtomicI32] {
        let l = layout();
        std::slice::from_raw_parts(ptr.add(l.buffer_index_offset) as *const AtomicI32, MAX_BUFFERS)
    }

    fn processes(&self) -> &mut [ProcessEntry] {
        unsafe { Self::processes_mut(self.ptr) }
    }

    fn blocks(&self) -> &mut [BlockEntry] {
        unsafe { Self::blocks_mut(self.ptr) }
    }

    fn connections(&self) -> &mut [ConnectionEntry] {
        unsafe { Self::connections_mut(self.ptr) }
    }

    fn pools(&self) -> &mut [PoolEntry] {
        unsafe { Self::pools_mut(self.ptr) }
    }

    fn buffers(&self) -> &mut [BufferMetaEntry] {
        unsafe { Self::buffers_mut(self.ptr) }
    }

    fn buffer_index(&self) -> &[AtomicI32] {
        unsafe { Self::buffer_index_mut(self.ptr) }
    }

    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    // ----- Process table -----

    /// Register a new process, returning its slot index.
    pub fn register_process(&self, pid: i32, role: ProcessRole, name: &str) -> RuntimeResult<ProcessSlot> {
        process_table::register(self, pid, role, name)
    }

    /// Remove a process from the table. Does not cascade block/port
    /// teardown; callers needing that should use [`Self::reclaim_dead_processes`]
    /// or perform an orderly shutdown via the owning process itself.
    pub fn unregister_process(&self, slot: ProcessSlot) -> RuntimeResult<()> {
        process_table::unregister(self, slot)
    }

    /// Update a process's heartbeat timestamp to `now_ns()`.
    pub fn update_heartbeat(&self, slot: ProcessSlot) -> RuntimeResult<()> {
        process_table::update_heartbeat(self, slot)
    }

    /// Scan the process table for processes whose heartbeat is older than
    /// `liveness_timeout_ns`, confirm via OS-pid liveness, and reclaim dead
    /// ones: mark inactive, cascade-unregister their blocks/ports,
    /// decrement the buffers they created, and free their slot.
    pub fn reclaim_dead_processes(&self, liveness_timeout_ns: u64) -> Vec<ProcessSlot> {
        let now = now_ns();
        let mut reclaimed = Vec::new();

        for slot in 0..MAX_PROCESSES as ProcessSlot {
            let entry = &self.processes()[slot as usize];
            if entry.alive.load(Ordering::Acquire) == 0 {
                continue;
            }
            let last_heartbeat = entry.last_heartbeat_ns.load(Ordering::Acquire);
            if now.saturating_sub(last_heartbeat) < liveness_timeout_ns {
                continue;
            }
            let pid = entry.pid;
            if process_table::is_pid_alive(pid) {
                continue;
            }

            warn!(slot, pid, "reclaiming dead process");
            self.cascade_reclaim_process(slot);
            reclaimed.push(slot);
        }

        reclaimed
    }

    fn cascade_reclaim_process(&self, slot: ProcessSlot) {
        let owned_blocks: Vec<u32> = {
            let entry = &self.processes()[slot as usize];
            entry.owned_blocks[..entry.owned_block_count as usize].to_vec()
        };
        for block_slot in owned_blocks {
            let _ = self.unregister_block(block_slot);
        }

        // Any buffer this process created and never transferred ownership
        // of (e.g. `Handle::allocate` with no following `produce_output`)
        // still holds the creator's initial reference; drop it per spec
        // §4.7 step 3 ("decrement by 1, trust the transferred-to queues to
        // hold their own refs") and release the pool block for any entry
        // that reference was the last one keeping alive.
        for released in buffer_table::reclaim_creator(self, slot) {
            self.release_reclaimed_block(released);
        }

        let _ = process_table::unregister(self, slot);
    }

    fn release_reclaimed_block(&self, released: buffer_table::ReclaimedBuffer) {
        let Some(pool_entry) = self.find_pool_by_id(released.pool_id) else {
            warn!(pool_id = released.pool_id, "cannot release reclaimed buffer: unknown pool");
            return;
        };
        let pool = match crate::pool::Pool::open(
            &pool_entry.segment_name(),
            pool_entry.block_size(),
            pool_entry.block_count(),
        ) {
            Ok(pool) => pool,
            Err(e) => {
                warn!(pool_id = released.pool_id, error = %e, "failed to open pool to release reclaimed buffer");
                return;
            }
        };
        if let Err(e) = pool.free_block(released.block_index, released.generation) {
            warn!(
                pool_id = released.pool_id,
                block_index = released.block_index,
                error = %e,
                "failed to free reclaimed pool block"
            );
        }
    }

    // ----- Block table -----

    /// Register a new block owned by `owner_slot`, returning its block id
    /// and slot index.
    pub fn register_block(
        &self,
        owner_slot: ProcessSlot,
        kind: BlockKind,
        name: &str,
    ) -> RuntimeResult<(BlockId, BlockSlot)> {
        block_table::register(self, owner_slot, kind, name)
    }

    pub fn unregister_block(&self, slot: BlockSlot) -> RuntimeResult<()> {
        block_table::unregister(self, slot)
    }

    /// Register a named port on `block_slot`.
    pub fn register_port(
        &self,
        block_slot: BlockSlot,
        name: &str,
        direction: PortDirection,
    ) -> RuntimeResult<()> {
        block_table::register_port(self, block_slot, name, direction)
    }

    pub fn find_block_by_id(&self, block_id: BlockId) -> Option<BlockSlot> {
        block_table::find_by_id(self, block_id)
    }

    /// Stamp `slot`'s `last_work_ns` with the current time. Called by the
    /// scheduler once per `work()` invocation via [`crate::block::BlockContext::touch_work`].
    pub fn block_last_work_touch(&self, slot: BlockSlot) {
        if let Some(entry) = self.blocks().get(slot as usize) {
            entry.touch_work();
        }
    }

    // ----- Connection table -----

    /// Record a connection from `src_block`'s `src_port` to `dst_block`'s
    /// `dst_port`.
    pub fn add_connection(
        &self,
        src_block: BlockId,
        src_port: &str,
        dst_block: BlockId,
        dst_port: &str,
    ) -> RuntimeResult<ConnectionId> {
        connection_table::add(self, src_block, src_port, dst_block, dst_port)
    }

    pub fn remove_connection(&self, connection_id: ConnectionId) -> RuntimeResult<()> {
        connection_table::remove(self, connection_id)
    }

    /// All active connections whose source is `block_id`.
    pub fn connections_from(&self, block_id: BlockId) -> Vec<ConnectionEntry> {
        connection_table::connections_from(self, block_id)
    }

    /// Record that `bytes` crossed `connection_id` in a single buffer push.
    pub fn record_connection_transfer(
        &self,
        connection_id: ConnectionId,
        bytes: u64,
    ) -> RuntimeResult<()> {
        connection_table::record_transfer(self, connection_id, bytes)
    }

    // ----- Pool table -----

    pub fn register_pool(
        &self,
        name: &str,
        block_size: u32,
        block_count: u32,
        segment_name: &str,
    ) -> RuntimeResult<u32> {
        pool_table::register(self, name, block_size, block_count, segment_name)
    }

    pub fn unregister_pool(&self, pool_id: u32) -> RuntimeResult<()> {
        pool_table::unregister(self, pool_id)
    }

    pub fn find_pool_by_name(&self, name: &str) -> Option<PoolEntry> {
        pool_table::find_by_name(self, name)
    }

    pub fn find_pool_by_id(&self, pool_id: u32) -> Option<PoolEntry> {
        pool_table::find_by_id(self, pool_id)
    }

    // ----- Buffer metadata table -----

    pub fn allocate_buffer_slot(
        &self,
        buffer_id: u64,
        pool_id: u32,
        block_index: u32,
        size: u32,
        creator_slot: ProcessSlot,
        generation: u32,
    ) -> RuntimeResult<()> {
        buffer_table::allocate_slot(
            self,
            buffer_id,
            pool_id,
            block_index,
            size,
            creator_slot,
            generation,
        )
    }

    pub fn free_buffer_slot(&self, buffer_id: u64) -> RuntimeResult<()> {
        buffer_table::free_slot(self, buffer_id)
    }

    pub fn add_ref(&self, buffer_id: u64, count: u32) -> RuntimeResult<()> {
        buffer_table::add_ref(self, buffer_id, count)
    }

    /// Decrement the refcount by one; returns `true` if it reached zero
    /// (caller must then release the underlying block and free the slot).
    pub fn sub_ref(&self, buffer_id: u64) -> RuntimeResult<bool> {
        buffer_table::sub_ref(self, buffer_id)
    }

    /// O(1) lookup via the open-addressing hash index.
    pub fn find_slot(&self, buffer_id: u64) -> Option<usize> {
        buffer_table::find_slot(self, buffer_id)
    }

    /// O(n) baseline lookup, kept to cross-check [`Self::find_slot`] in tests.
    pub fn find_slot_linear(&self, buffer_id: u64) -> Option<usize> {
        buffer_table::find_slot_linear(self, buffer_id)
    }

    pub fn buffer_meta(&self, slot: usize) -> BufferMetaSnapshot {
        buffer_table::snapshot(self, slot)
    }

    /// Drop one reference to `buffer_id` a caller holds without a [`crate::handle::Handle`]
    /// (e.g. a port queue consumer slot closing with buffers still pending).
    /// Releases the pool block and metadata slot if this was the last reference.
    pub fn release_buffer_ref(&self, buffer_id: u64) -> RuntimeResult<()> {
        let slot = self.find_slot(buffer_id).ok_or(RuntimeError::UnknownBuffer(buffer_id))?;
        let meta = self.buffer_meta(slot);
        if self.sub_ref(buffer_id)? {
            self.free_buffer_slot(buffer_id)?;
            let pool_entry = self
                .find_pool_by_id(meta.pool_id)
                .ok_or(RuntimeError::UnknownPool(meta.pool_id))?;
            let pool = crate::pool::Pool::open(
                &pool_entry.segment_name(),
                pool_entry.block_size(),
                pool_entry.block_count(),
            )?;
            pool.free_block(meta.block_index, meta.generation)?;
        }
        Ok(())
    }
}

pub use buffer_table::BufferMetaSnapshot;

impl Drop for Registry {
    fn drop(&mut self) {
        unsafe {
            shm::close_shm(self.ptr, self.total_size, self.fd);
        }
        if self.owner {
            let _ = shm::unlink_shm(&self.segment_name);
        }
    }
}
