//! Process-local buffer `Handle`: the only way application code touches a
//! buffer's bytes. Constructing one increments the buffer's refcount;
//! dropping one decrements it, and releases the underlying pool block plus
//! the metadata slot once the refcount reaches zero.

use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::error::RuntimeResult;
use crate::ids::{BufferId, ProcessSlot, RawBufferId};
use crate::pool::Pool;
use crate::registry::Registry;

static BUFFER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A reference-counted view onto one buffer's bytes.
///
/// `Handle` is `Send` (it may be handed to another thread in the same
/// process) but deliberately not `Sync`: two threads racing to read/write
/// through the same `Handle`'s slice would defeat the single-writer
/// discipline the rest of the runtime assumes of block `work()` calls.
pub struct Handle {
    registry: Arc<Registry>,
    pool: Arc<Pool>,
    buffer_id: RawBufferId,
    generation: u32,
    block_index: u32,
    len: u32,
}

unsafe impl Send for Handle {}

impl Handle {
    /// Allocate a fresh block from `pool`, register its metadata in
    /// `registry`, and return a handle with refcount 1.
    pub fn allocate(
        registry: Arc<Registry>,
        pool: Arc<Pool>,
        pool_id: u32,
        creator_slot: ProcessSlot,
        size: u32,
    ) -> RuntimeResult<Self> {
        let (block_index, generation) = pool.allocate_block()?;
        let buffer_id = BufferId::encode(creator_slot, BUFFER_COUNTER.fetch_add(1, Ordering::Relaxed));

        if let Err(e) =
            registry.allocate_buffer_slot(buffer_id, pool_id, block_index, size, creator_slot, generation)
        {
            let _ = pool.free_block(block_index, generation);
            return Err(e);
        }

        trace!(buffer_id, block_index, size, "buffer allocated");

        Ok(Self {
            registry,
            pool,
            buffer_id,
            generation,
            block_index,
            len: size,
        })
    }

    /// Open a handle onto a buffer another process (or block) already
    /// published, incrementing its refcount by one.
    pub fn open(registry: Arc<Registry>, pool: Arc<Pool>, buffer_id: RawBufferId) -> RuntimeResult<Self> {
        registry.add_ref(buffer_id, 1)?;
        let slot = registry
            .find_slot(buffer_id)
            .ok_or(crate::error::RuntimeError::UnknownBuffer(buffer_id))?;
        let meta = registry.buffer_meta(slot);

        Ok(Self {
            registry,
            pool,
            buffer_id,
            generation: meta.generation,
            block_index: meta.block_index,
            len: meta.size,
        })
    }

    /// Increment the refcount by `count` without constructing a new handle;
    /// used by the Broadcast Port Queue when fanning a single push out to
    /// multiple consumers (spec's chosen policy: "increment by N at push,
    /// decrement once per pop").
    pub fn add_ref(&self, count: u32) -> RuntimeResult<()> {
        self.registry.add_ref(self.buffer_id, count)
    }

    pub fn buffer_id(&self) -> RawBufferId {
        self.buffer_id
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.pool.block_ptr(self.block_index), self.len as usize) }
    }

    /// Mutable access to the underlying bytes. Callers must ensure no other
    /// handle to the same buffer is concurrently writing — the runtime does
    /// not itself arbitrate writer exclusivity beyond the refcount.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.pool.block_ptr(self.block_index), self.len as usize) }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        match self.registry.sub_ref(self.buffer_id) {
            Ok(true) => {
                if let Err(e) = self.registry.free_buffer_slot(self.buffer_id) {
                    tracing::warn!(buffer_id = self.buffer_id, error = %e, "failed to free buffer slot");
                }
                if let Err(e) = self.pool.free_block(self.block_index, self.generation) {
                    tracing::warn!(buffer_id = self.buffer_id, error = %e, "failed to free pool block");
                }
                trace!(buffer_id = self.buffer_id, "buffer released");
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(buffer_id = self.buffer_id, error = %e, "sub_ref failed on drop");
            }
        }
    }
}
