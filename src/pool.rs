//! Buffer Pool: a fixed-size-block allocator living in its own
//! shared-memory segment, shared lock-free across every process that opens
//! it.
//!
//! Layout: `PoolHeader` (cache-line aligned), followed by a `next_free`
//! array (one `AtomicI32` per block, the intrusive free-list links) and a
//! `generation` array (one `AtomicU32` per block, bumped on every successful
//! allocate so a stale free can be told apart from a fresh one), followed by
//! the block data region itself, block `i` at offset `i * block_size`.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::shm;

const POOL_MAGIC: u64 = 0x464D50_4F4F4C00; // "FMPOOL\0" in the high bytes
const POOL_VERSION: u32 = 1;

const CACHE_LINE: usize = 64;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[repr(C, align(64))]
struct PoolHeader {
    magic: u64,
    version: u32,
    reserved: u32,
    block_size: u32,
    block_count: u32,
    free_head: AtomicI32,
    free_count: AtomicU32,
}

/// A buffer pool: a fixed number of fixed-size blocks in shared memory.
pub struct Pool {
    ptr: *mut u8,
    fd: i32,
    segment_name: String,
    total_size: usize,
    block_size: u32,
    block_count: u32,
    owner: bool,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    fn layout(block_size: u32, block_count: u32) -> (usize, usize, usize, usize) {
        let header_size = align_up(std::mem::size_of::<PoolHeader>(), CACHE_LINE);
        let next_free_size = align_up(block_count as usize * 4, CACHE_LINE);
        let generation_size = align_up(block_count as usize * 4, CACHE_LINE);
        let data_offset = header_size + next_free_size + generation_size;
        let total = data_offset + block_size as usize * block_count as usize;
        (header_size, next_free_size, generation_size, total)
    }

    /// Create a brand-new pool segment with `block_count` blocks of
    /// `block_size` bytes each, and initialize the free list as a simple
    /// chain `0 -> 1 -> ... -> block_count - 1 -> -1`.
    pub fn create(segment_name: &str, block_size: u32, block_count: u32) -> RuntimeResult<Self> {
        let (_, _, _, total_size) = Self::layout(block_size, block_count);
        let (ptr, fd) = shm::create_shm(segment_name, total_size)?;

        unsafe {
            let header = &mut *(ptr as *mut PoolHeader);
            header.magic = POOL_MAGIC;
            header.version = POOL_VERSION;
            header.reserved = 0;
            header.block_size = block_size;
            header.block_count = block_count;
            header.free_head = AtomicI32::new(if block_count == 0 { -1 } else { 0 });
            header.free_count = AtomicU32::new(block_count);

            let next_free = Self::next_free_slice(ptr, block_count);
            for i in 0..block_count {
                let next = if i + 1 < block_count { i as i32 + 1 } else { -1 };
                next_free[i as usize].store(next, Ordering::Relaxed);
            }
            let generation = Self::generation_slice(ptr, block_size, block_count);
            for g in generation {
                g.store(0, Ordering::Relaxed);
            }
        }

        debug!(segment_name, block_size, block_count, "pool created");

        Ok(Self {
            ptr,
            fd,
            segment_name: segment_name.to_string(),
            total_size,
            block_size,
            block_count,
            owner: true,
        })
    }

    /// Open an existing pool segment, validating its header.
    pub fn open(segment_name: &str, block_size: u32, block_count: u32) -> RuntimeResult<Self> {
        let (_, _, _, total_size) = Self::layout(block_size, block_count);
        let (ptr, fd) = shm::open_shm(segment_name, total_size)?;

        unsafe {
            let header = &*(ptr as *const PoolHeader);
            if header.magic != POOL_MAGIC {
                shm::close_shm(ptr, total_size, fd);
                return Err(RuntimeError::BadMagic);
            }
            if header.version != POOL_VERSION {
                shm::close_shm(ptr, total_size, fd);
                return Err(RuntimeError::IncompatibleVersion);
            }
            if header.block_size != block_size || header.block_count != block_count {
                shm::close_shm(ptr, total_size, fd);
                return Err(RuntimeError::Config(format!(
                    "pool '{segment_name}' layout mismatch: expected {block_size}x{block_count}, \
                     segment has {}x{}",
                    header.block_size, header.block_count
                )));
            }
        }

        Ok(Self {
            ptr,
            fd,
            segment_name: segment_name.to_string(),
            total_size,
            block_size,
            block_count,
            owner: false,
        })
    }

    unsafe fn header(&self) -> &PoolHeader {
        &*(self.ptr as *const PoolHeader)
    }

    unsafe fn next_free_slice<'a>(ptr: *mut u8, block_count: u32) -> &'a [AtomicI32] {
        let header_size = align_up(std::mem::size_of::<PoolHeader>(), CACHE_LINE);
        let base = ptr.add(header_size) as *const AtomicI32;
        std::slice::from_raw_parts(base, block_count as usize)
    }

    unsafe fn generation_slice<'a>(ptr: *mut u8, block_size: u32, block_count: u32) -> &'a [AtomicU32] {
        let (header_size, next_free_size, _, _) = Self::layout(block_size, block_count);
        let base = ptr.add(header_size + next_free_size) as *const AtomicU32;
        std::slice::from_raw_parts(base, block_count as usize)
    }

    fn data_offset(&self) -> usize {
        let (header_size, next_free_size, generation_size, _) =
            Self::layout(self.block_size, self.block_count);
        header_size + next_free_size + generation_size
    }

    /// Byte offset of block `index` within the segment.
    pub fn block_offset(&self, index: u32) -> usize {
        self.data_offset() + index as usize * self.block_size as usize
    }

    /// Raw pointer to block `index`'s data region.
    pub fn block_ptr(&self, index: u32) -> *mut u8 {
        unsafe { self.ptr.add(self.block_offset(index)) }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Allocate a block, returning its slot index and current generation.
    /// Lock-free: pops the free-list head with a CAS loop.
    pub fn allocate_block(&self) -> RuntimeResult<(u32, u32)> {
        let header = unsafe { self.header() };
        let next_free = unsafe { Self::next_free_slice(self.ptr, self.block_count) };
        let generation = unsafe { Self::generation_slice(self.ptr, self.block_size, self.block_count) };

        loop {
            let head = header.free_head.load(Ordering::Acquire);
            if head < 0 {
                return Err(RuntimeError::PoolExhausted);
            }
            let next = next_free[head as usize].load(Ordering::Acquire);
            if header
                .free_head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                header.free_count.fetch_sub(1, Ordering::AcqRel);
                let gen = generation[head as usize].fetch_add(1, Ordering::AcqRel) + 1;
                return Ok((head as u32, gen));
            }
        }
    }

    /// Return a block to the pool. `generation` must match the generation
    /// returned by the allocation that produced `index`; a mismatch means
    /// this is a stale or duplicate free, logged and ignored rather than
    /// corrupting the free list.
    pub fn free_block(&self, index: u32, generation: u32) -> RuntimeResult<()> {
        if index >= self.block_count {
            return Err(RuntimeError::UnknownBuffer(index as u64));
        }
        let header = unsafe { self.header() };
        let next_free = unsafe { Self::next_free_slice(self.ptr, self.block_count) };
        let gen_slice = unsafe { Self::generation_slice(self.ptr, self.block_size, self.block_count) };

        let current_gen = gen_slice[index as usize].load(Ordering::Acquire);
        if current_gen != generation {
            warn!(index, generation, current_gen, "ignoring stale free_block (generation mismatch)");
            return Ok(());
        }

        loop {
            let head = header.free_head.load(Ordering::Acquire);
            next_free[index as usize].store(head, Ordering::Release);
            if header
                .free_head
                .compare_exchange_weak(head, index as i32, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                header.free_count.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
        }
    }

    /// Number of blocks currently free.
    pub fn free_count(&self) -> u32 {
        unsafe { self.header() }.free_count.load(Ordering::Acquire)
    }
}

impl Drop for Pool {
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
        format!("/flowmesh_test_pool_{tag}_{}", std::process::id())
    }

    #[test]
    fn allocate_and_free_round_trip() {
        let name = unique_name("roundtrip");
        let pool = Pool::create(&name, 64, 4).unwrap();
        assert_eq!(pool.free_count(), 4);

        let (idx, gen) = pool.allocate_block().unwrap();
        assert_eq!(pool.free_count(), 3);

        pool.free_block(idx, gen).unwrap();
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhausts_after_all_blocks_allocated() {
        let name = unique_name("exhaust");
        let pool = Pool::create(&name, 32, 2).unwrap();
        let _a = pool.allocate_block().unwrap();
        let _b = pool.allocate_block().unwrap();
        assert!(matches!(pool.allocate_block(), Err(RuntimeError::PoolExhausted)));
    }

    #[test]
    fn stale_free_with_wrong_generation_is_ignored() {
        let name = unique_name("stale");
        let pool = Pool::create(&name, 32, 2).unwrap();
        let (idx, gen) = pool.allocate_block().unwrap();
        pool.free_block(idx, gen).unwrap();
        assert_eq!(pool.free_count(), 2);

        // Re-allocate and re-free bumps the generation; freeing with the
        // stale generation must not touch the free list.
        let (idx2, gen2) = pool.allocate_block().unwrap();
        assert_eq!(idx2, idx);
        pool.free_block(idx2, gen).unwrap();
        assert_eq!(pool.free_count(), 1);
        pool.free_block(idx2, gen2).unwrap();
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn block_offsets_are_linear_and_non_overlapping() {
        let name = unique_name("offsets");
        let pool = Pool::create(&name, 128, 4).unwrap();
        for i in 0..4u32 {
            assert_eq!(pool.block_offset(i), pool.block_offset(0) + i as usize * 128);
        }
    }

    #[test]
    fn open_validates_layout_mismatch() {
        let name = unique_name("mismatch");
        let pool = Pool::create(&name, 64, 4).unwrap();
        let result = Pool::open(&name, 128, 4);
        assert!(result.is_err());
        drop(pool);
    }

    #[test]
    fn concurrent_allocate_never_double_hands_out_a_block() {
        use std::collections::HashSet;
        use std::sync::Mutex;

        let name = unique_name("concurrent");
        let pool = Pool::create(&name, 16, 64).unwrap();
        let seen = Mutex::new(HashSet::new());

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let pool = &pool;
                let seen = &seen;
                scope.spawn(move || {
                    for _ in 0..8 {
                        if let Ok((idx, _)) = pool.allocate_block() {
                            let mut seen = seen.lock().unwrap();
                            assert!(seen.insert(idx), "block {idx} handed out twice");
                        }
                    }
                });
            }
        });

        assert_eq!(seen.lock().unwrap().len(), 64);
    }
}
