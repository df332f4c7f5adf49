//! Raw shared-memory segment primitives, platform-gated.
//!
//! Every persistent entity in the runtime — the Global Registry, each Buffer
//! Pool, each Broadcast Port Queue — lives in its own named shared-memory
//! segment. This module owns the segment lifecycle (create/open/close/unlink)
//! and the naming scheme; the higher-level modules (`registry`, `pool`,
//! `queue`) cast the mapped bytes into their own `repr(C)` header types.

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use self::unix::{close_shm, create_shm, open_shm, unlink_shm};

#[cfg(windows)]
pub use self::windows::{close_shm, create_shm, open_shm, unlink_shm};

/// Build the `<prefix>_registry` segment name.
pub fn registry_segment_name(prefix: &str) -> String {
    format!("/{prefix}_registry")
}

/// Build the `<prefix>_pool_<name>` segment name for a buffer pool.
pub fn pool_segment_name(prefix: &str, pool_name: &str) -> String {
    format!("/{prefix}_pool_{pool_name}")
}

/// Build the `<prefix>_queue_<block_id>_<port>` segment name for a port queue.
pub fn queue_segment_name(prefix: &str, block_id: u64, port: &str) -> String {
    format!("/{prefix}_queue_{block_id}_{port}")
}
