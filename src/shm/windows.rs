//! Windows shared-memory segment primitives (STUB).
//!
//! # Implementation status: not yet implemented
//!
//! The registry/pool/queue modules are themselves `#[cfg(unix)]`-gated for
//! now (they depend on `crate::sync::ShmMutex`, which wraps POSIX pthread
//! primitives), so this stub only needs to satisfy `crate::shm`'s re-export
//! surface well enough to keep the crate compiling on Windows targets; no
//! caller reaches these functions yet.
//!
//! ## Implementation plan
//!
//! - Segment create/open: `CreateFileMappingW`/`OpenFileMappingW` +
//!   `MapViewOfFile`, named `Local\<prefix>_registry` /
//!   `Local\<prefix>_pool_<name>` / `Local\<prefix>_queue_<block_id>_<port>`,
//!   mirroring the POSIX names in [`crate::shm`] with `/` replaced by
//!   `Local\`.
//! - Segment close: `UnmapViewOfFile` + `CloseHandle`.
//! - Segment unlink: Windows file mappings have no `shm_unlink` equivalent —
//!   the mapping is destroyed automatically when the last handle closes, so
//!   `unlink_shm` would be a no-op that documents this instead of performing
//!   an action.
//! - `ShmMutex`/`ShmCondvar` would need a Windows-native replacement (a
//!   named `Mutex`/condition variable support is thinner on Windows); SRW
//!   locks backed by `Global\` named section would be the natural analogue
//!   once this module moves past stub status.

use crate::error::{RuntimeError, RuntimeResult};

pub(crate) fn create_shm(name: &str, _size: usize) -> RuntimeResult<(*mut u8, i32)> {
    Err(RuntimeError::ShmCreateFailed(format!(
        "Windows shared memory not yet implemented (segment '{name}')"
    )))
}

pub(crate) fn open_shm(name: &str, _size: usize) -> RuntimeResult<(*mut u8, i32)> {
    Err(RuntimeError::ShmCreateFailed(format!(
        "Windows shared memory not yet implemented (segment '{name}')"
    )))
}

/// # Safety
///
/// Never called: [`create_shm`]/[`open_shm`] never return a mapping to close.
pub(crate) unsafe fn close_shm(_ptr: *mut u8, _size: usize, _fd: i32) {}

pub(crate) fn unlink_shm(_name: &str) -> RuntimeResult<()> {
    Ok(())
}
