//! POSIX shared-memory segment primitives (macOS/Linux).
//!
//! Generalized from a session-oriented `shm_open`/`mmap` transport into
//! plain create/open/close/unlink over an arbitrary caller-supplied name and
//! size. Every caller (Registry, Pool, Queue) already knows the exact size
//! to map — fixed table sizes are compile-time constants, queue sizes come
//! from the negotiated capacity — so, unlike a variable-length event stream,
//! there is no header-probing step here.

use std::ffi::CString;
use std::ptr;

use libc::{
    c_int, c_uint, c_void, close, ftruncate, mmap, munmap, off_t, shm_open, shm_unlink,
    MAP_FAILED, MAP_SHARED, O_CREAT, O_EXCL, O_RDWR, PROT_READ, PROT_WRITE, S_IRUSR, S_IWUSR,
};

use crate::error::{RuntimeError, RuntimeResult};

/// Create and map a brand-new shared-memory segment.
///
/// # Safety
///
/// Returns a raw pointer to mapped memory. The caller must not use the
/// pointer after passing it to [`close_shm`], and must follow whatever
/// concurrent-access protocol the owning header type documents.
pub(crate) fn create_shm(name: &str, size: usize) -> RuntimeResult<(*mut u8, c_int)> {
    let c_name = CString::new(name)
        .map_err(|e| RuntimeError::ShmCreateFailed(format!("invalid segment name: {e}")))?;

    unsafe {
        let fd = shm_open(
            c_name.as_ptr(),
            O_CREAT | O_EXCL | O_RDWR,
            (S_IRUSR | S_IWUSR) as c_uint,
        );
        if fd == -1 {
            let err = std::io::Error::last_os_error();
            return Err(RuntimeError::ShmCreateFailed(format!(
                "shm_open failed for '{name}': {err}"
            )));
        }

        if ftruncate(fd, size as off_t) == -1 {
            let err = std::io::Error::last_os_error();
            close(fd);
            let _ = shm_unlink(c_name.as_ptr());
            return Err(RuntimeError::ShmCreateFailed(format!(
                "ftruncate failed: {err}"
            )));
        }

        let ptr = mmap(ptr::null_mut(), size, PROT_READ | PROT_WRITE, MAP_SHARED, fd, 0);
        if ptr == MAP_FAILED {
            let err = std::io::Error::last_os_error();
            close(fd);
            let _ = shm_unlink(c_name.as_ptr());
            return Err(RuntimeError::MapFailed(format!("mmap failed: {err}")));
        }

        Ok((ptr as *mut u8, fd))
    }
}

/// Open and map an existing shared-memory segment of a known size.
///
/// # Safety
///
/// See [`create_shm`].
pub(crate) fn open_shm(name: &str, size: usize) -> RuntimeResult<(*mut u8, c_int)> {
    let c_name = CString::new(name)
        .map_err(|e| RuntimeError::ShmCreateFailed(format!("invalid segment name: {e}")))?;

    unsafe {
        let fd = shm_open(c_name.as_ptr(), O_RDWR, 0);
        if fd == -1 {
            let err = std::io::Error::last_os_error();
            return Err(RuntimeError::ShmCreateFailed(format!(
                "shm_open failed for '{name}': {err}"
            )));
        }

        let ptr = mmap(ptr::null_mut(), size, PROT_READ | PROT_WRITE, MAP_SHARED, fd, 0);
        if ptr == MAP_FAILED {
            let err = std::io::Error::last_os_error();
            close(fd);
            return Err(RuntimeError::MapFailed(format!("mmap failed: {err}")));
        }

        Ok((ptr as *mut u8, fd))
    }
}

/// Unmap and close a shared-memory mapping.
///
/// # Safety
///
/// Must only be called once per mapping; `ptr`/`fd` must have come from
/// [`create_shm`] or [`open_shm`] with the same `size`.
pub(crate) unsafe fn close_shm(ptr: *mut u8, size: usize, fd: c_int) {
    if !ptr.is_null() {
        munmap(ptr as *mut c_void, size);
    }
    if fd >= 0 {
        close(fd);
    }
}

/// Remove a named shared-memory segment.
///
/// # Safety
///
/// Should only be called once every process holding a mapping has called
/// [`close_shm`], or is guaranteed to open it only after this returns.
pub(crate) fn unlink_shm(name: &str) -> RuntimeResult<()> {
    let c_name = CString::new(name)
        .map_err(|e| RuntimeError::ShmCreateFailed(format!("invalid segment name: {e}")))?;

    unsafe {
        if shm_unlink(c_name.as_ptr()) == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(RuntimeError::ShmCreateFailed(format!(
                    "shm_unlink failed: {err}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_close_unlink_round_trip() {
        let name = format!("/flowmesh_test_{}", std::process::id());
        let (ptr, fd) = create_shm(&name, 4096).unwrap();
        unsafe {
            ptr.write_bytes(0xAB, 4096);
            close_shm(ptr, 4096, fd);
        }

        let (ptr2, fd2) = open_shm(&name, 4096).unwrap();
        unsafe {
            assert_eq!(*ptr2, 0xAB);
            close_shm(ptr2, 4096, fd2);
        }

        unlink_shm(&name).unwrap();
        assert!(open_shm(&name, 4096).is_err());
    }

    #[test]
    fn create_fails_if_segment_already_exists() {
        let name = format!("/flowmesh_test_dup_{}", std::process::id());
        let (ptr, fd) = create_shm(&name, 4096).unwrap();
        let second = create_shm(&name, 4096);
        assert!(second.is_err());
        unsafe {
            close_shm(ptr, 4096, fd);
        }
        unlink_shm(&name).unwrap();
    }
}
