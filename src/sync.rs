//! Cross-process synchronization primitives.
//!
//! The Registry's per-table locks and the Broadcast Port Queue's mutex/
//! condvars must be usable by unrelated processes that merely `mmap` the
//! same segment — an in-process-only primitive like `std::sync::Mutex`
//! cannot satisfy that, since its poison state and futex word are not
//! guaranteed to mean anything to a second address space. POSIX gives us
//! exactly this via `PTHREAD_PROCESS_SHARED` pthread mutexes and condvars;
//! `ShmMutex`/`ShmCondvar` are thin `repr(C)` wrappers around them so they
//! can be embedded directly inside a `repr(C)` shared-memory header.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::time::Duration;

use libc::{
    pthread_cond_destroy, pthread_cond_init, pthread_cond_signal, pthread_cond_timedwait,
    pthread_cond_wait, pthread_condattr_destroy, pthread_condattr_init,
    pthread_condattr_setpshared, pthread_cond_broadcast, pthread_cond_t, pthread_condattr_t,
    pthread_mutex_destroy, pthread_mutex_init, pthread_mutex_lock, pthread_mutex_t,
    pthread_mutex_unlock, pthread_mutexattr_destroy, pthread_mutexattr_init,
    pthread_mutexattr_setpshared, pthread_mutexattr_t, timespec, PTHREAD_PROCESS_SHARED,
};

use crate::error::{RuntimeError, RuntimeResult};

/// A pthread mutex usable by any process mapping the segment it lives in.
///
/// `repr(C)` so it can be embedded directly in a shared-memory header struct
/// at a fixed offset; every process that maps the segment sees the same
/// bytes and therefore the same pthread kernel object.
#[repr(C)]
pub struct ShmMutex {
    inner: UnsafeCell<pthread_mutex_t>,
}

unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

impl ShmMutex {
    /// Initialize a mutex in place. Must be called exactly once, by the
    /// process that creates the segment, before any other process maps it.
    ///
    /// # Safety
    ///
    /// `self` must not already be initialized, and must live at a stable
    /// address for as long as any process holds a mapping that reaches it.
    pub unsafe fn init_in_place(&self) -> RuntimeResult<()> {
        let mut attr = MaybeUninit::<pthread_mutexattr_t>::uninit();
        if pthread_mutexattr_init(attr.as_mut_ptr()) != 0 {
            return Err(RuntimeError::ShmCreateFailed(
                "pthread_mutexattr_init failed".into(),
            ));
        }
        let mut attr = attr.assume_init();
        if pthread_mutexattr_setpshared(&mut attr, PTHREAD_PROCESS_SHARED) != 0 {
            pthread_mutexattr_destroy(&mut attr);
            return Err(RuntimeError::ShmCreateFailed(
                "pthread_mutexattr_setpshared failed".into(),
            ));
        }
        let rc = pthread_mutex_init(self.inner.get(), &attr);
        pthread_mutexattr_destroy(&mut attr);
        if rc != 0 {
            return Err(RuntimeError::ShmCreateFailed(
                "pthread_mutex_init failed".into(),
            ));
        }
        Ok(())
    }

    /// Acquire the lock, blocking the calling thread until it is available.
    ///
    /// # Safety
    ///
    /// `self` must have been initialized via [`init_in_place`](Self::init_in_place).
    pub unsafe fn lock(&self) -> ShmMutexGuard<'_> {
        pthread_mutex_lock(self.inner.get());
        ShmMutexGuard { mutex: self }
    }

    unsafe fn raw(&self) -> *mut pthread_mutex_t {
        self.inner.get()
    }
}

impl Drop for ShmMutex {
    fn drop(&mut self) {
        unsafe {
            pthread_mutex_destroy(self.inner.get());
        }
    }
}

/// RAII guard returned by [`ShmMutex::lock`]; unlocks on drop.
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            pthread_mutex_unlock(self.mutex.raw());
        }
    }
}

/// A pthread condition variable usable by any process mapping the segment
/// it lives in. Always used together with a [`ShmMutex`] held by the caller.
#[repr(C)]
pub struct ShmCondvar {
    inner: UnsafeCell<pthread_cond_t>,
}

unsafe impl Send for ShmCondvar {}
unsafe impl Sync for ShmCondvar {}

impl ShmCondvar {
    /// Initialize a condvar in place. Must be called exactly once, by the
    /// process that creates the segment.
    ///
    /// # Safety
    ///
    /// `self` must not already be initialized, and must live at a stable
    /// address for as long as any process holds a mapping that reaches it.
    pub unsafe fn init_in_place(&self) -> RuntimeResult<()> {
        let mut attr = MaybeUninit::<pthread_condattr_t>::uninit();
        if pthread_condattr_init(attr.as_mut_ptr()) != 0 {
            return Err(RuntimeError::ShmCreateFailed(
                "pthread_condattr_init failed".into(),
            ));
        }
        let mut attr = attr.assume_init();
        if pthread_condattr_setpshared(&mut attr, PTHREAD_PROCESS_SHARED) != 0 {
            pthread_condattr_destroy(&mut attr);
            return Err(RuntimeError::ShmCreateFailed(
                "pthread_condattr_setpshared failed".into(),
            ));
        }
        let rc = pthread_cond_init(self.inner.get(), &attr);
        pthread_condattr_destroy(&mut attr);
        if rc != 0 {
            return Err(RuntimeError::ShmCreateFailed(
                "pthread_cond_init failed".into(),
            ));
        }
        Ok(())
    }

    /// Block the calling thread on this condvar, releasing `guard`'s mutex
    /// for the duration and reacquiring it before returning.
    ///
    /// # Safety
    ///
    /// `guard` must be a guard for the same `ShmMutex` every other waiter on
    /// this condvar uses.
    pub unsafe fn wait<'a>(&self, guard: ShmMutexGuard<'a>) -> ShmMutexGuard<'a> {
        pthread_cond_wait(self.inner.get(), guard.mutex.raw());
        guard
    }

    /// Like [`wait`](Self::wait), but returns early after `timeout` elapses.
    /// Returns `true` if woken by a signal/broadcast, `false` on timeout.
    ///
    /// # Safety
    ///
    /// Same requirements as [`wait`](Self::wait).
    pub unsafe fn wait_timeout<'a>(
        &self,
        guard: ShmMutexGuard<'a>,
        timeout: Duration,
    ) -> (ShmMutexGuard<'a>, bool) {
        let mut now = MaybeUninit::<libc::timeval>::uninit();
        libc::gettimeofday(now.as_mut_ptr(), std::ptr::null_mut());
        let now = now.assume_init();

        let mut deadline = timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t,
            tv_nsec: (now.tv_usec as i64 * 1_000) + timeout.subsec_nanos() as i64,
        };
        if deadline.tv_nsec >= 1_000_000_000 {
            deadline.tv_sec += 1;
            deadline.tv_nsec -= 1_000_000_000;
        }

        let rc = pthread_cond_timedwait(self.inner.get(), guard.mutex.raw(), &deadline);
        (guard, rc == 0)
    }

    /// Wake exactly one waiter.
    ///
    /// # Safety
    ///
    /// `self` must have been initialized via [`init_in_place`](Self::init_in_place).
    pub unsafe fn notify_one(&self) {
        pthread_cond_signal(self.inner.get());
    }

    /// Wake every current waiter.
    ///
    /// # Safety
    ///
    /// `self` must have been initialized via [`init_in_place`](Self::init_in_place).
    pub unsafe fn notify_all(&self) {
        pthread_cond_broadcast(self.inner.get());
    }
}

impl Drop for ShmCondvar {
    fn drop(&mut self) {
        unsafe {
            pthread_cond_destroy(self.inner.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    struct Shared {
        mutex: ShmMutex,
        condvar: ShmCondvar,
        ready: UnsafeCell<bool>,
    }
    unsafe impl Send for Shared {}
    unsafe impl Sync for Shared {}

    #[test]
    fn mutex_excludes_concurrent_access() {
        let mutex = ShmMutex {
            inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        };
        unsafe { mutex.init_in_place().unwrap() };
        let counter = UnsafeCell::new(0u64);
        struct Wrap<'a>(&'a ShmMutex, &'a UnsafeCell<u64>);
        unsafe impl Send for Wrap<'_> {}
        unsafe impl Sync for Wrap<'_> {}
        let wrap = Wrap(&mutex, &counter);

        thread::scope(|scope| {
            for _ in 0..8 {
                let wrap = &wrap;
                scope.spawn(move || {
                    for _ in 0..1000 {
                        unsafe {
                            let _guard = wrap.0.lock();
                            *wrap.1.get() += 1;
                        }
                    }
                });
            }
        });

        assert_eq!(unsafe { *counter.get() }, 8000);
    }

    #[test]
    fn condvar_wakes_waiting_thread() {
        let shared = Arc::new(Shared {
            mutex: ShmMutex {
                inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            },
            condvar: ShmCondvar {
                inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            },
            ready: UnsafeCell::new(false),
        });
        unsafe {
            shared.mutex.init_in_place().unwrap();
            shared.condvar.init_in_place().unwrap();
        }

        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || unsafe {
                let mut guard = shared.mutex.lock();
                while !*shared.ready.get() {
                    guard = shared.condvar.wait(guard);
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        unsafe {
            let _guard = shared.mutex.lock();
            *shared.ready.get() = true;
            shared.condvar.notify_all();
        }
        waiter.join().unwrap();
    }

    #[test]
    fn condvar_wait_timeout_returns_false_when_not_notified() {
        let shared = Arc::new(Shared {
            mutex: ShmMutex {
                inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            },
            condvar: ShmCondvar {
                inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            },
            ready: UnsafeCell::new(false),
        });
        unsafe {
            shared.mutex.init_in_place().unwrap();
            shared.condvar.init_in_place().unwrap();
            let guard = shared.mutex.lock();
            let (_guard, woken) = shared
                .condvar
                .wait_timeout(guard, Duration::from_millis(20));
            assert!(!woken);
        }
    }
}
