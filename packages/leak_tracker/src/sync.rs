//! Process-wide recursive lock guarding ledger structure changes.
//!
//! `std::sync::Mutex` is unusable here for two reasons: it is not recursive
//! (report generation holds the lock for the whole ledger walk while the same
//! thread may allocate for its own scratch buffers), and some platform
//! implementations may allocate on first use, which would re-enter the
//! allocator being instrumented. This lock is a plain atomic spin lock with
//! an owner token and a depth counter, const-constructible so the allocator
//! can live in a `static`.

use std::cell::UnsafeCell;
use std::hint;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

thread_local! {
    // The address of this thread-local is the thread's identity token.
    // `const` initialization means reading it never allocates, unlike
    // `thread::current()`, which may lazily set up the `Thread` handle.
    static THREAD_TOKEN: u8 = const { 0 };
}

/// A nonzero value unique to the calling thread for its lifetime.
fn thread_token() -> usize {
    THREAD_TOKEN.with(|token| ptr::from_ref(token).addr())
}

/// A recursive mutex: the owning thread may lock it again without
/// deadlocking. The lock is released when every guard has been dropped.
pub(crate) struct RecursiveMutex {
    /// Token of the owning thread, zero when unlocked.
    owner: AtomicUsize,
    /// Reentrancy depth. Only ever touched by the owning thread.
    depth: UnsafeCell<usize>,
}

// SAFETY: `owner` is atomic and `depth` is only accessed by the thread that
// currently owns the lock, which holds exclusive logical access to it.
unsafe impl Send for RecursiveMutex {}
// SAFETY: See above; the depth cell is protected by lock ownership.
unsafe impl Sync for RecursiveMutex {}

impl RecursiveMutex {
    pub(crate) const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(0),
            depth: UnsafeCell::new(0),
        }
    }

    /// Acquires the lock, spinning if another thread holds it. Reentrant
    /// acquisition by the owning thread succeeds immediately.
    pub(crate) fn lock(&self) -> RecursiveMutexGuard<'_> {
        let token = thread_token();

        // Reentrant path: we already own the lock, so no other thread can
        // change `owner` and a relaxed read is sufficient.
        if self.owner.load(Ordering::Relaxed) == token {
            // SAFETY: We own the lock; `depth` is ours alone.
            unsafe {
                *self.depth.get() += 1;
            }
            return RecursiveMutexGuard { mutex: self };
        }

        let mut spins = 0_u32;
        while self
            .owner
            .compare_exchange_weak(0, token, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Critical sections are short (a link splice or a ledger walk),
            // so spin briefly before yielding the time slice.
            if spins < 64 {
                spins = spins.wrapping_add(1);
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }

        // SAFETY: We just acquired the lock; `depth` is ours alone.
        unsafe {
            *self.depth.get() = 1;
        }
        RecursiveMutexGuard { mutex: self }
    }
}

impl std::fmt::Debug for RecursiveMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecursiveMutex")
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .finish()
    }
}

/// Guard returned by [`RecursiveMutex::lock()`]. Releases one level of
/// ownership on drop; the lock opens once the outermost guard is gone,
/// including on panic unwind paths.
pub(crate) struct RecursiveMutexGuard<'a> {
    mutex: &'a RecursiveMutex,
}

impl Drop for RecursiveMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: A live guard means the current thread owns the lock.
        let depth = unsafe {
            let depth = self.mutex.depth.get();
            *depth -= 1;
            *depth
        };

        if depth == 0 {
            self.mutex.owner.store(0, Ordering::Release);
        }
    }
}
