//! The allocation ledger: an intrusive doubly linked list of records.
//!
//! The list nodes are the hidden headers inside the tracked blocks
//! themselves, so the ledger needs no storage of its own. All structural
//! mutation happens under the tracker's recursive lock; this module only
//! provides the splicing primitives and trusts the caller for exclusion.

use std::ptr;

use crate::record::AllocationRecord;

/// Head/tail of the list of all currently-live, tracked allocation records.
/// Newest records are appended at the tail.
pub(crate) struct Ledger {
    head: *mut AllocationRecord,
    tail: *mut AllocationRecord,
}

// SAFETY: The raw pointers are only dereferenced under the tracker's lock,
// which serializes all access across threads.
unsafe impl Send for Ledger {}

impl Ledger {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub(crate) fn head(&self) -> *mut AllocationRecord {
        self.head
    }

    pub(crate) fn tail(&self) -> *mut AllocationRecord {
        self.tail
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Appends `record` at the tail in O(1).
    ///
    /// # Safety
    ///
    /// The caller must hold the tracker lock. `record` must be a live record
    /// that is not currently a member of any ledger.
    pub(crate) unsafe fn push_tail(&mut self, record: *mut AllocationRecord) {
        // SAFETY: `record` is live and exclusively ours to link while the
        // lock is held.
        unsafe {
            debug_assert!(!(*record).linked);
            (*record).prev = self.tail;
            (*record).next = ptr::null_mut();
            if self.tail.is_null() {
                self.head = record;
            } else {
                (*self.tail).next = record;
            }
            self.tail = record;
            (*record).linked = true;
        }
    }

    /// Unlinks `record` in O(1) using its stored neighbors; no search.
    ///
    /// # Safety
    ///
    /// The caller must hold the tracker lock. `record` must currently be a
    /// member of this ledger.
    pub(crate) unsafe fn unlink(&mut self, record: *mut AllocationRecord) {
        // SAFETY: Membership means prev/next are either null or valid live
        // records, all exclusively accessible under the lock.
        unsafe {
            debug_assert!((*record).linked);
            let prev = (*record).prev;
            let next = (*record).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev = prev;
            }
            (*record).prev = ptr::null_mut();
            (*record).next = ptr::null_mut();
            (*record).linked = false;
        }
    }

    /// Walks backward from the tail looking for `needle`.
    ///
    /// This is how snapshots are resolved: the engine has no forward index
    /// from an arbitrary historical pointer, and the marked record may have
    /// been freed (in which case it is simply absent).
    ///
    /// # Safety
    ///
    /// The caller must hold the tracker lock.
    pub(crate) unsafe fn contains(&self, needle: *const AllocationRecord) -> bool {
        let mut current = self.tail;
        while !current.is_null() {
            if ptr::eq(current, needle) {
                return true;
            }
            // SAFETY: Every list member is a live record under the lock.
            current = unsafe { (*current).prev };
        }
        false
    }

    /// Checks that the list is acyclic, bidirectionally consistent and that
    /// head/tail are null exactly when the ledger is empty. Returns the
    /// number of members on success.
    ///
    /// # Safety
    ///
    /// The caller must hold the tracker lock.
    pub(crate) unsafe fn check_consistency(&self) -> Option<usize> {
        if self.head.is_null() != self.tail.is_null() {
            return None;
        }

        let mut count = 0_usize;
        let mut previous: *mut AllocationRecord = ptr::null_mut();
        let mut current = self.head;
        // Cycle guard: a well-formed list reaches the tail before revisiting
        // a node, so cap the walk at a second traversal of the same length.
        let mut slow = self.head;
        let mut advance_slow = false;

        while !current.is_null() {
            // SAFETY: Members are live records under the lock.
            unsafe {
                if (*current).prev != previous || !(*current).linked {
                    return None;
                }
                previous = current;
                current = (*current).next;
            }
            count += 1;

            if advance_slow {
                // SAFETY: `slow` trails `current` and is a live member.
                slow = unsafe { (*slow).next };
            }
            advance_slow = !advance_slow;
            if !current.is_null() && ptr::eq(current, slow) {
                return None; // cycle
            }
        }

        if previous != self.tail {
            return None;
        }
        Some(count)
    }
}
