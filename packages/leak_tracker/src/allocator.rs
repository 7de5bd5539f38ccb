//! The tracking allocator: a [`GlobalAlloc`] decorator that prefixes every
//! block with an [`AllocationRecord`] and keeps the tracker's ledger in
//! sync with every allocate/free/reallocate.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr;

use crate::record::{AllocationRecord, HEADER_SIZE, record_of};
use crate::tracker::Tracker;

/// Wraps any [`GlobalAlloc`] with leak tracking.
///
/// Every block handed out is inflated by a hidden header placed immediately
/// before the payload; callers see only the payload pointer, so the wrapper
/// is a drop-in replacement for the inner allocator. Install it as the
/// global allocator or use an instance directly in tests.
///
/// # Examples
///
/// ```
/// use leak_tracker::Allocator;
///
/// #[global_allocator]
/// static ALLOC: Allocator<std::alloc::System> = Allocator::system();
///
/// fn main() {
///     let data = vec![1_u8, 2, 3];
///     assert!(ALLOC.tracker().allocation_count() > 0);
///     drop(data);
/// }
/// ```
pub struct Allocator<A: GlobalAlloc> {
    inner: A,
    tracker: Tracker,
}

impl Allocator<System> {
    /// A tracking wrapper around the system allocator.
    #[must_use]
    pub const fn system() -> Self {
        Self::new(System)
    }
}

impl<A: GlobalAlloc> Allocator<A> {
    /// Wraps `inner` with a fresh tracker.
    #[must_use]
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            tracker: Tracker::new(),
        }
    }

    /// The tracker recording this allocator's live blocks.
    #[must_use]
    pub const fn tracker(&self) -> &Tracker {
        &self.tracker
    }
}

impl<A: GlobalAlloc> std::fmt::Debug for Allocator<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

/// The header-and-padding distance from the start of the underlying block
/// to the payload, for a payload with the given alignment requirement.
///
/// Invariants: the payload lands on a `layout.align()` boundary, and the
/// record (at payload minus [`HEADER_SIZE`]) lands on its own alignment
/// boundary.
fn block_offset(payload_align: usize) -> usize {
    HEADER_SIZE.next_multiple_of(payload_align.max(align_of::<AllocationRecord>()))
}

/// The layout actually requested from the inner allocator, plus the payload
/// offset within it. `None` on arithmetic overflow, which the allocator
/// turns into an out-of-memory null return.
fn inflate(layout: Layout) -> Option<(Layout, usize)> {
    let align = layout.align().max(align_of::<AllocationRecord>());
    let offset = block_offset(layout.align());
    let size = offset.checked_add(layout.size())?;
    Layout::from_size_align(size, align).ok().map(|inflated| (inflated, offset))
}

// SAFETY: Delegates every operation to the inner allocator with an inflated
// layout; the returned payload pointer is `offset` bytes into a block of at
// least `offset + layout.size()` bytes, so it satisfies the caller's layout.
unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some((inflated, offset)) = inflate(layout) else {
            return ptr::null_mut();
        };
        // SAFETY: `inflated` has non-zero size (it includes the header).
        let base = unsafe { self.inner.alloc(inflated) };
        if base.is_null() {
            return base;
        }
        // SAFETY: `base` points at `inflated.size()` bytes, so the payload
        // at `offset` and the record right before it are in bounds and
        // suitably aligned (see `block_offset`).
        unsafe {
            let payload = base.add(offset);
            let record = record_of(payload);
            record.write(AllocationRecord::new(layout.size()));
            self.tracker.note_alloc(record);
            payload
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let Some((inflated, offset)) = inflate(layout) else {
            return ptr::null_mut();
        };
        // SAFETY: As in `alloc`.
        let base = unsafe { self.inner.alloc_zeroed(inflated) };
        if base.is_null() {
            return base;
        }
        // SAFETY: As in `alloc`. Writing the record over the zeroed header
        // area leaves the payload untouched.
        unsafe {
            let payload = base.add(offset);
            let record = record_of(payload);
            record.write(AllocationRecord::new(layout.size()));
            self.tracker.note_alloc(record);
            payload
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // `alloc` succeeded with this layout, so inflation cannot fail now.
        let Some((inflated, offset)) = inflate(layout) else {
            return;
        };
        // SAFETY: `ptr` came from `alloc` with the same layout, so the
        // record precedes it and `ptr - offset` is the block base.
        unsafe {
            let record = record_of(ptr);
            self.tracker.note_free(record);
            self.inner.dealloc(ptr.sub(offset), inflated);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some((old_inflated, offset)) = inflate(layout) else {
            return ptr::null_mut();
        };
        let Some(new_inflated_size) = offset.checked_add(new_size) else {
            return ptr::null_mut();
        };
        // The inner allocator's contract caps sizes at `isize::MAX`, just
        // like `alloc`; re-validating the inflated size enforces that bound
        // before the inner call.
        if Layout::from_size_align(new_inflated_size, old_inflated.align()).is_err() {
            return ptr::null_mut();
        }

        // One critical section for the whole move: the ledger never holds a
        // record whose block the inner allocator might be relocating.
        let guard = self.tracker.lock_state();
        // SAFETY: `ptr` came from `alloc` with this layout.
        unsafe {
            let record = record_of(ptr);
            let (was_linked, may_leak) = self.tracker.detach_for_realloc(record);

            let base = ptr.sub(offset);
            let new_base = self.inner.realloc(base, old_inflated, new_inflated_size);
            if new_base.is_null() {
                // The old block is still valid; put its record back the way
                // it was.
                if was_linked {
                    self.tracker.reattach_after_failed_realloc(record, may_leak);
                }
                drop(guard);
                return ptr::null_mut();
            }

            // The header moved with the block (the offset depends only on
            // the alignment, which realloc preserves), but its links are
            // stale. Rebuild it and re-register, inheriting the flag.
            let new_payload = new_base.add(offset);
            let new_record = record_of(new_payload);
            new_record.write(AllocationRecord::new(new_size));
            self.tracker.note_realloc(new_record, may_leak);
            drop(guard);
            new_payload
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn balanced_alloc_free_leaves_nothing_behind() {
        let allocator = Allocator::system();

        // SAFETY: Standard GlobalAlloc usage with matching layouts.
        unsafe {
            let a = allocator.alloc(layout(100, 8));
            let b = allocator.alloc(layout(28, 8));
            assert!(!a.is_null());
            assert!(!b.is_null());
            assert_eq!(allocator.tracker().allocation_count(), 2);
            assert_eq!(allocator.tracker().allocated_bytes(), 128);

            allocator.dealloc(a, layout(100, 8));
            allocator.dealloc(b, layout(28, 8));
        }
        assert_eq!(allocator.tracker().allocation_count(), 0);
        assert_eq!(allocator.tracker().allocated_bytes(), 0);
        assert!(allocator.tracker().verify_integrity());
    }

    #[test]
    fn payload_respects_large_alignments() {
        let allocator = Allocator::system();
        let big = layout(256, 64);

        // SAFETY: Standard GlobalAlloc usage with matching layouts.
        unsafe {
            let ptr = allocator.alloc(big);
            assert!(!ptr.is_null());
            assert_eq!(ptr.addr() % 64, 0);
            // The record sits right before the payload and is intact.
            assert!((*record_of(ptr)).canary_intact());
            allocator.dealloc(ptr, big);
        }
    }

    #[test]
    fn alloc_zeroed_zeroes_the_payload() {
        let allocator = Allocator::system();
        let shape = layout(64, 8);

        // SAFETY: Standard GlobalAlloc usage with matching layouts.
        unsafe {
            let ptr = allocator.alloc_zeroed(shape);
            assert!(!ptr.is_null());
            for index in 0..64 {
                assert_eq!(*ptr.add(index), 0);
            }
            assert_eq!(allocator.tracker().allocation_count(), 1);
            allocator.dealloc(ptr, shape);
        }
    }

    #[test]
    fn realloc_preserves_contents_and_tracking() {
        let allocator = Allocator::system();
        let shape = layout(16, 8);

        // SAFETY: Standard GlobalAlloc usage with matching layouts.
        unsafe {
            let ptr = allocator.alloc(shape);
            for index in 0..16 {
                *ptr.add(index) = u8::try_from(index).unwrap();
            }

            let grown = allocator.realloc(ptr, shape, 1024);
            assert!(!grown.is_null());
            for index in 0..16 {
                assert_eq!(*grown.add(index), u8::try_from(index).unwrap());
            }
            assert_eq!(allocator.tracker().allocation_count(), 1);
            assert_eq!(allocator.tracker().allocated_bytes(), 1024);
            assert!(allocator.tracker().verify_integrity());

            allocator.dealloc(grown, layout(1024, 8));
        }
        assert_eq!(allocator.tracker().allocation_count(), 0);
    }

    #[test]
    fn realloc_inherits_the_expected_leak_flag() {
        let allocator = Allocator::system();
        let shape = layout(32, 8);

        // SAFETY: Standard GlobalAlloc usage with matching layouts.
        unsafe {
            let ptr = allocator.alloc(shape);
            assert!(allocator.tracker().register_expected_leak(ptr.cast_const()));
            assert_eq!(allocator.tracker().allocation_count(), 0);

            let grown = allocator.realloc(ptr, shape, 64);
            assert!(!grown.is_null());
            // Still exempt after the move.
            assert_eq!(allocator.tracker().allocation_count(), 0);
            assert!(allocator.tracker().leaks(None).is_empty());

            allocator.dealloc(grown, layout(64, 8));
        }
    }

    #[test]
    fn snapshot_diff_through_the_real_allocator() {
        let allocator = Allocator::system();
        let shape = layout(48, 8);

        // SAFETY: Standard GlobalAlloc usage with matching layouts.
        unsafe {
            let before = allocator.alloc(shape);
            let snapshot = allocator.tracker().snapshot();
            let after = allocator.alloc(shape);

            let diff = allocator.tracker().leaks(Some(snapshot));
            assert_eq!(diff.len(), 1);
            assert_eq!(diff[0].address, after.addr());
            assert_eq!(diff[0].size, 48);

            allocator.dealloc(after, shape);
            allocator.dealloc(before, shape);
        }
    }

    #[test]
    fn oversized_request_returns_null() {
        let allocator = Allocator::system();
        // Valid on its own, but adding the header pushes the inflated size
        // past `isize::MAX`; that must surface as allocation failure rather
        // than a panic inside the allocator.
        let absurd = layout(usize::try_from(isize::MAX).unwrap() - 8, 8);

        // SAFETY: Standard GlobalAlloc usage.
        let ptr = unsafe { allocator.alloc(absurd) };
        assert!(ptr.is_null());
        assert_eq!(allocator.tracker().allocation_count(), 0);
    }

    #[test]
    fn oversized_realloc_fails_and_keeps_the_block() {
        let allocator = Allocator::system();
        let shape = layout(32, 8);
        // Fits in a `usize` even after inflation, but exceeds the
        // `isize::MAX` cap the inner allocator's contract imposes.
        let absurd = usize::try_from(isize::MAX).unwrap() - 8;

        // SAFETY: Standard GlobalAlloc usage with matching layouts.
        unsafe {
            let ptr = allocator.alloc(shape);
            assert!(!ptr.is_null());

            let grown = allocator.realloc(ptr, shape, absurd);
            assert!(grown.is_null());

            // Failed realloc leaves the original block live and tracked.
            assert_eq!(allocator.tracker().allocation_count(), 1);
            assert_eq!(allocator.tracker().allocated_bytes(), 32);
            allocator.dealloc(ptr, shape);
            assert_eq!(allocator.tracker().allocation_count(), 0);
        }
    }
}
