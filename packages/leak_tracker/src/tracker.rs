//! The tracking engine: ledger, counters, ignore machinery and snapshots.
//!
//! A [`Tracker`] is the single source of truth for "what is currently
//! allocated". It is a const-constructible service object rather than a
//! module-level singleton: the allocator embeds one, and tests construct
//! their own local instances.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::classify::{self, Classification};
use crate::hooks::Hooks;
use crate::ledger::Ledger;
use crate::record::{AllocationRecord, payload_of, record_of};
use crate::snapshot::Snapshot;
use crate::sync::{RecursiveMutex, RecursiveMutexGuard};

pub(crate) const ERR_STALE_SNAPSHOT: &str =
    "snapshot refers to an allocation that has since been freed; \
     a snapshot must not outlive the block it marks";

const ERR_UNBALANCED_IGNORE: &str = "end_ignore() called without a matching begin_ignore()";

/// Frames to drop from captured stacks so traces start at the caller of the
/// allocator rather than inside the tracking machinery.
#[cfg(feature = "call-stacks")]
const STACK_SKIP_FRAMES: usize = 2;

thread_local! {
    // Reentrancy bypass. While non-zero, this thread's allocations carry
    // headers but are never linked into the ledger, so leak queries and
    // reports can use ordinary collections for their own scratch memory
    // without deadlocking or polluting the data they are reading.
    static BYPASS_DEPTH: Cell<u32> = const { Cell::new(0) };
}

pub(crate) fn bypass_active() -> bool {
    BYPASS_DEPTH.with(|depth| depth.get() != 0)
}

/// Scoped reentrancy bypass for the current thread.
pub(crate) struct BypassGuard(());

impl BypassGuard {
    pub(crate) fn new() -> Self {
        BYPASS_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self(())
    }
}

impl Drop for BypassGuard {
    fn drop(&mut self) {
        BYPASS_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// One entry of a programmatic leak query: the still-live block's address
/// and requested size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct Leak {
    /// Address of the user-visible block.
    pub address: usize,
    /// Payload bytes originally requested.
    pub size: usize,
}

/// Tracks every live allocation made through an
/// [`Allocator`](crate::Allocator) and answers leak queries against it.
///
/// All structural state (the ledger and the installed hooks) lives behind
/// one process-wide recursive lock; the aggregate counters are additionally
/// atomic so a summary read never observes a torn update.
pub struct Tracker {
    lock: RecursiveMutex,
    ledger: UnsafeCell<Ledger>,
    hooks: UnsafeCell<Hooks>,
    /// Count of ledger members with the may-leak flag set.
    live_count: AtomicU64,
    /// Sum of sizes of ledger members with the may-leak flag set.
    live_bytes: AtomicU64,
    /// Non-zero while inside an ignore block; new records then start with
    /// the may-leak flag cleared.
    ignore_depth: AtomicUsize,
    /// The suspend/resume switch. While false, allocations still carry
    /// headers but do not participate in the ledger. Not safe to toggle
    /// while other threads allocate; intended for single-threaded teardown
    /// or diagnostic windows.
    enabled: AtomicBool,
}

// SAFETY: The `UnsafeCell` fields are only accessed while holding `lock`;
// everything else is atomic.
unsafe impl Send for Tracker {}
// SAFETY: See above.
unsafe impl Sync for Tracker {}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    /// Creates an empty tracker with tracking enabled and all hooks inert.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: RecursiveMutex::new(),
            ledger: UnsafeCell::new(Ledger::new()),
            hooks: UnsafeCell::new(Hooks::inert()),
            live_count: AtomicU64::new(0),
            live_bytes: AtomicU64::new(0),
            ignore_depth: AtomicUsize::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Number of live allocations currently counting as potential leaks.
    #[must_use]
    pub fn allocation_count(&self) -> u64 {
        // Relaxed is sufficient: we only need atomicity, not ordering
        // relative to other memory operations.
        self.live_count.load(Ordering::Relaxed)
    }

    /// Total payload bytes of live allocations counting as potential leaks.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Replaces the installed capabilities.
    ///
    /// Intended to be called once during startup, before reports are
    /// requested; later calls are permitted and take effect for subsequent
    /// queries.
    pub fn install_hooks(&self, hooks: Hooks) {
        let _guard = self.lock.lock();
        // SAFETY: Hook storage is only touched under the lock.
        unsafe {
            *self.hooks.get() = hooks;
        }
    }

    /// Captures the current position in allocation history.
    ///
    /// O(1): the snapshot is the ledger tail. Diffing against it later
    /// enumerates exactly the allocations made after this call, provided the
    /// block the snapshot marks is still live at that point (freeing it
    /// makes later use of the snapshot a fatal usage error).
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let _guard = self.lock.lock();
        // SAFETY: Lock held.
        let tail = unsafe { (*self.ledger.get()).tail() };
        Snapshot {
            record: tail.cast_const(),
        }
    }

    /// Suspends ledger participation process-wide. See the field note on
    /// `enabled`: single-threaded windows only.
    pub fn suspend(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Re-enables ledger participation after [`suspend()`](Self::suspend).
    pub fn resume(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Whether allocations are currently being tracked.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enters an ignore block: allocations made while the returned guard is
    /// live start with their may-leak flag cleared and never appear in leak
    /// reports.
    ///
    /// The depth counter is process-wide. Nesting is fine within one
    /// logical operation; interleaving ignore blocks from multiple threads
    /// is a caller error, as with the raw
    /// [`begin_ignore()`](Self::begin_ignore) /
    /// [`end_ignore()`](Self::end_ignore) pair.
    #[must_use]
    pub fn ignored(&self) -> IgnoreGuard<'_> {
        self.begin_ignore();
        IgnoreGuard { tracker: self }
    }

    /// Raw counterpart of [`ignored()`](Self::ignored): increments the
    /// ignore-block depth.
    pub fn begin_ignore(&self) {
        self.ignore_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the ignore-block depth.
    ///
    /// # Panics
    ///
    /// Panics when called more often than [`begin_ignore()`](Self::begin_ignore).
    pub fn end_ignore(&self) {
        // Decrement only when the depth is non-zero, so an unbalanced call
        // panics without wrapping the counter and swallowing every
        // allocation made afterwards.
        let balanced = self
            .ignore_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| {
                depth.checked_sub(1)
            })
            .is_ok();
        assert!(balanced, "{ERR_UNBALANCED_IGNORE}");
    }

    /// Returns the live allocations made after `since` (or all of them when
    /// `since` is `None`) that still count as potential leaks, oldest first.
    ///
    /// Lazy ignore predicates and the kind filter are applied here with
    /// their sticky semantics, exactly as a report would apply them.
    ///
    /// # Panics
    ///
    /// Panics when `since` marks a block that has since been freed.
    #[must_use]
    pub fn leaks(&self, since: Option<Snapshot>) -> Vec<Leak> {
        let _bypass = BypassGuard::new();
        let _guard = self.lock.lock();
        let mut result = Vec::new();
        // SAFETY: Lock held; records stay live for the duration.
        unsafe {
            let ledger = &*self.ledger.get();
            let mut current = self.resolve_start(ledger, since);
            while !current.is_null() {
                if self.leak_classification(current).is_some() {
                    result.push(Leak {
                        address: payload_of(current).addr(),
                        size: (*current).size,
                    });
                }
                current = (*current).next;
            }
        }
        result
    }

    /// Clears the may-leak flag on every allocation made after `since` (all
    /// of them when `since` is `None`), adjusting the aggregate counters.
    /// The cleared records never appear in leak queries or reports again.
    ///
    /// # Panics
    ///
    /// Panics when `since` marks a block that has since been freed.
    pub fn mark_not_leaking(&self, since: Option<Snapshot>) {
        let _guard = self.lock.lock();
        // SAFETY: Lock held; records stay live for the duration.
        unsafe {
            let ledger = &*self.ledger.get();
            let mut current = self.resolve_start(ledger, since);
            while !current.is_null() {
                self.set_may_leak(current, false);
                current = (*current).next;
            }
        }
    }

    /// Exempts one allocation from leak accounting without requiring a
    /// snapshot, for intentionally-retained blocks known only at the call
    /// site. Returns false when the pointer does not look like it came from
    /// this allocator (damaged or missing record canary); that rejection is
    /// best-effort, not a guarantee.
    ///
    /// # Safety
    ///
    /// `payload` must be a pointer returned by the tracking allocator whose
    /// block has not been freed.
    pub unsafe fn register_expected_leak(&self, payload: *const u8) -> bool {
        // SAFETY: Per function contract.
        unsafe { self.toggle_expected_leak(payload, false) }
    }

    /// Undoes [`register_expected_leak()`](Self::register_expected_leak),
    /// restoring the block to the leak set.
    ///
    /// # Safety
    ///
    /// Same contract as [`register_expected_leak()`](Self::register_expected_leak).
    pub unsafe fn unregister_expected_leak(&self, payload: *const u8) -> bool {
        // SAFETY: Per function contract.
        unsafe { self.toggle_expected_leak(payload, true) }
    }

    unsafe fn toggle_expected_leak(&self, payload: *const u8, may_leak: bool) -> bool {
        let _guard = self.lock.lock();
        // SAFETY: Per the callers' contracts the record is live.
        unsafe {
            let record = record_of(payload.cast_mut());
            if !(*record).canary_intact() {
                return false;
            }
            self.set_may_leak(record, may_leak);
        }
        true
    }

    /// Runs the classifier against a live tracked block, using the
    /// installed memory probe.
    ///
    /// # Safety
    ///
    /// `payload` must be a pointer returned by the tracking allocator whose
    /// block has not been freed.
    #[must_use]
    pub unsafe fn classify_allocation(&self, payload: *const u8) -> Classification {
        let _guard = self.lock.lock();
        // SAFETY: Per function contract the record and its payload are live;
        // hooks are read under the lock.
        unsafe {
            let record = record_of(payload.cast_mut());
            let hooks = &*self.hooks.get();
            classify::classify(payload, (*record).size, hooks.memory_probe)
        }
    }

    /// Structural self-check for tests: the ledger must be acyclic and
    /// bidirectionally consistent, head/tail null exactly when empty, and
    /// the atomic counters must equal the count/sum of flagged members.
    #[must_use]
    pub fn verify_integrity(&self) -> bool {
        let _guard = self.lock.lock();
        // SAFETY: Lock held.
        unsafe {
            let ledger = &*self.ledger.get();
            if ledger.check_consistency().is_none() {
                return false;
            }

            let mut count = 0_u64;
            let mut bytes = 0_u64;
            let mut current = ledger.head();
            while !current.is_null() {
                if (*current).may_leak {
                    count += 1;
                    let size: u64 = (*current).size.try_into().expect("usize always fits into u64");
                    bytes += size;
                }
                current = (*current).next;
            }
            count == self.allocation_count() && bytes == self.allocated_bytes()
        }
    }

    // --- Entry points used by the allocator and the report generator ---

    pub(crate) fn lock_state(&self) -> RecursiveMutexGuard<'_> {
        self.lock.lock()
    }

    /// # Safety
    ///
    /// The caller must hold the tracker lock.
    pub(crate) unsafe fn ledger_ref(&self) -> &Ledger {
        // SAFETY: Lock held per contract.
        unsafe { &*self.ledger.get() }
    }

    /// # Safety
    ///
    /// The caller must hold the tracker lock.
    pub(crate) unsafe fn hooks_ref(&self) -> &Hooks {
        // SAFETY: Lock held per contract.
        unsafe { &*self.hooks.get() }
    }

    /// Registers a freshly initialized record for a new allocation.
    ///
    /// # Safety
    ///
    /// `record` must be a live, unlinked record embedded in a block just
    /// obtained from the underlying allocator.
    pub(crate) unsafe fn note_alloc(&self, record: *mut AllocationRecord) {
        // SAFETY: Per function contract.
        unsafe {
            self.link_record(record, true);
        }
    }

    /// Registers the surviving side of a reallocation. The replacement
    /// record inherits the old record's may-leak flag.
    ///
    /// # Safety
    ///
    /// As [`note_alloc()`](Self::note_alloc).
    pub(crate) unsafe fn note_realloc(&self, record: *mut AllocationRecord, was_may_leak: bool) {
        // SAFETY: Per function contract.
        unsafe {
            self.link_record(record, was_may_leak);
        }
    }

    unsafe fn link_record(&self, record: *mut AllocationRecord, may_leak_baseline: bool) {
        let guard = self.lock.lock();
        if !self.is_enabled() || bypass_active() {
            // The record keeps its header (deallocation stays uniform) but
            // never joins the ledger.
            // SAFETY: Record is live per caller contract.
            unsafe {
                (*record).may_leak = false;
            }
            drop(guard);
            return;
        }

        let may_leak = may_leak_baseline && self.ignore_depth.load(Ordering::Relaxed) == 0;
        // SAFETY: Lock held; record is live and unlinked per caller contract.
        unsafe {
            (*record).may_leak = may_leak;
            #[cfg(feature = "call-stacks")]
            self.capture_stack(record);
            (*self.ledger.get()).push_tail(record);
            if may_leak {
                self.counters_add((*record).size);
            }
        }
        drop(guard);
    }

    #[cfg(feature = "call-stacks")]
    unsafe fn capture_stack(&self, record: *mut AllocationRecord) {
        // SAFETY: Caller holds the lock and vouches for the record.
        unsafe {
            if let Some(capture) = (*self.hooks.get()).stack_capture {
                let frames = &mut (*record).frames;
                let written = capture(STACK_SKIP_FRAMES, frames).min(frames.len());
                (*record).frame_count =
                    u8::try_from(written).expect("frame count bounded by buffer length");
            }
        }
    }

    /// Removes the record of a block about to be freed and tombstones it.
    /// Must run before the underlying deallocation.
    ///
    /// # Safety
    ///
    /// `record` must be the live record of a block allocated through the
    /// tracking allocator, not yet freed.
    pub(crate) unsafe fn note_free(&self, record: *mut AllocationRecord) {
        let guard = self.lock.lock();
        // SAFETY: Lock held; record live per caller contract.
        unsafe {
            if (*record).linked {
                (*self.ledger.get()).unlink(record);
                if (*record).may_leak {
                    self.counters_sub((*record).size);
                }
            }
            (*record).entomb();
        }
        drop(guard);
    }

    /// Unlinks a record ahead of a reallocation attempt. Returns
    /// `(was_linked, may_leak)` so the caller can restore or inherit state.
    ///
    /// # Safety
    ///
    /// `record` must be live; the caller must hold the tracker lock across
    /// the whole reallocation so no window of inconsistent state is
    /// observable.
    pub(crate) unsafe fn detach_for_realloc(
        &self,
        record: *mut AllocationRecord,
    ) -> (bool, bool) {
        let _guard = self.lock.lock();
        // SAFETY: Lock held; record live per caller contract.
        unsafe {
            let may_leak = (*record).may_leak;
            let was_linked = (*record).linked;
            if was_linked {
                (*self.ledger.get()).unlink(record);
                if may_leak {
                    self.counters_sub((*record).size);
                }
            }
            (was_linked, may_leak)
        }
    }

    /// Restores a record detached by
    /// [`detach_for_realloc()`](Self::detach_for_realloc) after the
    /// underlying reallocation failed; the old block is still valid.
    ///
    /// # Safety
    ///
    /// As [`detach_for_realloc()`](Self::detach_for_realloc).
    pub(crate) unsafe fn reattach_after_failed_realloc(
        &self,
        record: *mut AllocationRecord,
        may_leak: bool,
    ) {
        let _guard = self.lock.lock();
        // SAFETY: Lock held; record live and unlinked per caller contract.
        unsafe {
            (*record).may_leak = may_leak;
            (*self.ledger.get()).push_tail(record);
            if may_leak {
                self.counters_add((*record).size);
            }
        }
    }

    /// Where a diff against `since` starts: the record after the snapshot
    /// position, or the ledger head for a null/missing snapshot.
    ///
    /// # Safety
    ///
    /// The caller must hold the tracker lock; `ledger` must be this
    /// tracker's ledger.
    pub(crate) unsafe fn resolve_start(
        &self,
        ledger: &Ledger,
        since: Option<Snapshot>,
    ) -> *mut AllocationRecord {
        match since {
            None => ledger.head(),
            Some(snapshot) if snapshot.record.is_null() => ledger.head(),
            Some(snapshot) => {
                let needle = snapshot.record;
                // Backward search from the tail: there is no forward index
                // from an arbitrary historical pointer, and absence means
                // the marked block was freed after the snapshot was taken.
                // SAFETY: Lock held per contract.
                assert!(unsafe { ledger.contains(needle) }, "{ERR_STALE_SNAPSHOT}");
                // SAFETY: `needle` was just confirmed to be a live member.
                unsafe { (*needle.cast_mut()).next }
            }
        }
    }

    /// Whether `record` currently counts as a leak and, if so, how it
    /// classifies. Applies the lazy kind filter and instance predicate with
    /// sticky semantics: an ignored record has its may-leak flag cleared so
    /// it is never classified again.
    ///
    /// # Safety
    ///
    /// The caller must hold the tracker lock; `record` must be a live
    /// ledger member.
    pub(crate) unsafe fn leak_classification(
        &self,
        record: *mut AllocationRecord,
    ) -> Option<Classification> {
        // SAFETY: Lock held; record live per caller contract.
        unsafe {
            if !(*record).may_leak || (*record).is_tombstone() {
                return None;
            }
            let hooks = &*self.hooks.get();
            let payload = payload_of(record);
            let classification = classify::classify(payload, (*record).size, hooks.memory_probe);

            let ignored = hooks.kind_filter.ignores(&classification)
                || hooks.instance_filter.is_some_and(|filter| {
                    filter.should_ignore(payload.addr(), (*record).size, &classification)
                });
            if ignored {
                // Sticky: the predicate is never consulted again for this
                // record.
                self.set_may_leak(record, false);
                return None;
            }
            Some(classification)
        }
    }

    /// Flips the may-leak flag, adjusting counters. Idempotent: no-op on a
    /// tombstone or when the flag already has the target value.
    ///
    /// # Safety
    ///
    /// `record` must point at a record created by this crate that has not
    /// been handed back to the underlying allocator.
    pub(crate) unsafe fn set_may_leak(&self, record: *mut AllocationRecord, value: bool) {
        let _guard = self.lock.lock();
        // SAFETY: Lock held; record accessible per caller contract.
        unsafe {
            if (*record).is_tombstone() || (*record).may_leak == value {
                return;
            }
            (*record).may_leak = value;
            if (*record).linked {
                if value {
                    self.counters_add((*record).size);
                } else {
                    self.counters_sub((*record).size);
                }
            }
        }
    }

    fn counters_add(&self, size: usize) {
        let size: u64 = size.try_into().expect("usize always fits into u64");
        self.live_count.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn counters_sub(&self, size: usize) {
        let size: u64 = size.try_into().expect("usize always fits into u64");
        self.live_count.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("allocation_count", &self.allocation_count())
            .field("allocated_bytes", &self.allocated_bytes())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Guard returned by [`Tracker::ignored()`]; closes the ignore block on
/// drop.
#[derive(Debug)]
pub struct IgnoreGuard<'a> {
    tracker: &'a Tracker,
}

impl Drop for IgnoreGuard<'_> {
    fn drop(&mut self) {
        self.tracker.end_ignore();
    }
}
