//! The hidden allocation record prefixed to every tracked block.

use std::ptr;

/// Pattern written after the record fields. Purely diagnostic: reports warn
/// when it has been damaged (a likely buffer underrun of the user block) and
/// [`Tracker::register_expected_leak()`](crate::Tracker::register_expected_leak)
/// uses it to reject obviously-foreign pointers, but nothing else is ever
/// gated on it.
pub(crate) const CANARY: u64 = 0x4C45_4447_4552_4543; // "LEDGEREC"

/// Upper bound on the number of return addresses captured per allocation.
#[cfg(feature = "call-stacks")]
pub(crate) const MAX_CAPTURED_FRAMES: usize = 16;

/// Per-block metadata stored immediately before the user-visible payload.
///
/// The record is a member of the ledger's doubly linked list exactly while
/// its block is live and tracking was enabled at allocation time. `size == 0`
/// marks a tombstone: the block has been released and any further operation
/// against the record is a caller error.
#[repr(C)]
pub(crate) struct AllocationRecord {
    /// Previous ledger entry. Owned exclusively by the ledger.
    pub(crate) prev: *mut AllocationRecord,
    /// Next ledger entry. Owned exclusively by the ledger.
    pub(crate) next: *mut AllocationRecord,
    /// Payload bytes requested by the caller; excludes this header.
    pub(crate) size: usize,
    /// When false the record is excluded from leak counts and reports.
    pub(crate) may_leak: bool,
    /// Whether the record is currently spliced into the ledger. Records
    /// created while tracking is suspended or through the reentrancy bypass
    /// carry the header (so deallocation stays uniform) but are never linked.
    pub(crate) linked: bool,
    /// Number of meaningful entries in `frames`.
    #[cfg(feature = "call-stacks")]
    pub(crate) frame_count: u8,
    /// Return addresses captured at allocation time, innermost first.
    #[cfg(feature = "call-stacks")]
    pub(crate) frames: [usize; MAX_CAPTURED_FRAMES],
    canary: u64,
}

/// Bytes between a record and the payload it describes.
pub(crate) const HEADER_SIZE: usize = size_of::<AllocationRecord>();

impl AllocationRecord {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            size,
            may_leak: true,
            linked: false,
            #[cfg(feature = "call-stacks")]
            frame_count: 0,
            #[cfg(feature = "call-stacks")]
            frames: [0; MAX_CAPTURED_FRAMES],
            canary: CANARY,
        }
    }

    pub(crate) fn canary_intact(&self) -> bool {
        self.canary == CANARY
    }

    /// Whether the block described by this record has already been released.
    pub(crate) fn is_tombstone(&self) -> bool {
        self.size == 0
    }

    /// Marks the record as released. Only the tombstone test may look at the
    /// record afterwards.
    pub(crate) fn entomb(&mut self) {
        self.size = 0;
        self.linked = false;
        self.may_leak = false;
    }
}

// The two functions below are the entire unsafe boundary between user
// pointers and hidden records; the rest of the crate never does this
// arithmetic itself.

/// Returns the record describing `payload`.
///
/// # Safety
///
/// `payload` must be a pointer previously returned by the tracking allocator
/// and the block must not have been freed.
#[inline]
pub(crate) unsafe fn record_of(payload: *mut u8) -> *mut AllocationRecord {
    // SAFETY: The allocator placed the record exactly HEADER_SIZE bytes
    // below every payload it handed out, within the same underlying block.
    unsafe { payload.sub(HEADER_SIZE).cast::<AllocationRecord>() }
}

/// Returns the user-visible payload described by `record`.
///
/// # Safety
///
/// `record` must point at a live record embedded in a tracked block.
#[inline]
pub(crate) unsafe fn payload_of(record: *mut AllocationRecord) -> *mut u8 {
    // SAFETY: The payload directly follows the record within the same block.
    unsafe { record.cast::<u8>().add(HEADER_SIZE) }
}
