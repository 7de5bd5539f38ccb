//! Opaque markers into allocation history.

use std::fmt;

use crate::record::AllocationRecord;

/// A point in allocation history, captured with
/// [`Tracker::snapshot()`](crate::Tracker::snapshot).
///
/// A snapshot is nothing but the ledger tail at capture time. It is cheap to
/// copy and carries no resources, but its later use is only valid while the
/// block it marks is still allocated: diffing against a snapshot whose block
/// has since been freed is a fatal usage error.
///
/// A snapshot taken while nothing was allocated diffs from the beginning of
/// history, exactly like passing `None` where an `Option<Snapshot>` is
/// accepted.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Snapshot {
    pub(crate) record: *const AllocationRecord,
}

// SAFETY: The pointer is used purely as a position marker; it is only
// compared against live ledger members (never dereferenced directly), so
// moving the value between threads is harmless.
unsafe impl Send for Snapshot {}
// SAFETY: See above.
unsafe impl Sync for Snapshot {}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("record", &self.record.addr())
            .finish()
    }
}
