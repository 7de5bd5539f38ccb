//! Pluggable capabilities consumed by the tracker.
//!
//! Everything here is optional and defaults to inert. Capabilities are
//! injected once at configuration time through
//! [`Tracker::install_hooks()`](crate::Tracker::install_hooks) rather than
//! through global function-pointer variables, so tests can configure a local
//! tracker without touching process state.

use crate::classify::Classification;

/// Answers whether an address range is currently mapped and readable.
///
/// Object classification follows candidate method-table pointers out of the
/// tracked block into arbitrary memory; every such read is gated on this
/// capability. When no probe is installed the object test is skipped
/// entirely, because a wild read is not recoverable in-process.
pub trait MemoryProbe: Send + Sync {
    /// Whether `len` bytes starting at `address` may be read without
    /// faulting. False positives risk a crash during classification; false
    /// negatives merely degrade a report entry to a hex dump.
    fn is_readable(&self, address: usize, len: usize) -> bool;
}

/// Instance-level ignore predicate, consulted lazily at report time.
///
/// The predicate is never evaluated at allocation time because classifying a
/// block is expensive and reports are rare relative to allocations. Its
/// verdict is *sticky*: once a record has been ignored, its may-leak flag is
/// cleared and the predicate is never consulted again for that record, even
/// if it would answer differently later. Rely on this for performance; do
/// not rely on re-evaluation.
pub trait InstanceFilter: Send + Sync {
    /// Whether the allocation at `address` should be exempt from leak
    /// reporting. `classification` is the classifier's verdict for the
    /// block, which is usually what the decision hinges on.
    fn should_ignore(&self, address: usize, size: usize, classification: &Classification) -> bool;
}

/// Formats one captured stack frame into `out` as UTF-8.
///
/// Line-by-line protocol: a positive return is the number of bytes written
/// for the frame; `0` silently skips just this frame; a negative value
/// aborts formatting the remaining frames of this one trace. None of these
/// are errors.
pub trait FrameFormatter: Send + Sync {
    /// Renders the frame at return address `frame` into `out`, returning
    /// the byte count written, `0` to skip the frame, or a negative value
    /// to abort the rest of the trace.
    fn format_frame(&self, frame: usize, out: &mut [u8]) -> isize;
}

/// Captures up to `frames.len()` return addresses of the calling thread,
/// skipping `skip` innermost frames, and returns the number written.
///
/// A plain function pointer rather than a trait: it runs on the allocation
/// hot path and must not allocate.
pub type StackCapture = fn(skip: usize, frames: &mut [usize]) -> usize;

/// Type-kind ignore set: exempts whole classification kinds from leak
/// reporting. Checked lazily at report time with the same sticky semantics
/// as [`InstanceFilter`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KindFilter {
    /// Ignore records that classify as objects.
    pub objects: bool,
    /// Ignore records that classify as text buffers.
    pub text: bool,
    /// Ignore records the classifier could not identify.
    pub unknown: bool,
}

impl KindFilter {
    /// Ignores nothing.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            objects: false,
            text: false,
            unknown: false,
        }
    }

    pub(crate) fn ignores(&self, classification: &Classification) -> bool {
        match classification {
            Classification::Object(_) => self.objects,
            Classification::Text(_) => self.text,
            Classification::Unknown => self.unknown,
        }
    }
}

/// The full set of injected capabilities. Fields left at their defaults are
/// inert.
#[derive(Default)]
pub struct Hooks {
    /// Readable-memory capability backing the object classifier.
    pub memory_probe: Option<&'static dyn MemoryProbe>,
    /// Instance-level ignore predicate (sticky, evaluated at report time).
    pub instance_filter: Option<&'static dyn InstanceFilter>,
    /// Symbol formatter for captured stack frames.
    pub frame_formatter: Option<&'static dyn FrameFormatter>,
    /// Stack capture function used when the `call-stacks` feature is on.
    pub stack_capture: Option<StackCapture>,
    /// Classification kinds exempt from leak reporting.
    pub kind_filter: KindFilter,
    /// Invoked whenever a [`Session`](crate::Session) over this tracker is
    /// dropped, whether or not the session reports on drop.
    pub on_shutdown: Option<fn()>,
}

impl Hooks {
    /// The all-inert configuration every tracker starts with.
    #[must_use]
    pub const fn inert() -> Self {
        Self {
            memory_probe: None,
            instance_filter: None,
            frame_formatter: None,
            stack_capture: None,
            kind_filter: KindFilter::none(),
            on_shutdown: None,
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("memory_probe", &self.memory_probe.is_some())
            .field("instance_filter", &self.instance_filter.is_some())
            .field("frame_formatter", &self.frame_formatter.is_some())
            .field("stack_capture", &self.stack_capture.is_some())
            .field("kind_filter", &self.kind_filter)
            .field("on_shutdown", &self.on_shutdown.is_some())
            .finish()
    }
}
