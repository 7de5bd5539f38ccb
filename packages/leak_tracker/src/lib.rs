//! Leak detection for heap allocations.
//!
//! This package wraps any memory allocator with a ledger of live
//! allocations, so that at any point (typically process or test exit) the
//! still-allocated blocks can be enumerated, classified and reported.
//!
//! The core functionality includes:
//! - [`Allocator`] - A memory allocator wrapper that records every live block
//! - [`Tracker`] - The ledger: counters, snapshots, leak queries and reports
//! - [`Snapshot`] - A point in allocation history to diff against
//! - [`Session`] - A scoped leak check with optional report-on-drop
//! - [`Hooks`] - Optional capabilities: memory probe, ignore predicates,
//!   stack capture and frame formatting
//!
//! This package is a development and test tool, not a production hardening
//! layer.
//!
//! # Simple Usage
//!
//! Install the tracking allocator and check a scope for leaks:
//!
//! ```
//! use leak_tracker::{Allocator, Session};
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn main() {
//!     let session = Session::new(ALLOCATOR.tracker());
//!
//!     let data = vec![1, 2, 3, 4, 5];
//!     drop(data); // Freed, so it will not be reported.
//!
//!     assert!(session.leaks().is_empty());
//! }
//! ```
//!
//! # Snapshots and expected leaks
//!
//! Finer-grained control goes through the [`Tracker`] directly:
//!
//! ```
//! use leak_tracker::{Allocator, Session};
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn main() {
//!     let tracker = ALLOCATOR.tracker();
//!     let snapshot = tracker.snapshot();
//!
//!     let cache: Vec<u8> = Vec::with_capacity(64);
//!     // The cache is intentionally immortal; exempt its buffer.
//!     // SAFETY: The pointer came from this allocator and is live.
//!     unsafe {
//!         assert!(tracker.register_expected_leak(cache.as_ptr()));
//!     }
//!     std::mem::forget(cache);
//!
//!     assert!(tracker.leaks(Some(snapshot)).is_empty());
//! }
//! ```
//!
//! # Ignore blocks
//!
//! Allocations made inside an ignore block are exempt from the start:
//!
//! ```
//! use leak_tracker::Allocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn main() {
//!     let tracker = ALLOCATOR.tracker();
//!     let snapshot = tracker.snapshot();
//!
//!     {
//!         let _scope = tracker.ignored();
//!         std::mem::forget(String::from("intentional"));
//!     }
//!
//!     assert!(tracker.leaks(Some(snapshot)).is_empty());
//! }
//! ```
//!
//! # Overhead
//!
//! Every allocation gains a fixed-size hidden header and a short critical
//! section on a process-wide lock. This is acceptable for tests and
//! diagnostic builds; it is not free.
//!
//! # Call stacks
//!
//! With the `call-stacks` feature enabled and a stack-capture capability
//! installed via [`Hooks`], each record stores the allocating call frames
//! and reports render them through the installed [`FrameFormatter`].
//!
//! # Miri compatibility
//!
//! Miri replaces the global allocator with its own logic, so you cannot
//! execute code that installs this allocator globally under Miri.

mod allocator;
mod classify;
mod hooks;
mod ledger;
mod probe;
mod record;
mod report;
mod session;
mod snapshot;
mod sync;
mod tracker;

pub use allocator::Allocator;
pub use classify::{
    Classification, MAX_TYPE_DEPTH, MAX_TYPE_NAME_LEN, TEXT_HEADER_SIZE, TextInfo, TypeName,
};
pub use hooks::{FrameFormatter, Hooks, InstanceFilter, KindFilter, MemoryProbe, StackCapture};
pub use probe::AlwaysReadable;
#[cfg(unix)]
pub use probe::PageMapProbe;
pub use report::{ReportOptions, ReportSink, StdoutSink};
pub use session::Session;
pub use snapshot::Snapshot;
pub use tracker::{IgnoreGuard, Leak, Tracker};
