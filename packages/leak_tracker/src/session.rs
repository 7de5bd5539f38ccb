//! Scoped leak checking.
//!
//! A [`Session`] captures a baseline snapshot on creation and answers leak
//! queries relative to it, optionally printing a report when dropped. It is
//! the convenient front door for the common "nothing allocated inside this
//! scope may outlive it" pattern.

use crate::report::{ReportOptions, ReportSink, StdoutSink};
use crate::snapshot::Snapshot;
use crate::tracker::{Leak, Tracker};

/// A leak-checking scope over one tracker.
///
/// # Examples
///
/// ```
/// use leak_tracker::{Allocator, Session};
///
/// let allocator = Allocator::system();
/// let session = Session::new(allocator.tracker());
/// // ... exercise code using `allocator` directly ...
/// assert!(session.leaks().is_empty());
/// ```
#[derive(Debug)]
pub struct Session<'t> {
    tracker: &'t Tracker,
    baseline: Snapshot,
    report_on_drop: bool,
    options: ReportOptions,
}

impl<'t> Session<'t> {
    /// Opens a session, capturing the current allocation position as the
    /// baseline. Blocks already live at this point are outside the
    /// session's scope.
    #[must_use]
    pub fn new(tracker: &'t Tracker) -> Self {
        Self {
            tracker,
            baseline: tracker.snapshot(),
            report_on_drop: false,
            options: ReportOptions::default(),
        }
    }

    /// Requests a report to standard output when the session drops.
    #[must_use]
    pub fn report_on_drop(mut self, enabled: bool) -> Self {
        self.report_on_drop = enabled;
        self
    }

    /// Overrides the report formatting used on drop and by
    /// [`print_to_stdout()`](Self::print_to_stdout).
    #[must_use]
    pub fn with_options(mut self, options: ReportOptions) -> Self {
        self.options = options;
        self
    }

    /// The baseline snapshot this session diffs against.
    #[must_use]
    pub fn baseline(&self) -> Snapshot {
        self.baseline
    }

    /// Live post-baseline allocations that still count as potential leaks.
    ///
    /// # Panics
    ///
    /// Panics when the block marked by the baseline has been freed.
    #[must_use]
    pub fn leaks(&self) -> Vec<Leak> {
        self.tracker.leaks(Some(self.baseline))
    }

    /// Generates a report of this session's leaks into `sink`, returning
    /// the leak count.
    pub fn report_to(&self, sink: &mut dyn ReportSink) -> u64 {
        self.tracker.report(Some(self.baseline), sink, &self.options)
    }

    /// Prints this session's leak report to standard output, returning the
    /// leak count.
    #[cfg_attr(test, mutants::skip)] // Writes to stdout, hard to verify.
    pub fn print_to_stdout(&self) -> u64 {
        self.report_to(&mut StdoutSink)
    }
}

impl Drop for Session<'_> {
    // A session dropped during a panic with a freed baseline would panic
    // again and abort; keep session scopes tight and their baselines live.
    fn drop(&mut self) {
        if self.report_on_drop {
            self.print_to_stdout();
        }

        // The shutdown hook fires on every session drop, with or without a
        // final report.
        let guard = self.tracker.lock_state();
        // SAFETY: Lock held.
        let shutdown = unsafe { self.tracker.hooks_ref().on_shutdown };
        drop(guard);
        if let Some(callback) = shutdown {
            callback();
        }
    }
}
