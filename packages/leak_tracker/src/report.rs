//! Leak report generation.
//!
//! A report is a sequence of text lines pushed into a [`ReportSink`]. Line
//! text is assembled in a fixed stack buffer so report generation itself
//! performs no heap allocation beyond the reentrancy-bypassed scratch the
//! tracker already accounts for.

use std::fmt::{self, Write as _};

use crate::classify::{self, Classification};
use crate::record::payload_of;
use crate::snapshot::Snapshot;
use crate::tracker::{BypassGuard, Tracker};

/// Longest line a report will emit; longer content is truncated.
const LINE_CAPACITY: usize = 512;

/// Bytes of an unknown block shown in its hex dump.
const DUMP_MAX_BYTES: usize = 256;

/// Bytes per hex dump row.
const DUMP_ROW_BYTES: usize = 16;

/// Character units of a text block quoted in its report line.
const TEXT_PREVIEW_UNITS: usize = 64;

/// Divider opening a report when [`ReportOptions::with_separator`] is set.
const SEPARATOR: &str = "--------------------------------";

/// Receives report lines, one call per line, without trailing newlines.
pub trait ReportSink {
    /// Consumes one line of report text.
    fn line(&mut self, text: &str);
}

impl<F: FnMut(&str)> ReportSink for F {
    fn line(&mut self, text: &str) {
        self(text);
    }
}

/// A [`ReportSink`] that prints each line to standard output.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutSink;

impl ReportSink for StdoutSink {
    #[cfg_attr(test, mutants::skip)] // Writes to stdout, hard to verify.
    fn line(&mut self, text: &str) {
        println!("{text}");
    }
}

/// Formatting choices for a leak report.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct ReportOptions {
    /// Open the report with a dashed divider line, so repeated reports in
    /// the same output stream are distinguishable from one another.
    pub with_separator: bool,
    /// Emit the summary line even when no leaks were found.
    pub summary_when_clean: bool,
}

/// Fixed-capacity line assembly buffer. Content past the capacity is
/// silently dropped; a truncated report line beats an allocation inside
/// the reporting path.
struct LineBuf {
    bytes: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            bytes: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn as_str(&self) -> &str {
        // Only `write_str` appends, so the content is valid UTF-8 cut at a
        // character boundary.
        std::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }

    fn push_byte(&mut self, byte: u8) {
        if self.len < LINE_CAPACITY {
            self.bytes[self.len] = byte;
            self.len += 1;
        }
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.len;
        if s.len() <= room {
            self.bytes[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
            self.len += s.len();
        } else {
            // Truncate at a character boundary.
            let mut cut = room;
            while cut > 0 && !s.is_char_boundary(cut) {
                cut -= 1;
            }
            self.bytes[self.len..self.len + cut].copy_from_slice(&s.as_bytes()[..cut]);
            self.len += cut;
        }
        Ok(())
    }
}

impl Tracker {
    /// Generates a leak report for the allocations made after `since` (all
    /// of them when `since` is `None`), pushing lines into `sink`. Returns
    /// the number of leaks reported.
    ///
    /// Applies the same sticky filters as [`leaks()`](Tracker::leaks), then
    /// emits an opening divider when
    /// [`with_separator`](ReportOptions::with_separator) is set, a summary
    /// line, and one entry per leak: address, size,
    /// classification, a content preview or hex dump, captured call frames
    /// when available, and a warning for any record whose canary is
    /// damaged.
    ///
    /// # Panics
    ///
    /// Panics when `since` marks a block that has since been freed.
    pub fn report(
        &self,
        since: Option<Snapshot>,
        sink: &mut dyn ReportSink,
        options: &ReportOptions,
    ) -> u64 {
        let _bypass = BypassGuard::new();
        let _guard = self.lock_state();
        let mut line = LineBuf::new();

        // SAFETY: Lock held for the whole report; ledger members stay live.
        unsafe {
            let ledger = self.ledger_ref();
            let start = self.resolve_start(ledger, since);

            // First walk: totals for the summary. This is also where sticky
            // filters run, so the second walk sees a settled leak set.
            let mut count = 0_u64;
            let mut bytes = 0_u64;
            let mut current = start;
            while !current.is_null() {
                if self.leak_classification(current).is_some() {
                    count += 1;
                    let size: u64 = (*current).size.try_into().expect("usize always fits into u64");
                    bytes += size;
                }
                current = (*current).next;
            }

            if count == 0 {
                if options.summary_when_clean {
                    if options.with_separator {
                        sink.line(SEPARATOR);
                    }
                    sink.line("No memory leaks detected.");
                }
                return 0;
            }

            if options.with_separator {
                sink.line(SEPARATOR);
            }
            line.clear();
            let _ = write!(line, "{count} memory leak(s) detected, {bytes} byte(s) total:");
            sink.line(line.as_str());

            // Second walk: one entry per surviving leak.
            let mut index = 0_u64;
            let mut current = start;
            while !current.is_null() {
                if let Some(classification) = self.leak_classification(current) {
                    index += 1;
                    let payload = payload_of(current);
                    line.clear();
                    let _ = write!(
                        line,
                        "#{index}: {:#x}, {} byte(s): ",
                        payload.addr(),
                        (*current).size,
                    );
                    describe(&mut line, payload, &classification);
                    sink.line(line.as_str());

                    if !(*current).canary_intact() {
                        line.clear();
                        let _ = write!(
                            line,
                            "  WARNING: allocation record at {:#x} is damaged",
                            current.addr(),
                        );
                        sink.line(line.as_str());
                    }

                    if matches!(classification, Classification::Unknown) {
                        dump_payload(sink, &mut line, payload, (*current).size);
                    }

                    #[cfg(feature = "call-stacks")]
                    self.report_frames(current, sink, &mut line);
                }
                current = (*current).next;
            }

            // First-walk count; the second walk reported the same set
            // because sticky filter decisions were already applied.
            count
        }
    }

    /// Emits the captured allocation frames of one record through the
    /// installed frame formatter, honoring its skip/abort protocol.
    #[cfg(feature = "call-stacks")]
    unsafe fn report_frames(
        &self,
        record: *const crate::record::AllocationRecord,
        sink: &mut dyn ReportSink,
        line: &mut LineBuf,
    ) {
        // SAFETY: Caller holds the lock and vouches for the record.
        unsafe {
            let Some(formatter) = self.hooks_ref().frame_formatter else {
                return;
            };
            let frame_count = usize::from((*record).frame_count);
            for frame in &(*record).frames[..frame_count] {
                line.clear();
                let mut text = [0_u8; LINE_CAPACITY];
                let written = formatter.format_frame(*frame, &mut text);
                if written < 0 {
                    break;
                }
                if written == 0 {
                    continue;
                }
                let written = usize::try_from(written)
                    .expect("positive isize fits into usize")
                    .min(text.len());
                let _ = write!(line, "  at ");
                let _ = line.write_str(&String::from_utf8_lossy(&text[..written]));
                sink.line(line.as_str());
            }
        }
    }
}

/// Appends the one-line description of a classified block.
unsafe fn describe(line: &mut LineBuf, payload: *const u8, classification: &Classification) {
    match classification {
        Classification::Object(name) => {
            let _ = write!(line, "instance of {name}");
        }
        Classification::Text(info) => {
            let width_bits = info.elem_width * 8;
            let _ = write!(
                line,
                "{width_bits}-bit text, {} unit(s), refcount {}: \"",
                info.chars, info.refcount,
            );
            let shown = (info.chars as usize).min(TEXT_PREVIEW_UNITS);
            for index in 0..shown {
                // SAFETY: `info` came from a successful classification of
                // this live payload.
                let unit = unsafe { classify::text_unit(payload, info, index) };
                line.push_byte(unit);
            }
            if (info.chars as usize) > shown {
                let _ = line.write_str("\"...");
            } else {
                let _ = line.write_str("\"");
            }
        }
        Classification::Unknown => {
            let _ = line.write_str("unknown content");
        }
    }
}

/// Hex dump of the first bytes of an unclassified block, 16 bytes per row
/// with an ASCII gutter.
unsafe fn dump_payload(sink: &mut dyn ReportSink, line: &mut LineBuf, payload: *const u8, size: usize) {
    let shown = size.min(DUMP_MAX_BYTES);
    for row_start in (0..shown).step_by(DUMP_ROW_BYTES) {
        let row_end = (row_start + DUMP_ROW_BYTES).min(shown);
        line.clear();
        let _ = write!(line, "  {row_start:06x}  ");
        for offset in row_start..row_end {
            // SAFETY: `offset < size`, in bounds of the live payload.
            let byte = unsafe { payload.add(offset).read() };
            let _ = write!(line, "{byte:02x} ");
        }
        for _ in row_end..row_start + DUMP_ROW_BYTES {
            let _ = line.write_str("   ");
        }
        let _ = line.write_str(" |");
        for offset in row_start..row_end {
            // SAFETY: As above.
            let byte = unsafe { payload.add(offset).read() };
            line.push_byte(if (0x20..=0x7E).contains(&byte) { byte } else { b'.' });
        }
        let _ = line.write_str("|");
        sink.line(line.as_str());
    }
    if size > DUMP_MAX_BYTES {
        line.clear();
        let _ = write!(line, "  ... {} more byte(s)", size - DUMP_MAX_BYTES);
        sink.line(line.as_str());
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Write as _;

    use super::*;

    #[test]
    fn line_buf_truncates_without_panicking() {
        let mut buf = LineBuf::new();
        let long = "x".repeat(LINE_CAPACITY * 2);
        let _ = buf.write_str(&long);
        assert_eq!(buf.as_str().len(), LINE_CAPACITY);

        buf.clear();
        let _ = write!(buf, "value: {}", 42);
        assert_eq!(buf.as_str(), "value: 42");
    }

    #[test]
    fn line_buf_truncates_at_character_boundaries() {
        let mut buf = LineBuf::new();
        // Fill to one byte below capacity, then append a multi-byte char.
        let _ = buf.write_str(&"x".repeat(LINE_CAPACITY - 1));
        let _ = buf.write_str("é");
        // The two-byte character does not fit; nothing partial is kept.
        assert_eq!(buf.as_str().len(), LINE_CAPACITY - 1);
    }

    #[test]
    fn closures_are_sinks() {
        let mut seen = Vec::new();
        let mut sink = |text: &str| seen.push(text.to_string());
        ReportSink::line(&mut sink, "hello");
        assert_eq!(seen, ["hello"]);
    }

    #[test]
    fn separator_opens_each_report_exactly_once() {
        use std::alloc::{GlobalAlloc, Layout};

        use crate::Allocator;

        let allocator = Allocator::system();
        let shape = Layout::from_size_align(24, 8).unwrap();

        // SAFETY: Standard GlobalAlloc usage with matching layouts.
        unsafe {
            let block = allocator.alloc_zeroed(shape);

            let options = ReportOptions {
                with_separator: true,
                ..ReportOptions::default()
            };
            let mut lines = Vec::new();
            let mut sink = |text: &str| lines.push(text.to_string());
            allocator.tracker().report(None, &mut sink, &options);
            allocator.tracker().report(None, &mut sink, &options);

            // One divider per report, not one per entry: back-to-back
            // reports in the same stream stay distinguishable.
            assert_eq!(
                lines.iter().filter(|text| text.as_str() == SEPARATOR).count(),
                2
            );
            assert_eq!(lines[0], SEPARATOR);
            assert!(lines[1].contains("1 memory leak(s)"));

            allocator.dealloc(block, shape);
        }
    }

    #[test]
    fn hex_dump_rows_are_shaped_correctly() {
        let data: Vec<u8> = (0..40).collect();
        let mut lines = Vec::new();
        let mut buf = LineBuf::new();
        let mut sink = |text: &str| lines.push(text.to_string());
        // SAFETY: `data` is a live readable buffer of the stated size.
        unsafe {
            dump_payload(&mut sink, &mut buf, data.as_ptr(), data.len());
        }
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("  000000  00 01 02"));
        assert!(lines[0].ends_with('|'));
        // The last, partial row is padded so the gutters line up.
        assert_eq!(lines[1].len(), lines[2].len());
    }

    #[test]
    fn hex_dump_is_bounded() {
        let data = vec![0xAB_u8; DUMP_MAX_BYTES * 2];
        let mut lines = Vec::new();
        let mut buf = LineBuf::new();
        let mut sink = |text: &str| lines.push(text.to_string());
        // SAFETY: `data` is a live readable buffer of the stated size.
        unsafe {
            dump_payload(&mut sink, &mut buf, data.as_ptr(), data.len());
        }
        assert_eq!(lines.len(), DUMP_MAX_BYTES / DUMP_ROW_BYTES + 1);
        assert!(lines.last().unwrap().contains("more byte(s)"));
    }
}
