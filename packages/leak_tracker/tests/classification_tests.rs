//! Integration tests for content classification and ignore filtering.
//!
//! The blocks under test come from a private `Allocator<System>` instance;
//! their payloads are shaped by hand into the recognized text and object
//! forms before the classifier looks at them.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr;

use leak_tracker::{
    Allocator, AlwaysReadable, Classification, Hooks, InstanceFilter, KindFilter, ReportOptions,
    TEXT_HEADER_SIZE,
};

static PROBE: AlwaysReadable = AlwaysReadable;

fn shape(size: usize) -> Layout {
    Layout::from_size_align(size, 8).unwrap()
}

/// Allocates a block and fills it with a narrow text buffer: refcount,
/// element width, unit count, reserved word, then the units and a zero
/// terminator.
fn alloc_text_block(allocator: &Allocator<System>, text: &str) -> (*mut u8, usize) {
    let size = TEXT_HEADER_SIZE + text.len() + 1;
    // SAFETY: Valid layout; all writes stay inside the fresh block.
    unsafe {
        let payload = allocator.alloc(shape(size));
        assert!(!payload.is_null());
        payload.cast::<u32>().write_unaligned(1); // refcount
        payload.add(4).cast::<u32>().write_unaligned(1); // element width
        payload
            .add(8)
            .cast::<u32>()
            .write_unaligned(u32::try_from(text.len()).unwrap());
        payload.add(12).cast::<u32>().write_unaligned(0); // reserved
        payload
            .add(TEXT_HEADER_SIZE)
            .copy_from_nonoverlapping(text.as_ptr(), text.len());
        payload.add(TEXT_HEADER_SIZE + text.len()).write(0);
        (payload, size)
    }
}

#[test]
fn text_blocks_classify_with_their_facts() {
    let allocator = Allocator::system();
    let (payload, size) = alloc_text_block(&allocator, "hello world");

    // SAFETY: `payload` is a live pointer from this allocator.
    let classification = unsafe { allocator.tracker().classify_allocation(payload) };
    match classification {
        Classification::Text(info) => {
            assert_eq!(info.elem_width, 1);
            assert_eq!(info.refcount, 1);
            assert_eq!(info.chars, 11);
        }
        other => panic!("expected text, got {other:?}"),
    }

    // SAFETY: Matching layout.
    unsafe {
        allocator.dealloc(payload, shape(size));
    }
}

#[test]
fn object_blocks_resolve_their_type_name() {
    let allocator = Allocator::system();
    allocator.tracker().install_hooks(Hooks {
        memory_probe: Some(&PROBE),
        ..Hooks::default()
    });

    // A hand-built method table: self-pointer, no parent, name pointer to a
    // length-prefixed ASCII identifier.
    let name: Vec<u8> = {
        let ident = b"TCustomerList";
        let mut buffer = vec![u8::try_from(ident.len()).unwrap()];
        buffer.extend_from_slice(ident);
        buffer
    };
    let mut table = Box::new([0_usize; 3]);
    let table_addr = ptr::from_ref(table.as_ref()).expose_provenance();
    table[0] = table_addr;
    table[1] = 0;
    table[2] = name.as_ptr().expose_provenance();

    // SAFETY: Valid layout; the first word of the block is initialized
    // before the classifier reads it.
    unsafe {
        let payload = allocator.alloc(shape(32));
        assert!(!payload.is_null());
        payload.cast::<usize>().write_unaligned(table_addr);

        let classification = allocator.tracker().classify_allocation(payload);
        assert_eq!(classification.type_name(), Some("TCustomerList"));

        allocator.dealloc(payload, shape(32));
    }
}

#[test]
fn untagged_blocks_are_unknown() {
    let allocator = Allocator::system();

    // SAFETY: Valid layout; payload is left as the allocator returned it
    // apart from a marker byte pattern.
    unsafe {
        let payload = allocator.alloc(shape(24));
        assert!(!payload.is_null());
        payload.write_bytes(0xC3, 24);

        let classification = allocator.tracker().classify_allocation(payload);
        assert_eq!(classification, Classification::Unknown);

        allocator.dealloc(payload, shape(24));
    }
}

#[test]
fn kind_filter_exempts_sticky() {
    let allocator = Allocator::system();
    allocator.tracker().install_hooks(Hooks {
        kind_filter: KindFilter {
            unknown: true,
            ..KindFilter::none()
        },
        ..Hooks::default()
    });

    // SAFETY: Valid layout, matching dealloc below.
    unsafe {
        let payload = allocator.alloc(shape(40));
        assert!(!payload.is_null());
        assert_eq!(allocator.tracker().allocation_count(), 1);

        // The filter runs at query time and clears the flag permanently.
        assert!(allocator.tracker().leaks(None).is_empty());
        assert_eq!(allocator.tracker().allocation_count(), 0);

        // Removing the filter does not resurrect the record.
        allocator.tracker().install_hooks(Hooks::default());
        assert!(allocator.tracker().leaks(None).is_empty());

        allocator.dealloc(payload, shape(40));
    }
}

struct IgnoreSpecificSize;

impl InstanceFilter for IgnoreSpecificSize {
    fn should_ignore(&self, _address: usize, size: usize, _kind: &Classification) -> bool {
        size == 77
    }
}

#[test]
fn instance_filter_picks_individual_blocks() {
    static FILTER: IgnoreSpecificSize = IgnoreSpecificSize;

    let allocator = Allocator::system();
    allocator.tracker().install_hooks(Hooks {
        instance_filter: Some(&FILTER),
        ..Hooks::default()
    });

    // SAFETY: Valid layouts, matching deallocs below.
    unsafe {
        let filtered = allocator.alloc(shape(77));
        let kept = allocator.alloc(shape(64));

        let leaks = allocator.tracker().leaks(None);
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].address, kept.addr());

        allocator.dealloc(filtered, shape(77));
        allocator.dealloc(kept, shape(64));
    }
}

#[test]
fn report_renders_summary_preview_and_dump() {
    let allocator = Allocator::system();
    let (text_payload, text_size) = alloc_text_block(&allocator, "report me");

    // SAFETY: Valid layout, matching dealloc below.
    unsafe {
        let unknown = allocator.alloc(shape(32));
        assert!(!unknown.is_null());
        unknown.write_bytes(0xAB, 32);

        let mut lines = Vec::new();
        let mut sink = |text: &str| lines.push(text.to_string());
        let reported =
            allocator
                .tracker()
                .report(None, &mut sink, &ReportOptions::default());

        assert_eq!(reported, 2);
        assert!(lines[0].contains("2 memory leak(s)"));
        assert!(lines.iter().any(|line| line.contains("\"report me\"")));
        assert!(lines.iter().any(|line| line.contains("unknown content")));
        // The unknown block gets a hex dump row.
        assert!(lines.iter().any(|line| line.contains("ab ab ab")));

        allocator.dealloc(unknown, shape(32));
        allocator.dealloc(text_payload, shape(text_size));
    }
}

#[test]
fn clean_report_stays_quiet_unless_asked() {
    let allocator = Allocator::system();

    let mut lines = Vec::new();
    let options = ReportOptions::default();
    assert_eq!(
        allocator
            .tracker()
            .report(None, &mut |text: &str| lines.push(text.to_string()), &options),
        0
    );
    assert!(lines.is_empty());

    let mut chatty = ReportOptions::default();
    chatty.summary_when_clean = true;
    assert_eq!(
        allocator
            .tracker()
            .report(None, &mut |text: &str| lines.push(text.to_string()), &chatty),
        0
    );
    assert_eq!(lines, ["No memory leaks detected."]);
}
