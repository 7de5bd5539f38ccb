//! Example demonstrating basic leak detection.
//!
//! Installs the tracking allocator globally, deliberately leaks a couple of
//! allocations and prints the resulting report.

use std::alloc::System;
use std::mem;

use leak_tracker::{Allocator, Session};

#[global_allocator]
static ALLOCATOR: Allocator<System> = Allocator::system();

fn main() {
    let session = Session::new(ALLOCATOR.tracker());

    println!("=== Leak Tracker Example ===\n");

    // This one is freed, so it never shows up.
    let fine = vec![0_u8; 1024];
    drop(fine);

    // These two are leaked on purpose.
    mem::forget(String::from("I was never freed"));
    mem::forget(vec![0xAB_u8; 48]);

    let leaks = session.leaks();
    println!("Leaked allocations: {}", leaks.len());
    for leak in &leaks {
        println!("  {:#x}: {} byte(s)", leak.address, leak.size);
    }

    println!("\nFull report:");
    session.print_to_stdout();
}
