//! Example demonstrating the three exemption mechanisms: ignore blocks,
//! expected-leak registration and `mark_not_leaking` over a snapshot diff.

use std::alloc::System;
use std::mem;

use leak_tracker::{Allocator, Session};

#[global_allocator]
static ALLOCATOR: Allocator<System> = Allocator::system();

fn main() {
    let tracker = ALLOCATOR.tracker();
    let session = Session::new(tracker);

    // 1. Ignore block: everything allocated inside is exempt from the start.
    {
        let _scope = tracker.ignored();
        mem::forget(String::from("interned for the process lifetime"));
    }

    // 2. Expected leak: exempt one block after the fact.
    let cache: Vec<u8> = Vec::with_capacity(4096);
    // SAFETY: The pointer came from the global allocator and stays live.
    unsafe {
        assert!(tracker.register_expected_leak(cache.as_ptr()));
    }
    mem::forget(cache);

    // 3. Snapshot diff: silence everything a noisy phase allocated.
    let before_init = tracker.snapshot();
    mem::forget(vec![1_u8, 2, 3]); // Stands in for framework startup.
    tracker.mark_not_leaking(Some(before_init));

    // All three exemptions applied, the session is clean.
    assert!(session.leaks().is_empty());
    println!("No leaks reported; all intentional retentions were exempted.");
}
