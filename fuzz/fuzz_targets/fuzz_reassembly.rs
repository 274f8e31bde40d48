//! Fuzz target: `Reassembler::push`
//!
//! Splits the input into fragments (first byte of each run is its length)
//! and feeds them to a small reassembler. A completed command must always
//! fit below capacity, and the buffer must never fill.
//!
//! cargo fuzz run fuzz_reassembly

#![no_main]

use gatelink::transport::reassembly::{FragmentOutcome, Reassembler};
use libfuzzer_sys::fuzz_target;

const CAPACITY: usize = 256;

fuzz_target!(|data: &[u8]| {
    let mut reasm = Reassembler::new(CAPACITY, 5_000);
    let mut rest = data;
    let mut now = 0u64;

    while let Some((&len, tail)) = rest.split_first() {
        let take = usize::from(len).min(tail.len());
        let (fragment, next) = tail.split_at(take);
        rest = next;
        // Occasionally jump past the idle timeout.
        now += u64::from(len) * 40;

        if let FragmentOutcome::Complete(cmd) = reasm.push(fragment, now).outcome {
            assert!(!cmd.is_empty(), "empty command dispatched");
            assert!(cmd.len() < CAPACITY, "command exceeds buffer");
            assert_eq!(cmd.as_nul_terminated().last(), Some(&0));
        }
        assert!(reasm.len() < reasm.capacity());
    }

    assert!(reasm.discard() < CAPACITY);
    assert!(reasm.is_empty());
});
