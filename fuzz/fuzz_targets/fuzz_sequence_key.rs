//! Fuzz target for queue sequence key parsing.

#![no_main]

use coordination_engine::queue::{parse_sequence_key, sequence_key};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|key: &str| {
    if let Some(sequence) = parse_sequence_key(key) {
        assert!(sequence >= 0);
        // Only canonical keys parse
        assert_eq!(sequence_key(sequence), key);
    }
});
