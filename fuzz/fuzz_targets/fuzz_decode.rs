//! Fuzz target for payload decoding.
//!
//! Stored payloads come from other processes and may be corrupt. Decoding
//! must fail cleanly, never panic.

#![no_main]

use coordination_engine::codec::{maybe_decompress, Codec, JsonCodec};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Should never panic, even with malformed zstd frames
    let _ = maybe_decompress(data);

    let codec = JsonCodec::<serde_json::Value>::new();
    if let Ok(value) = codec.decode(data) {
        // Whatever decodes must encode again
        let encoded = codec.encode(&value).expect("decoded value re-encodes");
        assert_eq!(encoded.hash.len(), 64);
    }
});
