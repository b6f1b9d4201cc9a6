//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use coordination_engine::codec::{compute_content_hash, maybe_decompress, Codec, JsonCodec};
use coordination_engine::queue::{parse_sequence_key, sequence_key};
use coordination_engine::store::stream::compare_stream_ids;
use coordination_engine::store::KeyRange;
use proptest::prelude::*;
use std::cmp::Ordering;
use std::ops::Bound;

fn bound() -> impl Strategy<Value = Bound<String>> {
    prop_oneof![
        Just(Bound::Unbounded),
        "[a-e]{0,3}".prop_map(Bound::Included),
        "[a-e]{0,3}".prop_map(Bound::Excluded),
    ]
}

fn key_range() -> impl Strategy<Value = KeyRange> {
    (bound(), bound()).prop_map(|(lower, upper)| KeyRange::new(lower, upper))
}

// =============================================================================
// Sequence Key Properties
// =============================================================================

proptest! {
    /// Lexicographic order of sequence keys is numeric order
    #[test]
    fn sequence_key_preserves_order(a in 0i64..i64::MAX, b in 0i64..i64::MAX) {
        prop_assert_eq!(sequence_key(a).cmp(&sequence_key(b)), a.cmp(&b));
    }

    /// Every sequence key parses back to its number
    #[test]
    fn sequence_key_parses_back(n in 0i64..i64::MAX) {
        let key = sequence_key(n);
        prop_assert_eq!(key.len(), 20);
        prop_assert_eq!(parse_sequence_key(&key), Some(n));
    }

    /// Parsing never panics, and only canonical keys parse
    #[test]
    fn parse_sequence_key_accepts_only_canonical(s in "\\PC{0,24}") {
        if let Some(n) = parse_sequence_key(&s) {
            prop_assert_eq!(sequence_key(n), s);
        }
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    /// Decoding an encoded value yields the value, compressed or not
    #[test]
    fn codec_decodes_what_it_encodes(value in "\\PC{0,512}", threshold in 0usize..256) {
        for codec in [JsonCodec::<String>::new(), JsonCodec::with_compression(threshold)] {
            let encoded = codec.encode(&value).unwrap();
            prop_assert_eq!(codec.decode(&encoded.bytes).unwrap(), value.clone());
        }
    }

    /// The content hash depends on the value, not on compression
    #[test]
    fn content_hash_ignores_compression(value in "\\PC{0,512}") {
        let plain = JsonCodec::<String>::new().encode(&value).unwrap();
        let packed = JsonCodec::<String>::with_compression(0).encode(&value).unwrap();
        prop_assert_eq!(&plain.hash, &packed.hash);
        prop_assert_eq!(plain.hash.len(), 64);
    }

    /// Distinct values get distinct hashes
    #[test]
    fn content_hash_distinguishes_values(a in "\\PC{0,64}", b in "\\PC{0,64}") {
        prop_assume!(a != b);
        prop_assert_ne!(compute_content_hash(a.as_bytes()), compute_content_hash(b.as_bytes()));
    }

    /// Non-zstd bytes pass through untouched
    #[test]
    fn maybe_decompress_passes_plain_data(data in prop::collection::vec(any::<u8>(), 0..256)) {
        prop_assume!(data.len() < 4 || data[..4] != [0x28, 0xB5, 0x2F, 0xFD]);
        prop_assert_eq!(maybe_decompress(&data).unwrap(), data);
    }

    /// Decoding arbitrary bytes never panics
    #[test]
    fn decode_arbitrary_bytes_no_panic(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = JsonCodec::<serde_json::Value>::new().decode(&data);
    }
}

// =============================================================================
// Key Range Properties
// =============================================================================

proptest! {
    /// Empty ranges contain no key
    #[test]
    fn empty_range_contains_nothing(range in key_range(), key in "[a-e]{0,4}") {
        if range.is_empty() {
            prop_assert!(!range.contains(&key));
        }
    }

    /// `after(k)` keeps exactly the keys of the range above k
    #[test]
    fn after_is_range_above_key(range in key_range(), mark in "[a-e]{0,3}", key in "[a-e]{0,4}") {
        let expected = range.contains(&key) && key > mark;
        prop_assert_eq!(range.after(&mark).contains(&key), expected);
    }

    /// `after(k)` only ever narrows
    #[test]
    fn after_is_within_range(range in key_range(), mark in "[a-e]{0,3}") {
        prop_assert!(range.after(&mark).is_within(&range));
    }

    /// A range within another only holds keys the outer one holds
    #[test]
    fn within_implies_containment(inner in key_range(), outer in key_range(), key in "[a-e]{0,4}") {
        if inner.is_within(&outer) && inner.contains(&key) {
            prop_assert!(outer.contains(&key));
        }
    }

    /// Every range lies within the whole key space and within itself
    #[test]
    fn within_is_reflexive(range in key_range()) {
        prop_assert!(range.is_within(&range));
        prop_assert!(range.is_within(&KeyRange::all()));
    }
}

// =============================================================================
// Stream ID Comparison Properties
// =============================================================================

proptest! {
    /// Stream ID comparison is reflexive: a == a
    #[test]
    fn stream_id_comparison_reflexive(ts in 0u64..u64::MAX, seq in 0u64..1000u64) {
        let id = format!("{}-{}", ts, seq);
        prop_assert_eq!(compare_stream_ids(&id, &id), Ordering::Equal);
    }

    /// Stream ID comparison is antisymmetric: if a < b then b > a
    #[test]
    fn stream_id_comparison_antisymmetric(a in "\\PC{0,24}", b in "\\PC{0,24}") {
        prop_assert_eq!(compare_stream_ids(&a, &b).reverse(), compare_stream_ids(&b, &a));
    }

    /// Timestamp dominates, sequence breaks ties
    #[test]
    fn stream_id_orders_like_tuples(
        ts1 in 0u64..1_000_000_000_000u64,
        seq1 in 0u64..1000u64,
        ts2 in 0u64..1_000_000_000_000u64,
        seq2 in 0u64..1000u64,
    ) {
        let id1 = format!("{}-{}", ts1, seq1);
        let id2 = format!("{}-{}", ts2, seq2);
        prop_assert_eq!(compare_stream_ids(&id1, &id2), (ts1, seq1).cmp(&(ts2, seq2)));
    }
}
