//! Property-based tests for ormkit
//!
//! These verify invariants that must hold for all inputs, covering the
//! crate's pure functions: search-text normalization, placeholder-list
//! generation, and scalar value conversion/ordering.
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// search text normalization
// ============================================================================

mod search_normalization_tests {
    use super::*;
    use ormkit::fts::normalize_for_search;

    proptest! {
        /// Invariant: normalize_for_search never panics on any string input.
        #[test]
        fn never_panics(s in ".*") {
            let _ = normalize_for_search(&s);
        }

        /// Invariant: normalizing is idempotent — once diacritics are folded
        /// (bar the six preserved letters) there is nothing left to fold.
        #[test]
        fn idempotent(s in "\\PC{0,100}") {
            let once = normalize_for_search(&s);
            let twice = normalize_for_search(&once);
            prop_assert_eq!(once, twice);
        }

        /// Invariant: normalizing pure ASCII text is a no-op.
        #[test]
        fn ascii_passes_through_unchanged(s in "[ -~]{0,100}") {
            prop_assert_eq!(normalize_for_search(&s), s);
        }

        /// Invariant: the output never contains a standalone Unicode
        /// combining mark — every mark was either attached to a preserved
        /// letter or stripped.
        #[test]
        fn output_has_no_bare_combining_marks(s in "\\PC{0,100}") {
            let normalized = normalize_for_search(&s);
            prop_assert!(!normalized.chars().any(unicode_normalization::char::is_combining_mark));
        }
    }
}

// ============================================================================
// IN-clause placeholder generation
// ============================================================================

mod question_marks_tests {
    use super::*;
    use ormkit::row::question_marks;

    proptest! {
        /// Invariant: for n > 0, the result is exactly n comma-joined `?`s.
        #[test]
        fn length_matches_count(n in 1usize..500) {
            let marks = question_marks(n);
            prop_assert_eq!(marks.split(',').count(), n);
            prop_assert!(marks.split(',').all(|p| p == "?"));
        }
    }

    #[test]
    fn zero_is_an_always_false_literal() {
        assert_eq!(question_marks(0), "''");
    }
}

// ============================================================================
// scalar value conversions and ordering
// ============================================================================

mod value_tests {
    use super::*;
    use ormkit::Value;

    proptest! {
        /// Invariant: every u64 round-trips through Value::UInt64, including
        /// values with the high bit set.
        #[test]
        fn uint64_round_trips(n in any::<u64>()) {
            let v = Value::UInt64(n);
            prop_assert_eq!(v.as_u64().unwrap(), n);
        }

        /// Invariant: every i64 round-trips through Value::Int64.
        #[test]
        fn int64_round_trips(n in any::<i64>()) {
            let v = Value::Int64(n);
            prop_assert_eq!(v.as_i64().unwrap(), n);
        }

        /// Invariant: every string round-trips through Value::Text.
        #[test]
        fn text_round_trips(s in "\\PC{0,200}") {
            let v = Value::Text(s.clone());
            prop_assert_eq!(v.as_text().unwrap(), s);
        }

        /// Invariant: same-tag UInt64 ordering matches the underlying u64
        /// ordering exactly.
        #[test]
        fn uint64_ordering_matches_native(a in any::<u64>(), b in any::<u64>()) {
            let ordering = Value::UInt64(a).cmp(&Value::UInt64(b));
            prop_assert_eq!(ordering, a.cmp(&b));
        }

        /// Invariant: a numeric Int64 and its decimal Text rendering compare
        /// equal under cross-tag coercion.
        #[test]
        fn int64_and_its_text_rendering_compare_equal(n in any::<i64>()) {
            let numeric = Value::Int64(n);
            let text = Value::Text(n.to_string());
            prop_assert_eq!(numeric.cmp(&text), std::cmp::Ordering::Equal);
        }

        /// Invariant: Value's Ord is consistent — cmp is antisymmetric.
        #[test]
        fn ordering_is_antisymmetric(a in any::<i64>(), b in any::<i64>()) {
            let va = Value::Int64(a);
            let vb = Value::Int64(b);
            prop_assert_eq!(va.cmp(&vb).reverse(), vb.cmp(&va));
        }
    }
}

// ============================================================================
// id generation
// ============================================================================

mod id_tests {
    use super::*;
    use ormkit::id::generate_id;

    proptest! {
        /// Invariant: generated ids are always non-zero and fit in 60 bits,
        /// for any number of repetitions.
        #[test]
        fn always_nonzero_and_fits_60_bits(_n in 0u8..32) {
            let id = generate_id();
            prop_assert_ne!(id, 0);
            prop_assert_eq!(id & !(u64::MAX >> 4), 0);
        }
    }
}
