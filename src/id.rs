//! Row identifiers.
//!
//! Every entity is keyed by a 64-bit unsigned integer (`AutoId`). The value
//! `0` means "unset"; generated values reserve the top 4 bits so embedding
//! applications can steal them for runtime tag tricks without colliding with
//! anything ormkit itself hands out.

use rand::Rng;

/// A row identifier. `0` is reserved for "unset" (see `OneRelation`/
/// `ManyRelation`, which use it to mean "no target").
pub type AutoId = u64;

/// Sentinel for "no id assigned yet".
pub const UNSET_ID: AutoId = 0;

/// Generate a fresh id: `rand(1..=u64::MAX) >> 4`.
///
/// Shifting right by 4 clears the top 4 bits, leaving headroom for an
/// embedding application's own tagging scheme while keeping the value
/// non-zero (`rand` never returns 0 here because the range excludes it, and
/// shifting a value `>= 1` right by 4 can only produce `0` if the original
/// value was `< 16`, which the sampling below avoids by re-rolling).
pub fn generate_id() -> AutoId {
    loop {
        let raw: u64 = rand::thread_rng().gen_range(1..=u64::MAX);
        let shifted = raw >> 4;
        if shifted != 0 {
            return shifted;
        }
    }
}

/// Whether an id is the "unset" sentinel.
pub fn is_unset(id: AutoId) -> bool {
    id == UNSET_ID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_nonzero_and_fit_60_bits() {
        for _ in 0..10_000 {
            let id = generate_id();
            assert_ne!(id, 0);
            assert_eq!(id & !(u64::MAX >> 4), 0, "top 4 bits must be clear");
        }
    }

    #[test]
    fn zero_is_unset() {
        assert!(is_unset(0));
        assert!(!is_unset(1));
    }
}
