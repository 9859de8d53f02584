//! Key normalization and hashing shared by GROUP BY and join.
//!
//! Every key cell is widened to one `u64` word so that equal values of
//! different physical widths hash and compare equal. Hashing uses `ahash`
//! with fixed seeds, which keeps partitioning reproducible across runs.

use ahash::RandomState;

use crate::error::Result;
use crate::storage::{Column, ColumnData, NullMask};
use crate::types::DataType;

const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Returns the fixed-seed hasher.
pub(crate) fn hasher() -> RandomState {
    RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3])
}

#[inline]
pub(crate) fn combine(h: u64, word_hash: u64) -> u64 {
    (h.rotate_left(23) ^ word_hash).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// Canonical word of a float: `-0.0` folds onto `0.0` and every NaN onto one
/// bit pattern.
#[inline]
pub(crate) fn float_word(v: f64) -> u64 {
    if v == 0.0 {
        0
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

/// Key domain two columns must share to be compared word by word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyDomain {
    Int,
    Float,
    Symbol,
}

impl KeyDomain {
    pub(crate) fn of(data_type: DataType) -> Self {
        match data_type {
            DataType::F64 => KeyDomain::Float,
            DataType::Symbol => KeyDomain::Symbol,
            _ => KeyDomain::Int,
        }
    }

    /// Common domain of a join key pair, or None if the pair never matches.
    pub(crate) fn common(a: DataType, b: DataType) -> Option<Self> {
        match (KeyDomain::of(a), KeyDomain::of(b)) {
            (KeyDomain::Symbol, KeyDomain::Symbol) => Some(KeyDomain::Symbol),
            (KeyDomain::Symbol, _) | (_, KeyDomain::Symbol) => None,
            (KeyDomain::Float, _) | (_, KeyDomain::Float) => Some(KeyDomain::Float),
            _ => Some(KeyDomain::Int),
        }
    }
}

/// Widens every row of `column` to a key word in `domain`. Null rows get 0;
/// callers consult the null mask separately.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn key_words(column: &Column, domain: KeyDomain) -> Vec<u64> {
    match (column.data(), domain) {
        (ColumnData::Symbol(ids), _) => ids.to_ids(),
        (ColumnData::F64(v), _) => v.iter().map(|&x| float_word(x)).collect(),
        (_, KeyDomain::Float) => (0..column.len())
            .map(|i| float_word(column.f64_at(i)))
            .collect(),
        _ => (0..column.len()).map(|i| column.i64_at(i) as u64).collect(),
    }
}

/// Rebuilds a column of `data_type` from key words produced by
/// [`key_words`] in the type's own domain; rows flagged in `nulls` are null.
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn column_from_words(data_type: DataType, words: Vec<u64>, nulls: &[bool]) -> Result<Column> {
    let data = match data_type {
        DataType::F64 => ColumnData::F64(words.into_iter().map(f64::from_bits).collect()),
        other => ColumnData::from_i64(other, words.into_iter().map(|w| w as i64).collect()),
    };
    Column::new(data).with_nulls(NullMask::from_flags(nulls))
}

/// Hash of one row across several key word arrays.
#[inline]
pub(crate) fn row_hash(state: &RandomState, keys: &[Vec<u64>], row: usize) -> u64 {
    match keys {
        [only] => state.hash_one(only[row]),
        _ => keys
            .iter()
            .fold(0, |h, k| combine(h, state.hash_one(k[row]))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths_hash_equal() {
        let state = hasher();
        let a = key_words(&Column::from_i32(vec![7, -1]), KeyDomain::Int);
        let b = key_words(&Column::from_i64(vec![7, -1]), KeyDomain::Int);
        assert_eq!(a, b);
        assert_eq!(row_hash(&state, &[a], 1), row_hash(&state, &[b], 1));
    }

    #[test]
    fn test_negative_zero_folds() {
        assert_eq!(float_word(-0.0), float_word(0.0));
        assert_eq!(float_word(f64::NAN), float_word(-f64::NAN));
    }

    #[test]
    fn test_common_domain() {
        assert_eq!(KeyDomain::common(DataType::I32, DataType::F64), Some(KeyDomain::Float));
        assert_eq!(KeyDomain::common(DataType::Symbol, DataType::I64), None);
        let ints = key_words(&Column::from_i64(vec![2]), KeyDomain::Float);
        let floats = key_words(&Column::from_f64(vec![2.0]), KeyDomain::Float);
        assert_eq!(ints, floats);
    }

    #[test]
    fn test_words_round_trip_through_column() {
        let source = Column::from_symbols(&["x", "y"]);
        let words = key_words(&source, KeyDomain::Symbol);
        let rebuilt = column_from_words(DataType::Symbol, words, &[false, true]).unwrap();
        assert_eq!(rebuilt.get(0), source.get(0));
        assert!(rebuilt.is_null(1));
    }

    #[test]
    fn test_hasher_is_deterministic() {
        assert_eq!(hasher().hash_one(42u64), hasher().hash_one(42u64));
    }
}
