//! Order-preserving key encoding.
//!
//! Every key is first mapped to a raw `u64` whose unsigned order equals the
//! value order (sign flip for integers, the IEEE-754 monotonic transform for
//! floats, a lexical rank for symbols). The raw words are then range
//! compressed, given a null slot and a direction, and packed into one
//! composite word when the widths allow.

use std::cmp::Ordering;

use rayon::prelude::*;

use crate::error::Result;
use crate::executor::context::ExecContext;
use crate::pool::MORSEL_SIZE;
use crate::storage::{symbol, Column, ColumnData, ColumnRef};

/// One evaluated sort key.
#[derive(Debug, Clone)]
pub(crate) struct SortColumn {
    pub(crate) column: ColumnRef,
    pub(crate) descending: bool,
    pub(crate) nulls_first: bool,
}

const SIGN: u64 = 1 << 63;

#[inline]
#[allow(clippy::cast_sign_loss)]
pub(crate) fn int_order(v: i64) -> u64 {
    (v as u64) ^ SIGN
}

/// Monotonic transform of a float. `-0.0` equals `0.0` and NaN sorts above
/// every number.
#[inline]
pub(crate) fn float_order(v: f64) -> u64 {
    if v.is_nan() {
        return u64::MAX;
    }
    let bits = if v == 0.0 { 0 } else { v.to_bits() };
    if bits & SIGN != 0 {
        !bits
    } else {
        bits | SIGN
    }
}

/// Maps each distinct symbol id of `ids` to its rank in lexical order.
fn symbol_ranks(ids: &[u64]) -> Vec<(u64, u64)> {
    let mut distinct = ids.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    let dict = symbol::global().read();
    let mut by_text: Vec<(u64, &str)> = distinct
        .iter()
        .map(|&id| (id, dict.resolve(id).map_or("", |s| &**s)))
        .collect();
    by_text.sort_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(&b.0)));
    let mut ranks: Vec<(u64, u64)> = by_text
        .iter()
        .enumerate()
        .map(|(rank, &(id, _))| (id, rank as u64))
        .collect();
    ranks.sort_unstable();
    ranks
}

fn fill<F>(ctx: &ExecContext<'_>, out: &mut [u64], f: F)
where
    F: Fn(usize, &mut [u64]) + Sync + Send,
{
    let chunk = MORSEL_SIZE * 8;
    if ctx.workers_for(out.len()) <= 1 {
        f(0, out);
        return;
    }
    ctx.pool.install(|| {
        out.par_chunks_mut(chunk)
            .enumerate()
            .for_each(|(c, part)| f(c * chunk, part));
    });
}

/// Computes the order-preserving raw word of every row. Null rows get 0.
pub(crate) fn raw_words(ctx: &ExecContext<'_>, column: &Column) -> Vec<u64> {
    let mut out = vec![0u64; column.len()];
    match column.data() {
        ColumnData::F64(v) => fill(ctx, &mut out, |start, part| {
            for (o, &x) in part.iter_mut().zip(&v[start..]) {
                *o = float_order(x);
            }
        }),
        ColumnData::Symbol(ids) => {
            let ids = ids.to_ids();
            let ranks = symbol_ranks(&ids);
            fill(ctx, &mut out, |start, part| {
                for (o, id) in part.iter_mut().zip(&ids[start..]) {
                    *o = ranks
                        .binary_search_by(|(k, _)| k.cmp(id))
                        .map_or(0, |pos| ranks[pos].1);
                }
            });
        }
        _ => fill(ctx, &mut out, |start, part| {
            for (i, o) in part.iter_mut().enumerate() {
                *o = int_order(column.i64_at(start + i));
            }
        }),
    }
    if column.has_nulls() {
        for (i, o) in out.iter_mut().enumerate() {
            if column.is_null(i) {
                *o = 0;
            }
        }
    }
    out
}

/// A key ready for comparison: raw words plus ordering flags.
#[derive(Debug)]
pub(crate) struct RawKey<'a> {
    pub(crate) words: Vec<u64>,
    pub(crate) column: &'a Column,
    pub(crate) descending: bool,
    pub(crate) nulls_first: bool,
}

impl RawKey<'_> {
    #[inline]
    fn compare(&self, a: usize, b: usize) -> Ordering {
        match (self.column.is_null(a), self.column.is_null(b)) {
            (true, true) => Ordering::Equal,
            (true, false) if self.nulls_first => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if self.nulls_first => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = self.words[a].cmp(&self.words[b]);
                if self.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    }
}

pub(crate) fn raw_keys<'a>(ctx: &ExecContext<'_>, keys: &'a [SortColumn]) -> Vec<RawKey<'a>> {
    keys.iter()
        .map(|k| RawKey {
            words: raw_words(ctx, &k.column),
            column: &k.column,
            descending: k.descending,
            nulls_first: k.nulls_first,
        })
        .collect()
}

/// Typed multi-key comparison with the row index as the final tie-break.
pub(crate) fn compare_rows(keys: &[RawKey<'_>], a: u32, b: u32) -> Ordering {
    let (ia, ib) = (a as usize, b as usize);
    for key in keys {
        let ord = key.compare(ia, ib);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.cmp(&b)
}

/// Range compression of one key: codes are `0..=top`, `bits` wide.
#[derive(Debug, Clone, Copy)]
struct Layout {
    min: u64,
    range: u64,
    top: u64,
    shift: u64,
    bits: u32,
}

impl Layout {
    fn of(key: &RawKey<'_>) -> Option<Self> {
        let column = key.column;
        let valid = |i: &usize| !column.is_null(*i);
        let n = key.words.len();
        let min = (0..n).filter(valid).map(|i| key.words[i]).min().unwrap_or(0);
        let max = (0..n).filter(valid).map(|i| key.words[i]).max().unwrap_or(0);
        let range = max - min;
        let has_nulls = column.has_nulls();
        let top = if has_nulls { range.checked_add(1)? } else { range };
        Some(Self {
            min,
            range,
            top,
            shift: u64::from(has_nulls && key.nulls_first),
            bits: 64 - top.leading_zeros(),
        })
    }

    #[inline]
    fn code(&self, key: &RawKey<'_>, row: usize) -> u64 {
        if key.column.is_null(row) {
            if key.nulls_first {
                0
            } else {
                self.top
            }
        } else {
            let d = key.words[row] - self.min;
            (if key.descending { self.range - d } else { d }) + self.shift
        }
    }
}

/// Packs every key of a row into one composite word, primary key in the
/// most significant bits.
#[derive(Debug)]
pub(crate) struct Packer<'k, 'c> {
    keys: &'k [RawKey<'c>],
    layouts: Vec<Layout>,
}

impl<'k, 'c> Packer<'k, 'c> {
    /// Returns `None` when the keys need more than 64 bits.
    pub(crate) fn new(keys: &'k [RawKey<'c>]) -> Option<Self> {
        let mut layouts = Vec::with_capacity(keys.len());
        let mut total = 0u32;
        for key in keys {
            let layout = Layout::of(key)?;
            total += layout.bits;
            if total > 64 {
                return None;
            }
            layouts.push(layout);
        }
        Some(Self { keys, layouts })
    }

    /// Composite code of `row`.
    #[inline]
    pub(crate) fn encode(&self, row: usize) -> u64 {
        let mut code = 0u64;
        for (key, layout) in self.keys.iter().zip(&self.layouts) {
            match layout.bits {
                0 => {}
                64 => code = layout.code(key, row),
                bits => code = (code << bits) | layout.code(key, row),
            }
        }
        code
    }

    /// Composite codes of every row.
    pub(crate) fn codes(&self, ctx: &ExecContext<'_>, nrows: usize) -> Vec<u64> {
        let mut out = vec![0u64; nrows];
        fill(ctx, &mut out, |start, part| {
            for (i, o) in part.iter_mut().enumerate() {
                *o = self.encode(start + i);
            }
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ExecutorConfig};
    use crate::types::{DataType, Value};
    use std::sync::Arc;

    fn exec() -> Executor {
        Executor::new(ExecutorConfig::new().with_num_workers(1)).unwrap()
    }

    #[test]
    fn test_float_order_is_monotonic() {
        let values = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1e-300, 7.0, f64::INFINITY, f64::NAN];
        let words: Vec<u64> = values.iter().map(|&v| float_order(v)).collect();
        for w in words.windows(2) {
            assert!(w[0] <= w[1]);
        }
        assert_eq!(float_order(-0.0), float_order(0.0));
    }

    #[test]
    fn test_int_order_is_monotonic() {
        assert!(int_order(-1) < int_order(0));
        assert!(int_order(i64::MIN) < int_order(i64::MAX));
    }

    #[test]
    fn test_symbol_rank_is_lexical() {
        let exec = exec();
        // intern in non-lexical order so ids disagree with string order
        let col = Column::from_symbols(&["zz-rank", "aa-rank", "mm-rank"]);
        let words = raw_words(&exec.context(), &col);
        assert!(words[1] < words[2]);
        assert!(words[2] < words[0]);
    }

    #[test]
    fn test_composite_puts_primary_key_high() {
        let exec = exec();
        let keys = vec![
            SortColumn {
                column: Arc::new(Column::from_i64(vec![2, 1, 2])),
                descending: false,
                nulls_first: false,
            },
            SortColumn {
                column: Arc::new(Column::from_i64(vec![0, 9, 5])),
                descending: true,
                nulls_first: false,
            },
        ];
        let raw = raw_keys(&exec.context(), &keys);
        let codes = Packer::new(&raw).unwrap().codes(&exec.context(), 3);
        assert!(codes[1] < codes[2]);
        assert!(codes[2] < codes[0]);
    }

    #[test]
    fn test_null_slot_placement() {
        let exec = exec();
        let column = Arc::new(
            Column::from_values(DataType::I64, &[Value::I64(5), Value::Null, Value::I64(1)]).unwrap(),
        );
        for nulls_first in [true, false] {
            let keys = vec![SortColumn {
                column: Arc::clone(&column),
                descending: false,
                nulls_first,
            }];
            let raw = raw_keys(&exec.context(), &keys);
            let packer = Packer::new(&raw).unwrap();
            let codes: Vec<u64> = (0..3).map(|row| packer.encode(row)).collect();
            if nulls_first {
                assert!(codes[1] < codes[2] && codes[2] < codes[0]);
            } else {
                assert!(codes[2] < codes[0] && codes[0] < codes[1]);
            }
        }
    }

    #[test]
    fn test_wide_keys_do_not_pack() {
        let exec = exec();
        let wide = Arc::new(Column::from_i64(vec![i64::MIN, i64::MAX]));
        let keys = vec![
            SortColumn { column: Arc::clone(&wide), descending: false, nulls_first: false },
            SortColumn { column: wide, descending: false, nulls_first: false },
        ];
        let raw = raw_keys(&exec.context(), &keys);
        assert!(Packer::new(&raw).is_none());
    }
}
