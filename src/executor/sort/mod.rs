//! Sort engine.
//!
//! Keys are encoded into order-preserving words (see [`keys`]); when every
//! key fits into one 64-bit composite the rows are ordered by insertion sort,
//! bounded heaps or LSB radix, otherwise by a typed comparator merge sort.
//! Every algorithm breaks ties by row index, so all of them produce the same
//! permutation for the same input.

mod keys;
mod merge;
mod radix;
mod topn;

use tracing::debug;

use crate::error::{Result, TesseraError};
use crate::storage::Table;

use super::context::ExecContext;
use super::gather::gather_table;
use super::SortStrategy;

pub(crate) use self::keys::SortColumn;
use self::keys::{compare_rows, raw_keys, Packer};
use self::merge::{insertion_sort, merge_sort, INSERTION_THRESHOLD};
use self::radix::radix_sort;
use self::topn::top_n;

/// Maximum number of sort keys.
pub const MAX_SORT_KEYS: usize = 8;

/// Input is at least this many times the limit before heaps are used.
const TOPN_RATIO: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Insertion,
    TopN,
    Radix,
    Merge,
}

fn choose(
    strategy: SortStrategy,
    n: usize,
    limit: Option<usize>,
    heap_cap: usize,
    packed: bool,
) -> Algorithm {
    let topn_fits = packed && limit.is_some_and(|l| l <= heap_cap);
    let pinned = match strategy {
        SortStrategy::Auto => None,
        SortStrategy::Insertion => Some(Algorithm::Insertion),
        SortStrategy::Radix if packed => Some(Algorithm::Radix),
        SortStrategy::TopN if topn_fits => Some(Algorithm::TopN),
        SortStrategy::Merge => Some(Algorithm::Merge),
        SortStrategy::Radix | SortStrategy::TopN => None,
    };
    if let Some(algorithm) = pinned {
        return algorithm;
    }
    if n <= INSERTION_THRESHOLD {
        Algorithm::Insertion
    } else if topn_fits && limit.is_some_and(|l| n >= TOPN_RATIO.saturating_mul(l)) {
        Algorithm::TopN
    } else if packed {
        Algorithm::Radix
    } else {
        Algorithm::Merge
    }
}

/// Returns the row order of `keys` (all of length `nrows`), truncated to
/// `limit` rows.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn sort_indices(
    ctx: &ExecContext<'_>,
    keys: &[SortColumn],
    nrows: usize,
    limit: Option<usize>,
) -> Result<Vec<u32>> {
    ctx.check_cancelled()?;
    if keys.len() > MAX_SORT_KEYS {
        return Err(TesseraError::DomainError(format!(
            "sort takes at most {MAX_SORT_KEYS} keys, got {}",
            keys.len()
        )));
    }
    if let Some(key) = keys.iter().find(|k| k.column.len() != nrows) {
        return Err(TesseraError::LengthMismatch {
            left: nrows,
            right: key.column.len(),
        });
    }
    if u32::try_from(nrows).is_err() {
        return Err(TesseraError::DomainError(format!(
            "cannot sort {nrows} rows"
        )));
    }
    let limit = limit.map(|l| l.min(nrows));
    if keys.is_empty() || nrows == 0 {
        return Ok((0..limit.unwrap_or(nrows) as u32).collect());
    }

    let raw = raw_keys(ctx, keys);
    let packer = Packer::new(&raw);
    let algorithm = choose(
        ctx.config.sort_strategy,
        nrows,
        limit,
        ctx.config.topn_heap_cap,
        packer.is_some(),
    );
    debug!(rows = nrows, keys = keys.len(), ?limit, ?algorithm, "sort");

    let mut order = match (algorithm, packer) {
        (Algorithm::TopN, Some(packer)) => {
            top_n(ctx, nrows, limit.unwrap_or(nrows), |row| packer.encode(row))
        }
        (Algorithm::Radix, Some(packer)) => radix_sort(ctx, &packer.codes(ctx, nrows))?,
        (Algorithm::Insertion, Some(packer)) => {
            let codes = packer.codes(ctx, nrows);
            let mut order: Vec<u32> = (0..nrows as u32).collect();
            insertion_sort(&mut order, &|a: u32, b: u32| {
                (codes[a as usize], a).cmp(&(codes[b as usize], b))
            });
            order
        }
        (Algorithm::Insertion, None) => {
            let mut order: Vec<u32> = (0..nrows as u32).collect();
            insertion_sort(&mut order, &|a, b| compare_rows(&raw, a, b));
            order
        }
        _ => merge_sort(ctx, nrows, &|a, b| compare_rows(&raw, a, b)),
    };
    if let Some(limit) = limit {
        order.truncate(limit);
    }
    Ok(order)
}

/// Sorts the rows of a dense table by already evaluated key columns.
pub(crate) fn sort_table(
    ctx: &ExecContext<'_>,
    table: &Table,
    keys: &[SortColumn],
    limit: Option<usize>,
) -> Result<Table> {
    let order = sort_indices(ctx, keys, table.nrows(), limit)?;
    gather_table(ctx, table, &order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ExecutorConfig};
    use crate::storage::{Column, ColumnRef};
    use crate::types::{DataType, Value};
    use std::sync::Arc;

    fn executor(strategy: SortStrategy) -> Executor {
        Executor::new(
            ExecutorConfig::new()
                .with_num_workers(2)
                .with_parallel_threshold(1024)
                .with_sort_strategy(strategy),
        )
        .unwrap()
    }

    fn key(column: ColumnRef, descending: bool, nulls_first: bool) -> SortColumn {
        SortColumn {
            column,
            descending,
            nulls_first,
        }
    }

    #[test]
    fn test_choose_by_shape() {
        let auto = SortStrategy::Auto;
        assert_eq!(choose(auto, 10, None, 8192, true), Algorithm::Insertion);
        assert_eq!(choose(auto, 10_000, Some(10), 8192, true), Algorithm::TopN);
        assert_eq!(choose(auto, 10_000, Some(5_000), 8192, true), Algorithm::Radix);
        assert_eq!(choose(auto, 10_000, None, 8192, false), Algorithm::Merge);
        assert_eq!(choose(auto, 10_000, Some(10), 8192, false), Algorithm::Merge);
    }

    #[test]
    fn test_inapplicable_override_degrades() {
        assert_eq!(
            choose(SortStrategy::TopN, 10_000, None, 8192, true),
            Algorithm::Radix
        );
        assert_eq!(
            choose(SortStrategy::Radix, 10_000, None, 8192, false),
            Algorithm::Merge
        );
    }

    #[test]
    fn test_all_algorithms_agree_with_nulls() {
        // 100 rows, duplicate primary keys, descending nulls-first secondary
        let primary: Vec<i64> = (0..100).map(|i| i % 7).collect();
        let secondary: Vec<Value> = (0..100)
            .map(|i| if i % 11 == 0 { Value::Null } else { Value::I64(i % 5) })
            .collect();
        let keys = vec![
            key(Arc::new(Column::from_i64(primary)), false, false),
            key(
                Arc::new(Column::from_values(DataType::I64, &secondary).unwrap()),
                true,
                true,
            ),
        ];
        let reference = sort_indices(
            &executor(SortStrategy::Radix).context(),
            &keys,
            100,
            None,
        )
        .unwrap();
        for strategy in [SortStrategy::Insertion, SortStrategy::Merge, SortStrategy::Auto] {
            let order = sort_indices(&executor(strategy).context(), &keys, 100, None).unwrap();
            assert_eq!(order, reference, "{strategy:?}");
        }
        let top = sort_indices(&executor(SortStrategy::TopN).context(), &keys, 100, Some(9))
            .unwrap();
        assert_eq!(top, reference[..9].to_vec());
        // first row: smallest primary (0), then a null secondary
        assert_eq!(reference[0], 0);
    }

    #[test]
    fn test_heaps_encode_rows_on_demand() {
        let n = 30_000usize;
        let price: Vec<Value> = (0..n)
            .map(|i| if i % 13 == 0 { Value::Null } else { Value::I64((i * 37 % 1_001) as i64) })
            .collect();
        let city = Column::from_symbols(
            &(0..n).map(|i| format!("city{}", i % 17)).collect::<Vec<_>>(),
        );
        let keys = vec![
            key(Arc::new(city), false, false),
            key(Arc::new(Column::from_values(DataType::I64, &price).unwrap()), true, false),
        ];
        let exec = executor(SortStrategy::Auto);
        let ctx = exec.context();
        let raw = raw_keys(&ctx, &keys);
        let packer = Packer::new(&raw).unwrap();
        let codes = packer.codes(&ctx, n);
        assert!((0..n).step_by(97).all(|row| packer.encode(row) == codes[row]));

        let top = top_n(&ctx, n, 50, |row| packer.encode(row));
        let full = sort_indices(&executor(SortStrategy::Radix).context(), &keys, n, None).unwrap();
        assert_eq!(top, full[..50].to_vec());
        let chosen = sort_indices(&ctx, &keys, n, Some(50)).unwrap();
        assert_eq!(chosen, top);
    }

    #[test]
    fn test_symbols_sort_lexically() {
        let exec = executor(SortStrategy::Auto);
        let column = Arc::new(Column::from_symbols(&["pear", "apple", "fig", "apple"]));
        let order = sort_indices(&exec.context(), &[key(column, false, false)], 4, None).unwrap();
        assert_eq!(order, vec![1, 3, 2, 0]);
    }

    #[test]
    fn test_limit_and_empty() {
        let exec = executor(SortStrategy::Auto);
        let column: ColumnRef = Arc::new(Column::from_i64(vec![3, 1, 2]));
        let k = [key(Arc::clone(&column), true, false)];
        assert_eq!(sort_indices(&exec.context(), &k, 3, Some(10)).unwrap(), vec![0, 2, 1]);
        let empty = [key(Arc::new(Column::from_i64(vec![])), false, false)];
        assert!(sort_indices(&exec.context(), &empty, 0, None).unwrap().is_empty());
    }

    #[test]
    fn test_too_many_keys() {
        let exec = executor(SortStrategy::Auto);
        let column: ColumnRef = Arc::new(Column::from_i64(vec![1]));
        let keys: Vec<SortColumn> = (0..9).map(|_| key(Arc::clone(&column), false, false)).collect();
        assert!(matches!(
            sort_indices(&exec.context(), &keys, 1, None),
            Err(TesseraError::DomainError(_))
        ));
    }

    #[test]
    fn test_large_parallel_radix_and_merge_agree() {
        let n = 40_000;
        let a: Vec<i64> = (0..n).map(|i| (i * 7_919) % 1_000 - 500).collect();
        let b: Vec<i64> = (0..n).map(|i| (i * 31) % 97).collect();
        let keys = vec![
            key(Arc::new(Column::from_i64(a)), false, false),
            key(Arc::new(Column::from_i64(b)), true, false),
        ];
        let radix = sort_indices(&executor(SortStrategy::Radix).context(), &keys, n as usize, None)
            .unwrap();
        let merged = sort_indices(&executor(SortStrategy::Merge).context(), &keys, n as usize, None)
            .unwrap();
        assert_eq!(radix, merged);
    }
}
