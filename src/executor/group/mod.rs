//! Adaptive GROUP BY.
//!
//! Paths, cheapest first:
//! - zero keys: one flat reduction per aggregate ([`scalar`]);
//! - dense arrays indexed by a composite slot when every key is a bounded
//!   integer or symbol ([`direct`]);
//! - radix-partitioned hash aggregation, with a single-threaded hash table
//!   as the fallback ([`hashed`]);
//! - per-segment partial aggregation for segmented tables ([`parted`]).
//!
//! Every path consumes the pending row selection directly.

mod accum;
mod direct;
mod hashed;
mod parted;
mod scalar;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, TesseraError};
use crate::pool::MORSEL_SIZE;
use crate::storage::{BatchSelection, Column, ColumnRef, RowSelection, Table, TableColumn};

use self::accum::{AggInput, AggPlan};
use super::context::ExecContext;
use super::GroupStrategy;

pub(crate) use self::accum::Measure;
pub(crate) use self::parted::{group_parted, PartedAgg};

/// Maximum number of grouping keys.
pub const MAX_GROUP_KEYS: usize = 8;

/// Maximum number of aggregates per GROUP BY.
pub const MAX_AGGREGATES: usize = 8;

/// An evaluated grouping key.
#[derive(Debug, Clone)]
pub(crate) struct GroupKey {
    pub(crate) name: Arc<str>,
    pub(crate) column: ColumnRef,
}

/// An evaluated aggregate input and the name of its output column.
#[derive(Debug, Clone)]
pub(crate) struct GroupAgg {
    pub(crate) measure: Measure,
    pub(crate) name: Arc<str>,
    pub(crate) column: ColumnRef,
}

/// Validated inputs shared by every path.
pub(super) struct Input<'a> {
    keys: &'a [GroupKey],
    aggs: Vec<AggInput<'a>>,
    plans: Vec<AggPlan>,
    selection: Option<&'a RowSelection>,
    nrows: usize,
}

impl<'a> Input<'a> {
    fn new(
        keys: &'a [GroupKey],
        aggs: &'a [GroupAgg],
        selection: Option<&'a RowSelection>,
        nrows: usize,
    ) -> Result<Self> {
        let plans = aggs
            .iter()
            .map(|a| AggPlan::new(a.measure, a.column.data_type()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            keys,
            aggs: aggs.iter().map(|a| AggInput::new(&a.column)).collect(),
            plans,
            selection,
            nrows,
        })
    }
}

/// Finished key and aggregate columns.
#[derive(Debug)]
pub(super) struct Grouped {
    keys: Vec<Column>,
    aggs: Vec<Column>,
}

/// Calls `f` for every selected row of `start..end`, resolving the
/// selection one morsel at a time.
pub(super) fn try_for_each_row<F>(
    selection: Option<&RowSelection>,
    start: usize,
    end: usize,
    mut f: F,
) -> Result<()>
where
    F: FnMut(usize) -> Result<()>,
{
    let Some(selection) = selection else {
        return (start..end).try_for_each(f);
    };
    let mut mask = [false; MORSEL_SIZE];
    let mut batch_start = start;
    while batch_start < end {
        let batch_end = ((batch_start / MORSEL_SIZE + 1) * MORSEL_SIZE).min(end);
        let mask = &mut mask[..batch_end - batch_start];
        match selection.resolve_batch(batch_start, mask) {
            BatchSelection::Skip => {}
            BatchSelection::All => (batch_start..batch_end).try_for_each(&mut f)?,
            BatchSelection::Partial => {
                for (i, &keep) in mask.iter().enumerate() {
                    if keep {
                        f(batch_start + i)?;
                    }
                }
            }
        }
        batch_start = batch_end;
    }
    Ok(())
}

fn keyed(ctx: &ExecContext<'_>, input: &Input<'_>) -> Result<Grouped> {
    let strategy = ctx.config.group_strategy;
    if matches!(strategy, GroupStrategy::Auto | GroupStrategy::Direct) {
        if let Some(plan) = direct::plan(ctx, input) {
            debug!(slots = plan.slots(), rows = input.nrows, "group by: direct arrays");
            match direct::aggregate(ctx, &plan, input) {
                Ok(grouped) => return Ok(grouped),
                Err(e) if e.is_out_of_memory() => {
                    warn!(error = %e, "direct-array group by out of memory, using hash path");
                }
                Err(e) => return Err(e),
            }
        }
    }
    let parallel = ctx.workers_for(input.nrows) > 1;
    if strategy == GroupStrategy::Sequential || (!parallel && strategy != GroupStrategy::Hashed) {
        debug!(rows = input.nrows, "group by: sequential hash");
        hashed::sequential(ctx, input)
    } else {
        debug!(rows = input.nrows, "group by: partitioned hash");
        hashed::partitioned(ctx, input)
    }
}

/// Groups `nrows` rows (restricted to `selection`) by `keys`, computing
/// `aggs`. Output columns are the keys followed by the aggregates.
pub(crate) fn group_columns(
    ctx: &ExecContext<'_>,
    keys: &[GroupKey],
    aggs: &[GroupAgg],
    selection: Option<&RowSelection>,
    nrows: usize,
) -> Result<Table> {
    ctx.check_cancelled()?;
    if keys.len() > MAX_GROUP_KEYS || aggs.len() > MAX_AGGREGATES {
        return Err(TesseraError::DomainError(format!(
            "group by takes at most {MAX_GROUP_KEYS} keys and {MAX_AGGREGATES} aggregates, got {} and {}",
            keys.len(),
            aggs.len()
        )));
    }
    let lengths = keys
        .iter()
        .map(|k| k.column.len())
        .chain(aggs.iter().map(|a| a.column.len()))
        .chain(selection.map(RowSelection::len));
    for len in lengths {
        if len != nrows {
            return Err(TesseraError::LengthMismatch {
                left: nrows,
                right: len,
            });
        }
    }
    let input = Input::new(keys, aggs, selection, nrows)?;
    let grouped = if keys.is_empty() {
        scalar::aggregate(ctx, &input)?
    } else {
        keyed(ctx, &input)?
    };

    let mut out = Table::new();
    let names = keys.iter().map(|k| &k.name).chain(aggs.iter().map(|a| &a.name));
    for (name, column) in names.zip(grouped.keys.into_iter().chain(grouped.aggs)) {
        out.add_column(name, TableColumn::Flat(Arc::new(column)))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ExecutorConfig};
    use crate::types::{DataType, Value};

    fn executor(strategy: GroupStrategy, workers: usize) -> Executor {
        Executor::new(
            ExecutorConfig::new()
                .with_num_workers(workers)
                .with_parallel_threshold(1024)
                .with_group_strategy(strategy),
        )
        .unwrap()
    }

    fn key(name: &str, column: Column) -> GroupKey {
        GroupKey {
            name: Arc::from(name),
            column: Arc::new(column),
        }
    }

    fn agg(measure: Measure, name: &str, column: &ColumnRef) -> GroupAgg {
        GroupAgg {
            measure,
            name: Arc::from(name),
            column: Arc::clone(column),
        }
    }

    fn sorted_rows(table: &Table) -> Vec<Vec<Value>> {
        let mut rows = table.rows().unwrap();
        rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        rows
    }

    #[test]
    fn test_example_scenario_on_every_path() {
        let v: ColumnRef = Arc::new(Column::from_i64(vec![10, 20, 30, 40, 50]));
        for strategy in [
            GroupStrategy::Auto,
            GroupStrategy::Direct,
            GroupStrategy::Hashed,
            GroupStrategy::Sequential,
        ] {
            let exec = executor(strategy, 2);
            let out = group_columns(
                &exec.context(),
                &[key("k", Column::from_i64(vec![1, 1, 2, 2, 2]))],
                &[agg(Measure::Sum, "v_sum", &v)],
                None,
                5,
            )
            .unwrap();
            assert_eq!(out.names()[1].as_ref(), "v_sum");
            assert_eq!(
                sorted_rows(&out),
                vec![
                    vec![Value::I64(1), Value::I64(30)],
                    vec![Value::I64(2), Value::I64(120)],
                ],
                "{strategy:?}"
            );
        }
    }

    #[test]
    fn test_paths_agree_on_large_input() {
        let n = 50_000;
        let k1: Vec<i64> = (0..n).map(|i| i % 37).collect();
        let k2 = Column::from_symbols(
            &(0..n).map(|i| format!("s{}", i % 5)).collect::<Vec<_>>(),
        );
        let x: ColumnRef = Arc::new(Column::from_f64((0..n).map(|i| (i % 101) as f64).collect()));
        let y: ColumnRef = Arc::new(Column::from_i64((0..n).map(|i| i % 13 - 6).collect()));
        let keys = [key("k1", Column::from_i64(k1)), key("k2", k2)];
        let aggs = [
            agg(Measure::Sum, "x_sum", &x),
            agg(Measure::Count, "x_count", &x),
            agg(Measure::Min, "y_min", &y),
            agg(Measure::Max, "y_max", &y),
            agg(Measure::First, "y_first", &y),
            agg(Measure::Last, "y_last", &y),
            agg(Measure::VarPop, "y_var_pop", &y),
        ];
        let selection = RowSelection::from_predicate(
            &(0..n).map(|i| i % 3 != 0).collect::<Vec<_>>(),
        );
        let mut results = Vec::new();
        for strategy in [GroupStrategy::Direct, GroupStrategy::Hashed, GroupStrategy::Sequential] {
            let exec = executor(strategy, 4);
            let out = group_columns(&exec.context(), &keys, &aggs, Some(&selection), n as usize)
                .unwrap();
            results.push(sorted_rows(&out));
        }
        assert_eq!(results[0].len(), 37 * 5);
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
    }

    #[test]
    fn test_direct_out_of_memory_regroups_by_hash() {
        let n = 3000;
        let keys = [key("k", Column::from_i64((0..n).map(|i| (i % 3) * 100_000).collect()))];
        let v: ColumnRef = Arc::new(Column::from_i64((0..n).collect()));
        let aggs = [agg(Measure::Sum, "v_sum", &v), agg(Measure::Count, "v_count", &v)];

        let limited =
            Executor::new(ExecutorConfig::new().with_num_workers(1).with_memory_limit(1 << 20))
                .unwrap();
        let ctx = limited.context();
        let input = Input::new(&keys, &aggs, None, n as usize).unwrap();
        let plan = direct::plan(&ctx, &input).unwrap();
        assert_eq!(plan.slots(), 200_001);
        assert!(direct::aggregate(&ctx, &plan, &input).unwrap_err().is_out_of_memory());

        let got = group_columns(&ctx, &keys, &aggs, None, n as usize).unwrap();
        let unconstrained = executor(GroupStrategy::Auto, 1);
        let expected =
            group_columns(&unconstrained.context(), &keys, &aggs, None, n as usize).unwrap();
        assert_eq!(got.nrows(), 3);
        assert_eq!(sorted_rows(&got), sorted_rows(&expected));
    }

    #[test]
    fn test_zero_keys_one_row() {
        let exec = executor(GroupStrategy::Auto, 1);
        let v: ColumnRef = Arc::new(Column::from_i64(vec![]));
        let out = group_columns(
            &exec.context(),
            &[],
            &[agg(Measure::Count, "v_count", &v), agg(Measure::Sum, "v_sum", &v)],
            None,
            0,
        )
        .unwrap();
        assert_eq!(out.rows().unwrap(), vec![vec![Value::I64(0), Value::Null]]);
    }

    #[test]
    fn test_zero_rows_keep_types() {
        for strategy in [GroupStrategy::Auto, GroupStrategy::Hashed, GroupStrategy::Sequential] {
            let exec = executor(strategy, 2);
            let v: ColumnRef = Arc::new(Column::from_f64(vec![]));
            let out = group_columns(
                &exec.context(),
                &[key("k", Column::from_i32(vec![]))],
                &[agg(Measure::Avg, "v_avg", &v)],
                None,
                0,
            )
            .unwrap();
            assert_eq!(out.nrows(), 0);
            assert_eq!(out.column_at(0).unwrap().data_type(), DataType::I32);
            assert_eq!(out.column_at(1).unwrap().data_type(), DataType::F64);
        }
    }

    #[test]
    fn test_null_key_is_its_own_group() {
        let exec = executor(GroupStrategy::Auto, 1);
        let k = Column::from_values(
            DataType::I64,
            &[Value::I64(1), Value::Null, Value::I64(1), Value::Null],
        )
        .unwrap();
        let v: ColumnRef = Arc::new(Column::from_i64(vec![1, 2, 3, 4]));
        let out = group_columns(
            &exec.context(),
            &[key("k", k)],
            &[agg(Measure::Sum, "v_sum", &v)],
            None,
            4,
        )
        .unwrap();
        assert_eq!(
            sorted_rows(&out),
            vec![
                vec![Value::I64(1), Value::I64(4)],
                vec![Value::Null, Value::I64(6)],
            ]
        );
    }

    #[test]
    fn test_limits_and_lengths() {
        let exec = executor(GroupStrategy::Auto, 1);
        let c = Column::from_i64(vec![1]);
        let keys: Vec<GroupKey> = (0..9).map(|i| key(&format!("k{i}"), c.clone())).collect();
        assert!(matches!(
            group_columns(&exec.context(), &keys, &[], None, 1),
            Err(TesseraError::DomainError(_))
        ));
        assert!(matches!(
            group_columns(&exec.context(), &keys[..1], &[], None, 2),
            Err(TesseraError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_selection_skips_whole_morsels() {
        let mut flags = vec![false; 3 * MORSEL_SIZE];
        flags[MORSEL_SIZE..2 * MORSEL_SIZE].fill(true);
        flags[2 * MORSEL_SIZE + 5] = true;
        let selection = RowSelection::from_predicate(&flags);
        let mut seen = Vec::new();
        try_for_each_row(Some(&selection), 0, flags.len(), |row| {
            seen.push(row);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.len(), MORSEL_SIZE + 1);
        assert_eq!(seen.first(), Some(&MORSEL_SIZE));
        assert_eq!(seen.last(), Some(&(2 * MORSEL_SIZE + 5)));
    }
}
