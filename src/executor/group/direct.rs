//! Dense-array GROUP BY over bounded integer and symbol keys.
//!
//! Each row's composite slot is `sum((key_i - min_i) * stride_i)`, with the
//! first key in the most significant position, so slots enumerate key
//! tuples in ascending order. Every worker accumulates into private dense
//! arrays; the arrays are merged in worker order and the occupied slots are
//! emitted in ascending slot order.

use crate::error::Result;
use crate::executor::context::ExecContext;
use crate::storage::{Column, ColumnData};
use crate::types::DataType;

use super::accum::AccSet;
use super::{try_for_each_row, Grouped, Input};

/// Slot counts from which worker arrays merge one accumulator per task.
const PARALLEL_MERGE_SLOTS: usize = 1 << 16;

/// Bytes per cost unit of an accumulator slot (value plus counter).
const UNIT_BYTES: usize = 16;

#[derive(Debug)]
pub(super) struct DirectPlan {
    mins: Vec<i64>,
    ranges: Vec<u64>,
    strides: Vec<u64>,
    slots: usize,
    workers: usize,
}

impl DirectPlan {
    pub(super) fn slots(&self) -> usize {
        self.slots
    }

    #[inline]
    #[allow(clippy::cast_sign_loss)]
    fn slot(&self, keys: &[&Column], row: usize) -> usize {
        let mut slot = 0u64;
        for ((key, &min), &stride) in keys.iter().zip(&self.mins).zip(&self.strides) {
            slot += (key.i64_at(row).wrapping_sub(min) as u64) * stride;
        }
        slot as usize
    }
}

fn min_max(ctx: &ExecContext<'_>, column: &Column, workers: usize) -> (i64, i64) {
    ctx.pool
        .map_ranges(column.len(), workers, |_, start, end| {
            (start..end).fold((i64::MAX, i64::MIN), |(lo, hi), i| {
                let v = column.i64_at(i);
                (lo.min(v), hi.max(v))
            })
        })
        .into_iter()
        .fold((i64::MAX, i64::MIN), |(lo, hi), (a, b)| (lo.min(a), hi.max(b)))
}

/// Returns a plan when every key is a null-free integer or symbol column
/// whose composite slot space and accumulator footprint fit the configured
/// ceilings.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub(super) fn plan(ctx: &ExecContext<'_>, input: &Input<'_>) -> Option<DirectPlan> {
    if input.nrows == 0 {
        return None;
    }
    if input
        .keys
        .iter()
        .any(|k| k.column.has_nulls() || k.column.data_type() == DataType::F64)
    {
        return None;
    }
    let config = ctx.config;
    let max_slots = config.direct_array_max_slots as u64;
    let workers = ctx.workers_for(input.nrows);

    let mut mins = Vec::with_capacity(input.keys.len());
    let mut ranges = Vec::with_capacity(input.keys.len());
    let mut slots = 1u64;
    for key in input.keys {
        let (lo, hi) = min_max(ctx, &key.column, workers);
        let range = (i128::from(hi) - i128::from(lo) + 1) as u128;
        if range > u128::from(max_slots) {
            return None;
        }
        slots = slots.checked_mul(range as u64)?;
        if slots > max_slots {
            return None;
        }
        mins.push(lo);
        ranges.push(range as u64);
    }
    let mut strides = vec![1u64; ranges.len()];
    for i in (0..ranges.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * ranges[i + 1];
    }

    let slots = slots as usize;
    let units: usize = input
        .plans
        .iter()
        .map(|p| p.measure.cost_units(config.minmax_cost_weight))
        .sum();
    let worker_bytes = slots.saturating_mul(8 + UNIT_BYTES * units);
    if worker_bytes > config.direct_array_worker_bytes {
        return None;
    }
    let workers = workers
        .min(config.direct_array_total_bytes / worker_bytes.max(1))
        .max(1);
    Some(DirectPlan {
        mins,
        ranges,
        strides,
        slots,
        workers,
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub(super) fn aggregate(
    ctx: &ExecContext<'_>,
    plan: &DirectPlan,
    input: &Input<'_>,
) -> Result<Grouped> {
    let keys: Vec<&Column> = input.keys.iter().map(|k| k.column.as_ref()).collect();
    let partials = ctx
        .pool
        .map_ranges(input.nrows, plan.workers, |_, start, end| -> Result<AccSet> {
            let mut set = AccSet::new(ctx.arena, &input.plans, plan.slots)?;
            try_for_each_row(input.selection, start, end, |row| {
                let slot = plan.slot(&keys, row);
                set.add_row(slot);
                for (j, agg) in input.aggs.iter().enumerate() {
                    let (word, null) = agg.word(row);
                    set.update(slot, j, word, null);
                }
                Ok(())
            })?;
            Ok(set)
        });

    let mut partials = partials.into_iter();
    let mut total = match partials.next() {
        Some(first) => first?,
        None => AccSet::new(ctx.arena, &input.plans, plan.slots)?,
    };
    let parallel = plan.slots >= PARALLEL_MERGE_SLOTS && plan.workers > 1;
    for partial in partials {
        let partial = partial?;
        if parallel {
            ctx.pool.install(|| total.merge_dense(&partial, true));
        } else {
            total.merge_dense(&partial, false);
        }
    }

    let groups: Vec<u32> = (0..plan.slots)
        .filter(|&s| total.rows(s) > 0)
        .map(|s| s as u32)
        .collect();
    let key_columns = input
        .keys
        .iter()
        .enumerate()
        .map(|(i, key)| {
            let values = groups
                .iter()
                .map(|&s| {
                    let offset = (u64::from(s) / plan.strides[i]) % plan.ranges[i];
                    plan.mins[i].wrapping_add(offset as i64)
                })
                .collect();
            Column::new(ColumnData::from_i64(key.column.data_type(), values))
        })
        .collect();
    Ok(Grouped {
        keys: key_columns,
        aggs: total.finish(&input.plans, &groups)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::executor::group::accum::{AggInput, AggPlan, Measure};
    use crate::executor::group::GroupKey;
    use crate::executor::{Executor, ExecutorConfig};
    use crate::types::Value;

    fn input<'a>(keys: &'a [GroupKey], v: &'a Column, nrows: usize) -> Input<'a> {
        Input {
            keys,
            aggs: vec![AggInput::new(v)],
            plans: vec![AggPlan::new(Measure::Sum, v.data_type()).unwrap()],
            selection: None,
            nrows,
        }
    }

    fn key(column: Column) -> GroupKey {
        GroupKey {
            name: Arc::from("k"),
            column: Arc::new(column),
        }
    }

    #[test]
    fn test_slots_are_lexicographic() {
        let exec = Executor::new(ExecutorConfig::new().with_num_workers(1)).unwrap();
        let keys = [
            key(Column::from_i64(vec![5, 3, 5, 3])),
            key(Column::from_i32(vec![-1, 7, 0, -1])),
        ];
        let v = Column::from_i64(vec![1, 2, 3, 4]);
        let input = input(&keys, &v, 4);
        let plan = plan(&exec.context(), &input).unwrap();
        assert_eq!(plan.slots(), 3 * 9);
        let out = aggregate(&exec.context(), &plan, &input).unwrap();
        assert_eq!(
            out.keys[0].values(),
            vec![Value::I64(3), Value::I64(3), Value::I64(5), Value::I64(5)]
        );
        assert_eq!(
            out.keys[1].values(),
            vec![Value::I32(-1), Value::I32(7), Value::I32(-1), Value::I32(0)]
        );
        assert_eq!(
            out.aggs[0].values(),
            vec![Value::I64(4), Value::I64(2), Value::I64(1), Value::I64(3)]
        );
    }

    #[test]
    fn test_ineligible_keys() {
        let exec = Executor::new(ExecutorConfig::new().with_num_workers(1)).unwrap();
        let v = Column::from_i64(vec![1, 2]);
        let wide = [key(Column::from_i64(vec![0, 1 << 40]))];
        assert!(plan(&exec.context(), &input(&wide, &v, 2)).is_none());
        let float = [key(Column::from_f64(vec![0.0, 1.0]))];
        assert!(plan(&exec.context(), &input(&float, &v, 2)).is_none());
        let nullable = [key(
            Column::from_values(DataType::I64, &[Value::I64(1), Value::Null]).unwrap(),
        )];
        assert!(plan(&exec.context(), &input(&nullable, &v, 2)).is_none());
    }

    #[test]
    fn test_footprint_budget() {
        let exec = Executor::new(
            ExecutorConfig::new()
                .with_num_workers(1)
                .with_direct_array_budget(1024, 1 << 20),
        )
        .unwrap();
        let keys = [key(Column::from_i64(vec![0, 999]))];
        let v = Column::from_i64(vec![1, 2]);
        assert!(plan(&exec.context(), &input(&keys, &v, 2)).is_none());
    }

    #[test]
    fn test_parallel_merge_matches_serial() {
        let n = 100_000usize;
        let keys = [key(Column::from_i64((0..n as i64).map(|i| i % 70_000).collect()))];
        let v = Column::from_i64((0..n as i64).collect());
        let run = |workers| {
            let exec = Executor::new(
                ExecutorConfig::new()
                    .with_num_workers(workers)
                    .with_parallel_threshold(1024),
            )
            .unwrap();
            let input = input(&keys, &v, n);
            let plan = plan(&exec.context(), &input).unwrap();
            aggregate(&exec.context(), &plan, &input).unwrap().aggs[0].values()
        };
        assert_eq!(run(1), run(4));
    }
}
