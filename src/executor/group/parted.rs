//! Per-segment GROUP BY over segmented tables.
//!
//! When segment 0 shows few groups per row, every segment is grouped on its
//! own and the small partial results are folded into a running total a
//! fixed batch of segments at a time. AVG and the variance family travel as
//! sum, sum of squares and valid count, and are recombined once at the end.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, TesseraError};
use crate::executor::context::ExecContext;
use crate::storage::{Column, ColumnData, ColumnRef, NullMask, Table, TableColumn};

use super::accum::{finish_moments, Measure};
use super::{group_columns, GroupAgg, GroupKey, MAX_AGGREGATES};

/// Segment 0 must average at least this many selected rows per group.
const MIN_ROWS_PER_GROUP: usize = 4;

/// One aggregate over a named column of a segmented table.
#[derive(Debug, Clone)]
pub(crate) struct PartedAgg {
    pub(crate) measure: Measure,
    pub(crate) column: Arc<str>,
    pub(crate) name: Arc<str>,
}

/// A partial column: what each segment computes and how partials combine.
#[derive(Debug)]
struct Partial {
    agg: usize,
    measure: Measure,
    merge: Measure,
    name: Arc<str>,
}

fn decompose(aggs: &[PartedAgg]) -> Vec<Partial> {
    let mut partials = Vec::new();
    for (i, agg) in aggs.iter().enumerate() {
        let parts: &[Measure] = match agg.measure {
            Measure::Avg => &[Measure::Sum, Measure::CountValid],
            Measure::Var | Measure::VarPop | Measure::Stddev | Measure::StddevPop => {
                &[Measure::Sum, Measure::SumSq, Measure::CountValid]
            }
            _ => std::slice::from_ref(&agg.measure),
        };
        for (q, &measure) in parts.iter().enumerate() {
            let merge = match measure {
                Measure::Min | Measure::Max | Measure::First | Measure::Last => measure,
                _ => Measure::Sum,
            };
            partials.push(Partial {
                agg: i,
                measure,
                merge,
                name: Arc::from(format!("__{i}_{q}")),
            });
        }
    }
    partials
}

/// Groups one segment, producing the key columns and every partial column.
fn group_segment(
    ctx: &ExecContext<'_>,
    segment: &Table,
    keys: &[Arc<str>],
    aggs: &[PartedAgg],
    partials: &[Partial],
) -> Result<Table> {
    let keys = keys
        .iter()
        .map(|name| {
            Ok(GroupKey {
                name: Arc::clone(name),
                column: segment.flat_column(name)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let inputs = partials
        .iter()
        .map(|p| {
            Ok(GroupAgg {
                measure: p.measure,
                name: Arc::clone(&p.name),
                column: segment.flat_column(&aggs[p.agg].column)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    group_columns(
        ctx,
        &keys,
        &inputs,
        segment.selection().map(AsRef::as_ref),
        segment.nrows(),
    )
}

/// Concatenates partial tables and groups them again with the merge
/// measures.
fn fold(
    ctx: &ExecContext<'_>,
    parts: &[Table],
    keys: &[Arc<str>],
    partials: &[Partial],
) -> Result<Table> {
    let stacked = |name: &str| -> Result<ColumnRef> {
        let columns = parts
            .iter()
            .map(|t| t.flat_column(name))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Column> = columns.iter().map(AsRef::as_ref).collect();
        Ok(Arc::new(Column::concat(&refs)?))
    };
    let nrows = parts.iter().map(Table::nrows).sum();
    let keys = keys
        .iter()
        .map(|name| {
            Ok(GroupKey {
                name: Arc::clone(name),
                column: stacked(name)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let aggs = partials
        .iter()
        .map(|p| {
            Ok(GroupAgg {
                measure: p.merge,
                name: Arc::clone(&p.name),
                column: stacked(&p.name)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    group_columns(ctx, &keys, &aggs, None, nrows)
}

/// Builds the final column of aggregate `i` from its merged partials.
fn recombine(total: &Table, agg: &PartedAgg, partials: &[&Partial]) -> Result<Column> {
    let columns = partials
        .iter()
        .map(|p| total.flat_column(&p.name))
        .collect::<Result<Vec<_>>>()?;
    match (agg.measure, columns.as_slice()) {
        (Measure::Avg, [sum, count]) => moments(agg.measure, sum, None, count),
        (_, [sum, sumsq, count]) => moments(agg.measure, sum, Some(sumsq), count),
        (_, [single]) => Ok(single.as_ref().clone()),
        _ => Err(TesseraError::ValidationError(format!(
            "aggregate '{}' has {} partial columns",
            agg.name,
            columns.len()
        ))),
    }
}

fn moments(measure: Measure, sum: &Column, sumsq: Option<&ColumnRef>, count: &Column) -> Result<Column> {
    let n = count.len();
    let mut values = Vec::with_capacity(n);
    let mut nulls = Vec::with_capacity(n);
    for row in 0..n {
        let valid = if count.is_null(row) { 0 } else { count.i64_at(row) };
        let sum = if sum.is_null(row) { 0.0 } else { sum.f64_at(row) };
        let sumsq = sumsq.map_or(0.0, |c| if c.is_null(row) { 0.0 } else { c.f64_at(row) });
        let value = finish_moments(measure, sum, sumsq, valid);
        values.push(value.unwrap_or(0.0));
        nulls.push(value.is_none());
    }
    Column::new(ColumnData::F64(values)).with_nulls(NullMask::from_flags(&nulls))
}

fn run(
    ctx: &ExecContext<'_>,
    table: &Table,
    bounds: &[usize],
    keys: &[Arc<str>],
    aggs: &[PartedAgg],
    partials: &[Partial],
) -> Result<Option<Table>> {
    let segments = bounds.len() - 1;
    let first = table.segment(0, bounds)?;
    let selected = first.selection().map_or(first.nrows(), |s| s.count());
    let sample = group_segment(ctx, &first, keys, aggs, partials)?;
    if sample.nrows() * MIN_ROWS_PER_GROUP > selected {
        debug!(groups = sample.nrows(), rows = selected, "per-segment group by rejected");
        return Ok(None);
    }
    debug!(segments, groups = sample.nrows(), "group by: per-segment partials");

    let batch = ctx.config.segment_batch;
    let mut parts = vec![sample];
    let mut total: Option<Table> = None;
    let mut seg = 1;
    loop {
        while seg < segments && parts.len() < batch {
            let segment = table.segment(seg, bounds)?;
            parts.push(group_segment(ctx, &segment, keys, aggs, partials)?);
            seg += 1;
        }
        ctx.check_cancelled()?;
        if let Some(running) = total.take() {
            parts.insert(0, running);
        }
        total = Some(fold(ctx, &parts, keys, partials)?);
        parts.clear();
        if seg >= segments {
            break;
        }
    }
    let Some(total) = total else {
        return Ok(None);
    };

    let mut out = Table::new();
    for name in keys {
        out.add_column(name, TableColumn::Flat(total.flat_column(name)?))?;
    }
    for (i, agg) in aggs.iter().enumerate() {
        let mine: Vec<&Partial> = partials.iter().filter(|p| p.agg == i).collect();
        let column = recombine(&total, agg, &mine)?;
        out.add_column(&agg.name, TableColumn::Flat(Arc::new(column)))?;
    }
    Ok(Some(out))
}

/// Groups a segmented table segment by segment. Returns `None` when the
/// table is not segmented, looks too high-cardinality for partials to pay
/// off, or the partials run out of memory; callers then flatten the
/// referenced columns and group them in one pass.
pub(crate) fn group_parted(
    ctx: &ExecContext<'_>,
    table: &Table,
    keys: &[Arc<str>],
    aggs: &[PartedAgg],
) -> Result<Option<Table>> {
    if keys.is_empty() {
        return Ok(None);
    }
    let Some(bounds) = table.segment_bounds()? else {
        return Ok(None);
    };
    if bounds.len() < 3 {
        return Ok(None);
    }
    let partials = decompose(aggs);
    if partials.len() > MAX_AGGREGATES {
        return Ok(None);
    }
    match run(ctx, table, &bounds, keys, aggs, &partials) {
        Err(e) if e.is_out_of_memory() => {
            warn!(error = %e, "per-segment group by out of memory, flattening");
            Ok(None)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ExecutorConfig};
    use crate::storage::{PartedColumn, RowSelection};
    use crate::types::Value;

    fn parted(segments: Vec<Column>) -> TableColumn {
        TableColumn::Parted(PartedColumn::new(segments.into_iter().map(Arc::new).collect()).unwrap())
    }

    fn agg(measure: Measure, column: &str, name: &str) -> PartedAgg {
        PartedAgg {
            measure,
            column: Arc::from(column),
            name: Arc::from(name),
        }
    }

    /// Four segments of 40 rows, keys cycling through 0..4.
    fn table() -> Table {
        let mut t = Table::new();
        let keys = (0..4)
            .map(|s| Column::from_i64((0..40).map(|i| (i + s) % 4).collect()))
            .collect();
        let vals = (0..4)
            .map(|s| Column::from_i64((0..40).map(|i| i64::from(s) * 40 + i).collect()))
            .collect();
        t.add_column("k", parted(keys)).unwrap();
        t.add_column("v", parted(vals)).unwrap();
        t
    }

    fn by_key(table: &Table) -> Vec<Vec<Value>> {
        let mut rows = table.rows().unwrap();
        rows.sort_by_key(|r| r[0].as_i64());
        rows
    }

    #[test]
    fn test_matches_flat_group_by() {
        let aggs = [
            agg(Measure::Sum, "v", "v_sum"),
            agg(Measure::Count, "v", "v_count"),
            agg(Measure::Avg, "v", "v_avg"),
            agg(Measure::Min, "v", "v_min"),
            agg(Measure::First, "v", "v_first"),
            agg(Measure::Last, "v", "v_last"),
            agg(Measure::VarPop, "v", "v_var_pop"),
        ];
        let keys = [Arc::from("k")];
        let table = table();
        for batch in [1, 2, 8] {
            let exec =
                Executor::new(ExecutorConfig::new().with_num_workers(2).with_segment_batch(batch))
                    .unwrap();
            let ctx = exec.context();
            let got = group_parted(&ctx, &table, &keys, &aggs).unwrap().unwrap();
            assert_eq!(got.names()[3].as_ref(), "v_min");

            let flat = table.flatten().unwrap();
            let expected = group_columns(
                &ctx,
                &[GroupKey {
                    name: Arc::from("k"),
                    column: flat.flat_column("k").unwrap(),
                }],
                &aggs
                    .iter()
                    .map(|a| GroupAgg {
                        measure: a.measure,
                        name: Arc::clone(&a.name),
                        column: flat.flat_column("v").unwrap(),
                    })
                    .collect::<Vec<_>>(),
                None,
                flat.nrows(),
            )
            .unwrap();
            let (got, expected) = (by_key(&got), by_key(&expected));
            for (g, e) in got.iter().zip(&expected) {
                assert_eq!(g[..7], e[..7], "batch {batch}");
                let (Some(a), Some(b)) = (g[7].as_f64(), e[7].as_f64()) else {
                    panic!("variance missing");
                };
                assert!((a - b).abs() < 1e-6 * b.abs().max(1.0));
            }
            assert_eq!(got.len(), 4);
        }
    }

    #[test]
    fn test_high_cardinality_is_rejected() {
        let mut t = Table::new();
        t.add_column(
            "k",
            parted(vec![Column::from_i64((0..10).collect()), Column::from_i64((10..20).collect())]),
        )
        .unwrap();
        let exec = Executor::with_defaults().unwrap();
        let out = group_parted(&exec.context(), &t, &[Arc::from("k")], &[agg(Measure::Count, "k", "n")]);
        assert!(out.unwrap().is_none());
    }

    #[test]
    fn test_flat_table_is_ineligible() {
        let t = Table::new().with_column("k", Column::from_i64(vec![1, 1])).unwrap();
        let exec = Executor::with_defaults().unwrap();
        let out = group_parted(&exec.context(), &t, &[Arc::from("k")], &[]).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_selection_applies_per_segment() {
        let table = table();
        let keep: Vec<bool> = (0..160).map(|i| i % 2 == 0).collect();
        let table = table.with_selection(RowSelection::from_predicate(&keep)).unwrap();
        let exec = Executor::with_defaults().unwrap();
        let out = group_parted(
            &exec.context(),
            &table,
            &[Arc::from("k")],
            &[agg(Measure::Count, "v", "n")],
        )
        .unwrap()
        .unwrap();
        let total: i64 = by_key(&out).iter().filter_map(|r| r[1].as_i64()).sum();
        assert_eq!(total, 80);
    }

    #[test]
    fn test_out_of_memory_declines() {
        let exec = Executor::new(ExecutorConfig::new().with_memory_limit(64)).unwrap();
        let out = group_parted(
            &exec.context(),
            &table(),
            &[Arc::from("k")],
            &[agg(Measure::Sum, "v", "s")],
        )
        .unwrap();
        assert!(out.is_none());
    }
}
