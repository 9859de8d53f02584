//! Per-group accumulator sets.
//!
//! The accumulators a query needs are chosen once from its aggregate list:
//! every requested measure maps to one tagged [`Acc`] variant holding only
//! the arrays that measure reads. All arrays are drawn from the memory arena
//! so that an oversized group space surfaces as a recoverable out-of-memory
//! error.

use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{Result, TesseraError};
use crate::graph::AggregateFunction;
use crate::storage::{Column, ColumnData, MemoryArena, NullMask, ScratchVec};
use crate::types::DataType;

/// What one output column of a GROUP BY computes.
///
/// `CountValid` and `SumSq` never appear in a query; they are the partial
/// measures AVG and the variance family decompose into when partial results
/// are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Measure {
    Count,
    CountValid,
    Sum,
    SumSq,
    Min,
    Max,
    First,
    Last,
    Avg,
    Var,
    VarPop,
    Stddev,
    StddevPop,
}

impl From<AggregateFunction> for Measure {
    fn from(func: AggregateFunction) -> Self {
        match func {
            AggregateFunction::Sum => Measure::Sum,
            AggregateFunction::Count => Measure::Count,
            AggregateFunction::Avg => Measure::Avg,
            AggregateFunction::Min => Measure::Min,
            AggregateFunction::Max => Measure::Max,
            AggregateFunction::First => Measure::First,
            AggregateFunction::Last => Measure::Last,
            AggregateFunction::Var => Measure::Var,
            AggregateFunction::VarPop => Measure::VarPop,
            AggregateFunction::Stddev => Measure::Stddev,
            AggregateFunction::StddevPop => Measure::StddevPop,
        }
    }
}

impl Measure {
    pub(crate) fn output_type(self, input: DataType) -> DataType {
        match self {
            Measure::Count | Measure::CountValid => DataType::I64,
            Measure::SumSq
            | Measure::Avg
            | Measure::Var
            | Measure::VarPop
            | Measure::Stddev
            | Measure::StddevPop => DataType::F64,
            Measure::Sum if input == DataType::F64 => DataType::F64,
            Measure::Sum => DataType::I64,
            Measure::Min | Measure::Max | Measure::First | Measure::Last => input,
        }
    }

    /// True if the measure needs numeric input values.
    fn is_arithmetic(self) -> bool {
        !matches!(
            self,
            Measure::Count | Measure::CountValid | Measure::First | Measure::Last
        )
    }

    /// Relative per-group footprint, used to size dense accumulators.
    pub(crate) fn cost_units(self, minmax_weight: usize) -> usize {
        match self {
            Measure::Count => 0,
            Measure::Min | Measure::Max => minmax_weight,
            Measure::Avg | Measure::Var | Measure::VarPop | Measure::Stddev | Measure::StddevPop => 2,
            _ => 1,
        }
    }
}

/// One aggregate as the accumulators see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AggPlan {
    pub(crate) measure: Measure,
    pub(crate) input_type: DataType,
}

impl AggPlan {
    pub(crate) fn new(measure: Measure, input_type: DataType) -> Result<Self> {
        if measure.is_arithmetic() && input_type == DataType::Symbol {
            return Err(TesseraError::type_error("numeric input", "SYMBOL"));
        }
        Ok(Self {
            measure,
            input_type,
        })
    }

    pub(crate) fn output_type(&self) -> DataType {
        self.measure.output_type(self.input_type)
    }

    /// True if input words carry f64 bits rather than i64 values.
    pub(crate) fn float_input(&self) -> bool {
        self.input_type == DataType::F64
    }
}

/// Reads aggregate input rows as 64-bit words.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AggInput<'a> {
    column: &'a Column,
    float: bool,
}

impl<'a> AggInput<'a> {
    pub(crate) fn new(column: &'a Column) -> Self {
        Self {
            column,
            float: column.data_type() == DataType::F64,
        }
    }

    /// Word of `row` and whether the row is null.
    #[inline]
    #[allow(clippy::cast_sign_loss)]
    pub(crate) fn word(&self, row: usize) -> (u64, bool) {
        let word = if self.float {
            self.column.f64_at(row).to_bits()
        } else {
            self.column.i64_at(row) as u64
        };
        (word, self.column.is_null(row))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReduceOp {
    Sum,
    SumSq,
    Min,
    Max,
    First,
    Last,
}

impl ReduceOp {
    fn of(measure: Measure) -> Self {
        match measure {
            Measure::SumSq => ReduceOp::SumSq,
            Measure::Min => ReduceOp::Min,
            Measure::Max => ReduceOp::Max,
            Measure::First => ReduceOp::First,
            Measure::Last => ReduceOp::Last,
            _ => ReduceOp::Sum,
        }
    }
}

#[derive(Debug)]
enum Acc {
    /// COUNT reads the shared row counter.
    Rows,
    Valid(ScratchVec<i64>),
    Int {
        op: ReduceOp,
        vals: ScratchVec<i64>,
        n: ScratchVec<i64>,
    },
    Float {
        op: ReduceOp,
        vals: ScratchVec<f64>,
        n: ScratchVec<i64>,
        from_int: bool,
    },
    Moments {
        sum: ScratchVec<f64>,
        sumsq: ScratchVec<f64>,
        n: ScratchVec<i64>,
        from_int: bool,
    },
}

#[inline]
#[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
fn as_f64(word: u64, from_int: bool) -> f64 {
    if from_int {
        word as i64 as f64
    } else {
        f64::from_bits(word)
    }
}

#[inline]
fn reduce_i64(op: ReduceOp, first: bool, acc: &mut i64, v: i64) {
    match op {
        ReduceOp::Sum | ReduceOp::SumSq => *acc = acc.wrapping_add(v),
        ReduceOp::Min => *acc = if first { v } else { (*acc).min(v) },
        ReduceOp::Max => *acc = if first { v } else { (*acc).max(v) },
        ReduceOp::First => {
            if first {
                *acc = v;
            }
        }
        ReduceOp::Last => *acc = v,
    }
}

#[inline]
fn reduce_f64(op: ReduceOp, first: bool, acc: &mut f64, v: f64) {
    match op {
        ReduceOp::Sum => *acc += v,
        ReduceOp::SumSq => *acc += v * v,
        ReduceOp::Min => *acc = if first { v } else { acc.min(v) },
        ReduceOp::Max => *acc = if first { v } else { acc.max(v) },
        ReduceOp::First => {
            if first {
                *acc = v;
            }
        }
        ReduceOp::Last => *acc = v,
    }
}

/// Merges one partial value into another. SumSq partials merge by addition.
#[inline]
fn merge_f64(op: ReduceOp, first: bool, acc: &mut f64, v: f64) {
    if op == ReduceOp::SumSq {
        *acc += v;
    } else {
        reduce_f64(op, first, acc, v);
    }
}

/// Variance family and AVG from running moments; None when undefined.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn finish_moments(measure: Measure, sum: f64, sumsq: f64, n: i64) -> Option<f64> {
    if n == 0 {
        return None;
    }
    let nf = n as f64;
    if measure == Measure::Avg {
        return Some(sum / nf);
    }
    let sample = matches!(measure, Measure::Var | Measure::Stddev);
    if sample && n < 2 {
        return None;
    }
    let m2 = (sumsq - sum * sum / nf).max(0.0);
    let var = if sample { m2 / (nf - 1.0) } else { m2 / nf };
    Some(match measure {
        Measure::Stddev | Measure::StddevPop => var.sqrt(),
        _ => var,
    })
}

fn null_column(data: ColumnData, valid: impl Iterator<Item = bool>) -> Result<Column> {
    let flags: Vec<bool> = valid.map(|v| !v).collect();
    Column::new(data).with_nulls(NullMask::from_flags(&flags))
}

impl Acc {
    fn new(arena: &Arc<MemoryArena>, plan: &AggPlan, groups: usize) -> Result<Self> {
        let from_int = !plan.float_input();
        let counts = |arena: &Arc<MemoryArena>| arena.alloc(groups, 0i64, "group accumulators");
        Ok(match plan.measure {
            Measure::Count => Acc::Rows,
            Measure::CountValid => Acc::Valid(counts(arena)?),
            Measure::Avg
            | Measure::Var
            | Measure::VarPop
            | Measure::Stddev
            | Measure::StddevPop => Acc::Moments {
                sum: arena.alloc(groups, 0.0, "group accumulators")?,
                sumsq: arena.alloc(groups, 0.0, "group accumulators")?,
                n: counts(arena)?,
                from_int,
            },
            Measure::SumSq => Acc::Float {
                op: ReduceOp::SumSq,
                vals: arena.alloc(groups, 0.0, "group accumulators")?,
                n: counts(arena)?,
                from_int,
            },
            m if plan.float_input() => Acc::Float {
                op: ReduceOp::of(m),
                vals: arena.alloc(groups, 0.0, "group accumulators")?,
                n: counts(arena)?,
                from_int: false,
            },
            m => Acc::Int {
                op: ReduceOp::of(m),
                vals: counts(arena)?,
                n: counts(arena)?,
            },
        })
    }

    fn resize(&mut self, groups: usize) -> Result<()> {
        match self {
            Acc::Rows => {}
            Acc::Valid(n) => n.try_resize(groups, 0)?,
            Acc::Int { vals, n, .. } => {
                vals.try_resize(groups, 0)?;
                n.try_resize(groups, 0)?;
            }
            Acc::Float { vals, n, .. } => {
                vals.try_resize(groups, 0.0)?;
                n.try_resize(groups, 0)?;
            }
            Acc::Moments { sum, sumsq, n, .. } => {
                sum.try_resize(groups, 0.0)?;
                sumsq.try_resize(groups, 0.0)?;
                n.try_resize(groups, 0)?;
            }
        }
        Ok(())
    }

    #[inline]
    #[allow(clippy::cast_possible_wrap)]
    fn update(&mut self, g: usize, word: u64) {
        match self {
            Acc::Rows => {}
            Acc::Valid(n) => n[g] += 1,
            Acc::Int { op, vals, n } => {
                reduce_i64(*op, n[g] == 0, &mut vals[g], word as i64);
                n[g] += 1;
            }
            Acc::Float {
                op,
                vals,
                n,
                from_int,
            } => {
                reduce_f64(*op, n[g] == 0, &mut vals[g], as_f64(word, *from_int));
                n[g] += 1;
            }
            Acc::Moments {
                sum,
                sumsq,
                n,
                from_int,
            } => {
                let v = as_f64(word, *from_int);
                sum[g] += v;
                sumsq[g] += v * v;
                n[g] += 1;
            }
        }
    }

    /// Merges group `og` of `other` into group `g`. `other` holds rows that
    /// come after the rows already in `self`.
    #[inline]
    fn merge(&mut self, g: usize, other: &Acc, og: usize) {
        match (self, other) {
            (Acc::Valid(n), Acc::Valid(on)) => n[g] += on[og],
            (Acc::Int { op, vals, n }, Acc::Int { vals: ov, n: on, .. }) => {
                if on[og] > 0 {
                    reduce_i64(*op, n[g] == 0, &mut vals[g], ov[og]);
                    n[g] += on[og];
                }
            }
            (Acc::Float { op, vals, n, .. }, Acc::Float { vals: ov, n: on, .. }) => {
                if on[og] > 0 {
                    merge_f64(*op, n[g] == 0, &mut vals[g], ov[og]);
                    n[g] += on[og];
                }
            }
            (
                Acc::Moments { sum, sumsq, n, .. },
                Acc::Moments {
                    sum: os,
                    sumsq: osq,
                    n: on,
                    ..
                },
            ) => {
                sum[g] += os[og];
                sumsq[g] += osq[og];
                n[g] += on[og];
            }
            _ => {}
        }
    }

    fn merge_dense(&mut self, other: &Acc) {
        let groups = match other {
            Acc::Rows => 0,
            Acc::Valid(n) | Acc::Int { n, .. } | Acc::Float { n, .. } | Acc::Moments { n, .. } => {
                n.len()
            }
        };
        for g in 0..groups {
            self.merge(g, other, g);
        }
    }

    fn finish(&self, plan: &AggPlan, rows: &[i64], groups: &[u32]) -> Result<Column> {
        let at = |g: &u32| *g as usize;
        match self {
            Acc::Rows => Ok(Column::from_i64(groups.iter().map(|g| rows[at(g)]).collect())),
            Acc::Valid(n) => Ok(Column::from_i64(groups.iter().map(|g| n[at(g)]).collect())),
            Acc::Int { vals, n, .. } => {
                let data = ColumnData::from_i64(
                    plan.output_type(),
                    groups.iter().map(|g| vals[at(g)]).collect(),
                );
                null_column(data, groups.iter().map(|g| n[at(g)] > 0))
            }
            Acc::Float { vals, n, .. } => {
                let data = ColumnData::F64(groups.iter().map(|g| vals[at(g)]).collect());
                null_column(data, groups.iter().map(|g| n[at(g)] > 0))
            }
            Acc::Moments { sum, sumsq, n, .. } => {
                let out: Vec<Option<f64>> = groups
                    .iter()
                    .map(|g| finish_moments(plan.measure, sum[at(g)], sumsq[at(g)], n[at(g)]))
                    .collect();
                let data = ColumnData::F64(out.iter().map(|v| v.unwrap_or(0.0)).collect());
                null_column(data, out.iter().map(Option::is_some))
            }
        }
    }
}

/// Accumulators of every aggregate plus the per-group row count.
#[derive(Debug)]
pub(crate) struct AccSet {
    rows: ScratchVec<i64>,
    accs: Vec<Acc>,
}

impl AccSet {
    pub(crate) fn new(arena: &Arc<MemoryArena>, plans: &[AggPlan], groups: usize) -> Result<Self> {
        Ok(Self {
            rows: arena.alloc(groups, 0i64, "group row counts")?,
            accs: plans
                .iter()
                .map(|p| Acc::new(arena, p, groups))
                .collect::<Result<_>>()?,
        })
    }

    pub(crate) fn groups(&self) -> usize {
        self.rows.len()
    }

    /// Row count of group `g`.
    pub(crate) fn rows(&self, g: usize) -> i64 {
        self.rows[g]
    }

    /// Makes room for `groups` groups, doubling the capacity when full.
    pub(crate) fn ensure(&mut self, groups: usize) -> Result<()> {
        if groups <= self.rows.len() {
            return Ok(());
        }
        let target = groups.max(self.rows.len() * 2).max(16);
        self.rows.try_resize(target, 0)?;
        for acc in &mut self.accs {
            acc.resize(target)?;
        }
        Ok(())
    }

    /// Counts one row into group `g`.
    #[inline]
    pub(crate) fn add_row(&mut self, g: usize) {
        self.rows[g] += 1;
    }

    /// Feeds aggregate `j` of group `g`; null inputs are skipped.
    #[inline]
    pub(crate) fn update(&mut self, g: usize, j: usize, word: u64, null: bool) {
        if !null {
            self.accs[j].update(g, word);
        }
    }

    /// Merges group `og` of `other` into group `g`.
    pub(crate) fn merge_group(&mut self, g: usize, other: &AccSet, og: usize) {
        self.rows[g] += other.rows[og];
        for (acc, o) in self.accs.iter_mut().zip(&other.accs) {
            acc.merge(g, o, og);
        }
    }

    /// Merges every group of an equally sized set, one accumulator per task
    /// when `parallel` is set.
    pub(crate) fn merge_dense(&mut self, other: &AccSet, parallel: bool) {
        for (r, o) in self.rows.iter_mut().zip(other.rows.iter()) {
            *r += o;
        }
        if parallel {
            self.accs
                .par_iter_mut()
                .zip(other.accs.par_iter())
                .for_each(|(acc, o)| acc.merge_dense(o));
        } else {
            for (acc, o) in self.accs.iter_mut().zip(&other.accs) {
                acc.merge_dense(o);
            }
        }
    }

    /// Final aggregate columns for `groups`, in that order.
    pub(crate) fn finish(&self, plans: &[AggPlan], groups: &[u32]) -> Result<Vec<Column>> {
        self.accs
            .iter()
            .zip(plans)
            .map(|(acc, plan)| acc.finish(plan, &self.rows, groups))
            .collect()
    }
}
