//! Morsel-driven evaluation of compiled programs.

use rayon::prelude::*;

use crate::error::Result;
use crate::executor::context::ExecContext;
use crate::pool::{DISPATCH_MORSELS, MORSEL_SIZE};
use crate::storage::{Column, ColumnData, Table};

use super::batch::{bind, Binding, Scratch};
use super::compiler::{Instr, Program};
use super::kernels::{self, LaneBuf, Operand, Src};

/// Evaluates one batch of `len` rows starting at segment row `start` and
/// returns the output register's value.
fn eval_batch<'a>(
    program: &Program,
    bindings: &'a [Option<Binding<'a>>],
    scratch: &'a mut Scratch,
    start: usize,
    len: usize,
) -> Result<Operand<'a>> {
    scratch.load(bindings, start, len);
    for instr in &program.instrs {
        let dst = match *instr {
            Instr::Unary { dst, .. } | Instr::Binary { dst, .. } | Instr::Cast { dst, .. } => dst,
        };
        let mut out = scratch.take(dst);
        let s: &Scratch = scratch;
        let result = match *instr {
            Instr::Unary { op, src, .. } => {
                kernels::unary(op, &s.operand(program, bindings, src, start, len), &mut out, len)
            }
            Instr::Binary { op, lhs, rhs, .. } => kernels::binary(
                op,
                &s.operand(program, bindings, lhs, start, len),
                &s.operand(program, bindings, rhs, start, len),
                &mut out,
                len,
            ),
            Instr::Cast { src, .. } => {
                kernels::cast(&s.operand(program, bindings, src, start, len), &mut out, len)
            }
        };
        scratch.put(dst, out);
        result?;
    }
    let scratch: &'a Scratch = scratch;
    Ok(scratch.operand(program, bindings, program.output, start, len))
}

/// Output element types a program can write.
trait LaneElem: Copy + Send + Sync {
    fn write(op: &Operand<'_>, out: &mut [Self]) -> Result<()>;
}

fn write_src<T: Copy>(src: Src<'_, T>, out: &mut [T]) {
    match src {
        Src::Slice(s) => out.copy_from_slice(s),
        Src::Const(v) => out.fill(v),
    }
}

impl LaneElem for i64 {
    fn write(op: &Operand<'_>, out: &mut [Self]) -> Result<()> {
        write_src(op.i64s()?, out);
        Ok(())
    }
}

impl LaneElem for f64 {
    fn write(op: &Operand<'_>, out: &mut [Self]) -> Result<()> {
        write_src(op.f64s()?, out);
        Ok(())
    }
}

impl LaneElem for bool {
    fn write(op: &Operand<'_>, out: &mut [Self]) -> Result<()> {
        write_src(op.bools()?, out);
        Ok(())
    }
}

fn fill<T: LaneElem>(
    ctx: &ExecContext<'_>,
    program: &Program,
    bindings: &[Option<Binding<'_>>],
    out: &mut [T],
) -> Result<()> {
    if ctx.workers_for(out.len()) <= 1 {
        let mut scratch = Scratch::new(program);
        for (i, morsel) in out.chunks_mut(MORSEL_SIZE).enumerate() {
            let op = eval_batch(program, bindings, &mut scratch, i * MORSEL_SIZE, morsel.len())?;
            T::write(&op, morsel)?;
        }
        return Ok(());
    }
    let chunk = MORSEL_SIZE * DISPATCH_MORSELS;
    ctx.pool.install(|| {
        out.par_chunks_mut(chunk).enumerate().try_for_each_init(
            || Scratch::new(program),
            |scratch, (c, rows)| {
                for (i, morsel) in rows.chunks_mut(MORSEL_SIZE).enumerate() {
                    let start = c * chunk + i * MORSEL_SIZE;
                    let op = eval_batch(program, bindings, scratch, start, morsel.len())?;
                    T::write(&op, morsel)?;
                }
                Ok(())
            },
        )
    })
}

/// Evaluates `program` over every physical row of `table`.
///
/// Parted tables are evaluated one segment at a time with the column
/// registers re-bound to each segment's buffers.
pub(crate) fn evaluate(ctx: &ExecContext<'_>, program: &Program, table: &Table) -> Result<Column> {
    let nrows = table.nrows();
    let bounds = table.segment_bounds()?;
    let segments: Vec<(usize, usize)> = match &bounds {
        Some(b) => b.windows(2).map(|w| (w[0], w[1])).collect(),
        None => vec![(0, nrows)],
    };
    let mut out = LaneBuf::zeroed(program.out_lane(), nrows);
    for (seg, &(start, end)) in segments.iter().enumerate() {
        let bindings = bind(program, table, seg, bounds.as_deref())?;
        match &mut out {
            LaneBuf::I64(v) => fill(ctx, program, &bindings, &mut v[start..end])?,
            LaneBuf::F64(v) => fill(ctx, program, &bindings, &mut v[start..end])?,
            LaneBuf::Bool(v) => fill(ctx, program, &bindings, &mut v[start..end])?,
        }
    }
    let out_type = program.out_type();
    let data = match out {
        LaneBuf::I64(v) => ColumnData::from_i64(out_type, v),
        LaneBuf::F64(v) => ColumnData::from_f64(out_type, v),
        LaneBuf::Bool(v) => ColumnData::Bool(v),
    };
    Ok(Column::new(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ExecutorConfig};
    use crate::graph::Graph;
    use crate::storage::{PartedColumn, TableColumn};
    use crate::types::{DataType, Value};
    use crate::executor::vectorized::compile;
    use std::sync::Arc;

    #[test]
    fn test_evaluate_across_morsels_in_parallel() {
        let n = 200_000;
        let table = Table::new()
            .with_column("a", Column::from_i64((0..n).collect()))
            .unwrap()
            .with_column("b", Column::from_i32((0..n as i32).map(|v| v % 7).collect()))
            .unwrap();
        let mut g = Graph::with_table(table.clone());
        let a = g.scan("a");
        let b = g.scan("b");
        let two = g.const_value(Value::I64(2));
        let prod = g.mul(a, two);
        let expr = g.add(prod, b);
        let program = compile(&g, expr, &table).unwrap();

        let exec = Executor::new(ExecutorConfig::new().with_num_workers(4)).unwrap();
        let out = evaluate(&exec.context(), &program, &table).unwrap();
        assert_eq!(out.data_type(), DataType::I64);
        let values = out.as_i64_slice().unwrap();
        for i in [0usize, 1023, 1024, 99_999, 199_999] {
            assert_eq!(values[i], 2 * i as i64 + (i as i64 % 7));
        }
    }

    #[test]
    fn test_evaluate_parted_rebinds_segments() {
        let parted = PartedColumn::new(vec![
            Arc::new(Column::from_f64(vec![1.0, 4.0])),
            Arc::new(Column::from_f64(vec![9.0])),
        ])
        .unwrap();
        let mut table = Table::new();
        table.add_column("x", TableColumn::Parted(parted)).unwrap();
        let mut g = Graph::with_table(table.clone());
        let x = g.scan("x");
        let root = g.sqrt(x);
        let program = compile(&g, root, &table).unwrap();
        let exec = Executor::new(ExecutorConfig::new().with_num_workers(1)).unwrap();
        let out = evaluate(&exec.context(), &program, &table).unwrap();
        assert_eq!(out.as_f64_slice().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_cast_root_keeps_target_type() {
        let table = Table::new()
            .with_column("f", Column::from_f64(vec![1.7, -2.2]))
            .unwrap();
        let mut g = Graph::with_table(table.clone());
        let f = g.scan("f");
        let root = g.cast(f, DataType::I32);
        let program = compile(&g, root, &table).unwrap();
        let exec = Executor::new(ExecutorConfig::new().with_num_workers(1)).unwrap();
        let out = evaluate(&exec.context(), &program, &table).unwrap();
        assert_eq!(out.values(), vec![Value::I32(1), Value::I32(-2)]);
    }
}
