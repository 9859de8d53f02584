//! Per-worker batch state: register bindings and scratch buffers.

use crate::error::{Result, TesseraError};
use crate::pool::MORSEL_SIZE;
use crate::storage::{Column, Table, TableColumn};

use super::compiler::{ConstValue, Program, RegKind};
use super::kernels::{Lane, LaneBuf, Operand};

/// A column register bound to one segment's buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Binding<'a> {
    pub(crate) column: &'a Column,
    /// Row of `column` that batch row 0 of the segment maps to.
    pub(crate) offset: usize,
    /// The buffer is already in the register's lane and is borrowed directly.
    pub(crate) direct: bool,
}

fn is_direct(column: &Column, lane: Lane) -> bool {
    match lane {
        Lane::I64 => column.as_i64_slice().is_some(),
        Lane::F64 => column.as_f64_slice().is_some(),
        Lane::Bool => column.as_bool_slice().is_some(),
    }
}

/// Binds every column register of `program` to segment `seg` of `table`.
///
/// `bounds` is `None` for a flat table, in which case `seg` must be 0.
pub(crate) fn bind<'a>(
    program: &Program,
    table: &'a Table,
    seg: usize,
    bounds: Option<&[usize]>,
) -> Result<Vec<Option<Binding<'a>>>> {
    program
        .registers
        .iter()
        .map(|register| {
            let RegKind::Column(index) = register.kind else {
                return Ok(None);
            };
            let column = table.column_at(index).ok_or_else(|| {
                TesseraError::SchemaError(format!("column {index} is not in the table"))
            })?;
            let (column, offset) = match (column, bounds) {
                (TableColumn::Flat(c), None) => (&**c, 0),
                (TableColumn::Flat(c), Some(b)) => (&**c, b[seg]),
                (TableColumn::Parted(p), _) => (&*p.segments()[seg], 0),
                (TableColumn::MapCommon(_), _) => {
                    return Err(TesseraError::SchemaError(
                        "constant-run column bound to a compiled program".to_string(),
                    ))
                }
            };
            Ok(Some(Binding {
                column,
                offset,
                direct: is_direct(column, register.lane),
            }))
        })
        .collect()
}

/// One worker's scratch registers, each one morsel long.
#[derive(Debug)]
pub(crate) struct Scratch {
    bufs: Vec<LaneBuf>,
}

impl Scratch {
    pub(crate) fn new(program: &Program) -> Self {
        let bufs = program
            .registers
            .iter()
            .map(|r| match r.kind {
                RegKind::Const(_) => LaneBuf::zeroed(r.lane, 0),
                RegKind::Column(_) | RegKind::Scratch => LaneBuf::zeroed(r.lane, MORSEL_SIZE),
            })
            .collect();
        Self { bufs }
    }

    /// Converts every non-direct column register's rows for the batch
    /// starting at segment row `start`.
    pub(crate) fn load(&mut self, bindings: &[Option<Binding<'_>>], start: usize, len: usize) {
        for (buf, binding) in self.bufs.iter_mut().zip(bindings) {
            let Some(b) = binding.filter(|b| !b.direct) else {
                continue;
            };
            let at = b.offset + start;
            match buf {
                LaneBuf::I64(v) => b.column.load_i64(at, &mut v[..len]),
                LaneBuf::F64(v) => b.column.load_f64(at, &mut v[..len]),
                LaneBuf::Bool(v) => b.column.load_bool(at, &mut v[..len]),
            }
        }
    }

    pub(crate) fn take(&mut self, reg: usize) -> LaneBuf {
        let lane = self.bufs[reg].lane();
        std::mem::replace(&mut self.bufs[reg], LaneBuf::zeroed(lane, 0))
    }

    pub(crate) fn put(&mut self, reg: usize, buf: LaneBuf) {
        self.bufs[reg] = buf;
    }

    /// Returns register `reg`'s value for the current batch.
    pub(crate) fn operand<'a>(
        &'a self,
        program: &Program,
        bindings: &'a [Option<Binding<'a>>],
        reg: usize,
        start: usize,
        len: usize,
    ) -> Operand<'a> {
        let register = &program.registers[reg];
        match register.kind {
            RegKind::Const(ConstValue::I64(v)) => Operand::ConstI64(v),
            RegKind::Const(ConstValue::F64(v)) => Operand::ConstF64(v),
            RegKind::Const(ConstValue::Bool(v)) => Operand::ConstBool(v),
            RegKind::Column(_) => match bindings[reg] {
                Some(b) if b.direct => {
                    let range = b.offset + start..b.offset + start + len;
                    match register.lane {
                        Lane::I64 => b.column.as_i64_slice().map(|s| Operand::I64(&s[range])),
                        Lane::F64 => b.column.as_f64_slice().map(|s| Operand::F64(&s[range])),
                        Lane::Bool => b.column.as_bool_slice().map(|s| Operand::Bool(&s[range])),
                    }
                    .unwrap_or_else(|| self.bufs[reg].operand(len))
                }
                _ => self.bufs[reg].operand(len),
            },
            RegKind::Scratch => self.bufs[reg].operand(len),
        }
    }
}
