//! Typed inner loops shared by the morsel evaluator and the recursive
//! fallback.
//!
//! Every kernel matches on the opcode once and then runs one branch-free loop
//! over the whole batch.

use crate::error::{Result, TesseraError};
use crate::graph::OpCode;
use crate::types::DataType;

/// Working representation of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    I64,
    F64,
    Bool,
}

impl Lane {
    /// Lane a column of `data_type` is evaluated in.
    pub(crate) fn of(data_type: DataType) -> Lane {
        match data_type {
            DataType::F64 => Lane::F64,
            DataType::Bool => Lane::Bool,
            _ => Lane::I64,
        }
    }

    /// Column type produced from a result in this lane.
    pub(crate) fn data_type(self) -> DataType {
        match self {
            Lane::I64 => DataType::I64,
            Lane::F64 => DataType::F64,
            Lane::Bool => DataType::Bool,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Lane::I64 => "I64 lane",
            Lane::F64 => "F64 lane",
            Lane::Bool => "BOOL lane",
        }
    }
}

/// Output lane of a binary operator over operands in lanes `l` and `r`.
pub(crate) fn binary_lane(op: OpCode, l: Lane, r: Lane) -> Result<Lane> {
    match op {
        OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Mod | OpCode::Min2 | OpCode::Max2 => {
            Ok(if l == Lane::F64 || r == Lane::F64 {
                Lane::F64
            } else {
                Lane::I64
            })
        }
        OpCode::Div => Ok(Lane::F64),
        op if op.is_comparison() => Ok(Lane::Bool),
        OpCode::And | OpCode::Or => Ok(Lane::Bool),
        other => Err(unsupported(other)),
    }
}

/// Lane both operands of a binary operator are coerced to before the kernel
/// runs.
pub(crate) fn operand_lane(op: OpCode, l: Lane, r: Lane) -> Result<Lane> {
    match op {
        OpCode::And | OpCode::Or => Ok(Lane::Bool),
        OpCode::Div => Ok(Lane::F64),
        op if op.is_comparison() => Ok(if l == Lane::F64 || r == Lane::F64 {
            Lane::F64
        } else if l == Lane::Bool && r == Lane::Bool {
            Lane::Bool
        } else {
            Lane::I64
        }),
        op => binary_lane(op, l, r),
    }
}

/// Output lane of a unary operator over an operand in lane `a`.
pub(crate) fn unary_lane(op: OpCode, a: Lane) -> Result<Lane> {
    match op {
        OpCode::Neg | OpCode::Abs => Ok(if a == Lane::F64 { Lane::F64 } else { Lane::I64 }),
        OpCode::Not | OpCode::IsNull => Ok(Lane::Bool),
        OpCode::Sqrt | OpCode::Log | OpCode::Exp => Ok(Lane::F64),
        OpCode::Ceil | OpCode::Floor => Ok(if a == Lane::F64 { Lane::F64 } else { Lane::I64 }),
        other => Err(unsupported(other)),
    }
}

pub(crate) fn unsupported(op: OpCode) -> TesseraError {
    TesseraError::NotYetImplemented(format!("{} kernel", op.name()))
}

/// A typed batch input: a slice or a broadcast constant.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Src<'a, T: Copy> {
    Slice(&'a [T]),
    Const(T),
}

/// A register's value for the current batch.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Operand<'a> {
    I64(&'a [i64]),
    F64(&'a [f64]),
    Bool(&'a [bool]),
    ConstI64(i64),
    ConstF64(f64),
    ConstBool(bool),
}

impl<'a> Operand<'a> {
    pub(crate) fn lane(&self) -> Lane {
        match self {
            Operand::I64(_) | Operand::ConstI64(_) => Lane::I64,
            Operand::F64(_) | Operand::ConstF64(_) => Lane::F64,
            Operand::Bool(_) | Operand::ConstBool(_) => Lane::Bool,
        }
    }

    fn mismatch(&self, expected: Lane) -> TesseraError {
        TesseraError::type_error(expected.name(), self.lane().name())
    }

    pub(crate) fn i64s(&self) -> Result<Src<'a, i64>> {
        match *self {
            Operand::I64(s) => Ok(Src::Slice(s)),
            Operand::ConstI64(v) => Ok(Src::Const(v)),
            _ => Err(self.mismatch(Lane::I64)),
        }
    }

    pub(crate) fn f64s(&self) -> Result<Src<'a, f64>> {
        match *self {
            Operand::F64(s) => Ok(Src::Slice(s)),
            Operand::ConstF64(v) => Ok(Src::Const(v)),
            _ => Err(self.mismatch(Lane::F64)),
        }
    }

    pub(crate) fn bools(&self) -> Result<Src<'a, bool>> {
        match *self {
            Operand::Bool(s) => Ok(Src::Slice(s)),
            Operand::ConstBool(v) => Ok(Src::Const(v)),
            _ => Err(self.mismatch(Lane::Bool)),
        }
    }
}

/// Owned buffer in one lane.
#[derive(Debug, Clone)]
pub(crate) enum LaneBuf {
    I64(Vec<i64>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
}

impl LaneBuf {
    pub(crate) fn zeroed(lane: Lane, len: usize) -> Self {
        match lane {
            Lane::I64 => LaneBuf::I64(vec![0; len]),
            Lane::F64 => LaneBuf::F64(vec![0.0; len]),
            Lane::Bool => LaneBuf::Bool(vec![false; len]),
        }
    }

    pub(crate) fn lane(&self) -> Lane {
        match self {
            LaneBuf::I64(_) => Lane::I64,
            LaneBuf::F64(_) => Lane::F64,
            LaneBuf::Bool(_) => Lane::Bool,
        }
    }

    /// Borrows the first `len` elements.
    pub(crate) fn operand(&self, len: usize) -> Operand<'_> {
        match self {
            LaneBuf::I64(v) => Operand::I64(&v[..len]),
            LaneBuf::F64(v) => Operand::F64(&v[..len]),
            LaneBuf::Bool(v) => Operand::Bool(&v[..len]),
        }
    }
}

#[inline]
fn map1<A: Copy, O: Copy>(a: Src<'_, A>, out: &mut [O], f: impl Fn(A) -> O) {
    match a {
        Src::Slice(x) => {
            for (o, &x) in out.iter_mut().zip(x) {
                *o = f(x);
            }
        }
        Src::Const(x) => out.fill(f(x)),
    }
}

#[inline]
fn map2<A: Copy, B: Copy, O: Copy>(
    a: Src<'_, A>,
    b: Src<'_, B>,
    out: &mut [O],
    f: impl Fn(A, B) -> O,
) {
    match (a, b) {
        (Src::Slice(x), Src::Slice(y)) => {
            for ((o, &x), &y) in out.iter_mut().zip(x).zip(y) {
                *o = f(x, y);
            }
        }
        (Src::Slice(x), Src::Const(y)) => {
            for (o, &x) in out.iter_mut().zip(x) {
                *o = f(x, y);
            }
        }
        (Src::Const(x), Src::Slice(y)) => {
            for (o, &y) in out.iter_mut().zip(y) {
                *o = f(x, y);
            }
        }
        (Src::Const(x), Src::Const(y)) => out.fill(f(x, y)),
    }
}

macro_rules! compare {
    ($op:expr, $a:expr, $b:expr, $out:expr) => {
        match $op {
            OpCode::Eq => map2($a, $b, $out, |x, y| x == y),
            OpCode::Ne => map2($a, $b, $out, |x, y| x != y),
            OpCode::Lt => map2($a, $b, $out, |x, y| x < y),
            OpCode::Le => map2($a, $b, $out, |x, y| x <= y),
            OpCode::Gt => map2($a, $b, $out, |x, y| x > y),
            OpCode::Ge => map2($a, $b, $out, |x, y| x >= y),
            other => return Err(unsupported(other)),
        }
    };
}

/// Runs a binary kernel over the first `len` rows, writing into `out`.
///
/// Operands must already be coerced to [`operand_lane`]; `out` must be in
/// [`binary_lane`].
pub(crate) fn binary(
    op: OpCode,
    a: &Operand<'_>,
    b: &Operand<'_>,
    out: &mut LaneBuf,
    len: usize,
) -> Result<()> {
    match out {
        LaneBuf::I64(o) => {
            let (x, y, o) = (a.i64s()?, b.i64s()?, &mut o[..len]);
            match op {
                OpCode::Add => map2(x, y, o, i64::wrapping_add),
                OpCode::Sub => map2(x, y, o, i64::wrapping_sub),
                OpCode::Mul => map2(x, y, o, i64::wrapping_mul),
                OpCode::Mod => map2(x, y, o, |x, y| if y == 0 { 0 } else { x.wrapping_rem(y) }),
                OpCode::Min2 => map2(x, y, o, i64::min),
                OpCode::Max2 => map2(x, y, o, i64::max),
                other => return Err(unsupported(other)),
            }
        }
        LaneBuf::F64(o) => {
            let (x, y, o) = (a.f64s()?, b.f64s()?, &mut o[..len]);
            match op {
                OpCode::Add => map2(x, y, o, |x, y| x + y),
                OpCode::Sub => map2(x, y, o, |x, y| x - y),
                OpCode::Mul => map2(x, y, o, |x, y| x * y),
                OpCode::Div => map2(x, y, o, |x, y| x / y),
                OpCode::Mod => map2(x, y, o, |x, y| x % y),
                OpCode::Min2 => map2(x, y, o, f64::min),
                OpCode::Max2 => map2(x, y, o, f64::max),
                other => return Err(unsupported(other)),
            }
        }
        LaneBuf::Bool(o) => {
            let o = &mut o[..len];
            match (op, a.lane()) {
                (OpCode::And, _) => map2(a.bools()?, b.bools()?, o, |x, y| x && y),
                (OpCode::Or, _) => map2(a.bools()?, b.bools()?, o, |x, y| x || y),
                (_, Lane::I64) => compare!(op, a.i64s()?, b.i64s()?, o),
                (_, Lane::F64) => compare!(op, a.f64s()?, b.f64s()?, o),
                (_, Lane::Bool) => compare!(op, a.bools()?, b.bools()?, o),
            }
        }
    }
    Ok(())
}

/// Runs a unary kernel over the first `len` rows, writing into `out`.
pub(crate) fn unary(op: OpCode, a: &Operand<'_>, out: &mut LaneBuf, len: usize) -> Result<()> {
    match out {
        LaneBuf::I64(o) => {
            let (x, o) = (a.i64s()?, &mut o[..len]);
            match op {
                OpCode::Neg => map1(x, o, i64::wrapping_neg),
                OpCode::Abs => map1(x, o, i64::wrapping_abs),
                OpCode::Ceil | OpCode::Floor => map1(x, o, |x| x),
                other => return Err(unsupported(other)),
            }
        }
        LaneBuf::F64(o) => {
            let (x, o) = (a.f64s()?, &mut o[..len]);
            match op {
                OpCode::Neg => map1(x, o, |x| -x),
                OpCode::Abs => map1(x, o, f64::abs),
                OpCode::Sqrt => map1(x, o, f64::sqrt),
                OpCode::Log => map1(x, o, f64::ln),
                OpCode::Exp => map1(x, o, f64::exp),
                OpCode::Ceil => map1(x, o, f64::ceil),
                OpCode::Floor => map1(x, o, f64::floor),
                other => return Err(unsupported(other)),
            }
        }
        LaneBuf::Bool(o) => {
            let o = &mut o[..len];
            match op {
                OpCode::Not => map1(a.bools()?, o, |x| !x),
                other => return Err(unsupported(other)),
            }
        }
    }
    Ok(())
}

/// Converts the first `len` rows of `a` into `out`'s lane.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub(crate) fn cast(a: &Operand<'_>, out: &mut LaneBuf, len: usize) -> Result<()> {
    match (out, a.lane()) {
        (LaneBuf::I64(o), Lane::I64) => map1(a.i64s()?, &mut o[..len], |x| x),
        (LaneBuf::I64(o), Lane::F64) => map1(a.f64s()?, &mut o[..len], |x| x as i64),
        (LaneBuf::I64(o), Lane::Bool) => map1(a.bools()?, &mut o[..len], i64::from),
        (LaneBuf::F64(o), Lane::I64) => map1(a.i64s()?, &mut o[..len], |x| x as f64),
        (LaneBuf::F64(o), Lane::F64) => map1(a.f64s()?, &mut o[..len], |x| x),
        (LaneBuf::F64(o), Lane::Bool) => map1(a.bools()?, &mut o[..len], |x| f64::from(u8::from(x))),
        (LaneBuf::Bool(o), Lane::I64) => map1(a.i64s()?, &mut o[..len], |x| x != 0),
        (LaneBuf::Bool(o), Lane::F64) => map1(a.f64s()?, &mut o[..len], |x| x != 0.0),
        (LaneBuf::Bool(o), Lane::Bool) => map1(a.bools()?, &mut o[..len], |x| x),
    }
    Ok(())
}
