//! Recursive per-node evaluation for expressions the compiler rejects.
//!
//! Works on whole vectors and atoms, propagates nulls, and handles symbol
//! comparisons by string. Slower than compiled programs but total.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Result, TesseraError};
use crate::graph::OpCode;
use crate::storage::{symbol, Column, ColumnData, NullMask, SymIds};
use crate::types::{DataType, Value};

use super::vectorized::kernels::{self, binary_lane, operand_lane, unary_lane, Lane, LaneBuf, Operand};
use super::Datum;

#[derive(Clone, Copy)]
enum Arg<'a> {
    Column(&'a Column),
    Scalar(&'a Value),
}

impl<'a> Arg<'a> {
    fn of(datum: &'a Datum) -> Result<Self> {
        match datum {
            Datum::Vector(c) => Ok(Arg::Column(c)),
            Datum::Atom(v) => Ok(Arg::Scalar(v)),
            Datum::Table(_) => Err(TesseraError::SchemaError(
                "elementwise operator applied to a table".to_string(),
            )),
        }
    }

    fn data_type(self) -> Option<DataType> {
        match self {
            Arg::Column(c) => Some(c.data_type()),
            Arg::Scalar(v) => v.data_type(),
        }
    }

    fn is_symbolic(self) -> bool {
        self.data_type() == Some(DataType::Symbol)
    }

    fn is_null_atom(self) -> bool {
        matches!(self, Arg::Scalar(Value::Null))
    }

    fn len(self) -> Option<usize> {
        match self {
            Arg::Column(c) => Some(c.len()),
            Arg::Scalar(_) => None,
        }
    }

    fn lane(self) -> Lane {
        Lane::of(self.data_type().unwrap_or(DataType::I64))
    }

    /// Loads the argument in `lane`, broadcasting atoms.
    #[allow(clippy::cast_possible_truncation)]
    fn load(self, lane: Lane, len: usize) -> Result<Loaded> {
        match self {
            Arg::Column(c) => {
                let mut buf = LaneBuf::zeroed(lane, len);
                match &mut buf {
                    LaneBuf::I64(v) => c.load_i64(0, v),
                    LaneBuf::F64(v) => c.load_f64(0, v),
                    LaneBuf::Bool(v) => c.load_bool(0, v),
                }
                Ok(Loaded::Buf(buf))
            }
            Arg::Scalar(value) => {
                let op = match lane {
                    Lane::I64 => value
                        .as_i64()
                        .or_else(|| value.as_f64().map(|f| f as i64))
                        .map(Operand::ConstI64),
                    Lane::F64 => value.as_f64().map(Operand::ConstF64),
                    Lane::Bool => value
                        .as_bool()
                        .or_else(|| value.as_f64().map(|f| f != 0.0))
                        .map(Operand::ConstBool),
                };
                op.map(Loaded::Const).ok_or_else(|| {
                    TesseraError::type_error(lane.data_type().name(), format!("{value:?}"))
                })
            }
        }
    }
}

enum Loaded {
    Buf(LaneBuf),
    Const(Operand<'static>),
}

impl Loaded {
    fn operand(&self, len: usize) -> Operand<'_> {
        match self {
            Loaded::Buf(b) => b.operand(len),
            Loaded::Const(c) => *c,
        }
    }
}

fn broadcast_len(l: Arg<'_>, r: Arg<'_>) -> Result<usize> {
    match (l.len(), r.len()) {
        (Some(x), Some(y)) if x != y => Err(TesseraError::LengthMismatch { left: x, right: y }),
        (Some(x), _) | (_, Some(x)) => Ok(x),
        (None, None) => Ok(1),
    }
}

fn union_nulls(args: &[Arg<'_>], len: usize) -> Option<NullMask> {
    let nullable: Vec<&Column> = args
        .iter()
        .filter_map(|a| match a {
            Arg::Column(c) if c.has_nulls() => Some(*c),
            _ => None,
        })
        .collect();
    if nullable.is_empty() {
        return None;
    }
    let mut mask = NullMask::new(len);
    for i in 0..len {
        if nullable.iter().any(|c| c.is_null(i)) {
            mask.set_null(i);
        }
    }
    Some(mask)
}

fn lane_data(buf: LaneBuf, out_type: DataType) -> ColumnData {
    match buf {
        LaneBuf::I64(v) => ColumnData::from_i64(out_type, v),
        LaneBuf::F64(v) => ColumnData::from_f64(out_type, v),
        LaneBuf::Bool(v) if out_type == DataType::Bool => ColumnData::Bool(v),
        LaneBuf::Bool(v) => ColumnData::from_i64(out_type, v.into_iter().map(i64::from).collect()),
    }
}

fn finish(data: ColumnData, nulls: Option<NullMask>, scalar: bool) -> Result<Datum> {
    let mut column = Column::new(data);
    if let Some(mask) = nulls {
        column = column.with_nulls(mask)?;
    }
    Ok(if scalar {
        Datum::Atom(column.get(0))
    } else {
        Datum::Vector(Arc::new(column))
    })
}

fn all_null(out_type: DataType, len: usize, scalar: bool) -> Result<Datum> {
    if scalar {
        return Ok(Datum::Atom(Value::Null));
    }
    let data = lane_data(LaneBuf::zeroed(Lane::of(out_type), len), out_type);
    finish(data, Some(NullMask::from_flags(&vec![true; len])), false)
}

/// Evaluates a unary elementwise node. `target` is the CAST target type.
pub(crate) fn unary(op: OpCode, target: Option<DataType>, input: &Datum) -> Result<Datum> {
    let a = Arg::of(input)?;
    let scalar = a.len().is_none();
    let len = a.len().unwrap_or(1);
    if op == OpCode::IsNull {
        return Ok(match a {
            Arg::Column(c) => Datum::Vector(Arc::new(Column::from_bool(
                (0..c.len()).map(|i| c.is_null(i)).collect(),
            ))),
            Arg::Scalar(v) => Datum::Atom(Value::Bool(v.is_null())),
        });
    }
    if a.is_null_atom() {
        return Ok(Datum::Atom(Value::Null));
    }
    if op == OpCode::Cast {
        let target = target.ok_or_else(|| {
            TesseraError::DomainError("CAST node without a target type".to_string())
        })?;
        return cast(a, input, target, len, scalar);
    }
    if a.is_symbolic() {
        return Err(TesseraError::type_error("numeric", "SYMBOL"));
    }
    let out = unary_lane(op, a.lane())?;
    let in_lane = match op {
        OpCode::Not => Lane::Bool,
        OpCode::Sqrt | OpCode::Log | OpCode::Exp => Lane::F64,
        _ => out,
    };
    let x = a.load(in_lane, len)?;
    let mut buf = LaneBuf::zeroed(out, len);
    kernels::unary(op, &x.operand(len), &mut buf, len)?;
    finish(lane_data(buf, out.data_type()), union_nulls(&[a], len), scalar)
}

fn cast(a: Arg<'_>, input: &Datum, target: DataType, len: usize, scalar: bool) -> Result<Datum> {
    match (a.data_type(), target) {
        (Some(DataType::Symbol), DataType::Symbol) => return Ok(input.clone()),
        (Some(DataType::Symbol), _) | (_, DataType::Symbol) => {
            return Err(TesseraError::NotYetImplemented(format!(
                "CAST from {} to {target}",
                a.data_type().map_or("NULL", |t| t.name())
            )))
        }
        _ => {}
    }
    let lane = Lane::of(target);
    let x = a.load(lane, len)?;
    let mut buf = LaneBuf::zeroed(lane, len);
    kernels::cast(&x.operand(len), &mut buf, len)?;
    finish(lane_data(buf, target), union_nulls(&[a], len), scalar)
}

/// Evaluates a binary elementwise node.
pub(crate) fn binary(op: OpCode, a: &Datum, b: &Datum) -> Result<Datum> {
    let (l, r) = (Arg::of(a)?, Arg::of(b)?);
    let len = broadcast_len(l, r)?;
    let scalar = l.len().is_none() && r.len().is_none();
    if l.is_null_atom() || r.is_null_atom() {
        let out = binary_lane(op, l.lane(), r.lane())?;
        return all_null(out.data_type(), len, scalar);
    }
    if l.is_symbolic() || r.is_symbolic() {
        return compare_symbols(op, l, r, len, scalar);
    }
    let in_lane = operand_lane(op, l.lane(), r.lane())?;
    let out = binary_lane(op, l.lane(), r.lane())?;
    let x = l.load(in_lane, len)?;
    let y = r.load(in_lane, len)?;
    let mut buf = LaneBuf::zeroed(out, len);
    kernels::binary(op, &x.operand(len), &y.operand(len), &mut buf, len)?;
    finish(lane_data(buf, out.data_type()), union_nulls(&[l, r], len), scalar)
}

enum SymKey<'a> {
    Ids(&'a SymIds),
    Lit { id: Option<u64>, text: &'a str },
}

impl<'a> SymKey<'a> {
    fn of(arg: Arg<'a>) -> Result<Self> {
        match arg {
            Arg::Column(c) => match c.data() {
                ColumnData::Symbol(ids) => Ok(SymKey::Ids(ids)),
                other => Err(TesseraError::type_error("SYMBOL", other.data_type().name())),
            },
            Arg::Scalar(Value::Str(s)) => Ok(SymKey::Lit {
                id: symbol::lookup(s),
                text: s,
            }),
            Arg::Scalar(other) => Err(TesseraError::type_error("SYMBOL", format!("{other:?}"))),
        }
    }

    fn id(&self, i: usize) -> Option<u64> {
        match self {
            SymKey::Ids(ids) => Some(ids.get(i)),
            SymKey::Lit { id, .. } => *id,
        }
    }
}

fn compare_symbols(op: OpCode, l: Arg<'_>, r: Arg<'_>, len: usize, scalar: bool) -> Result<Datum> {
    if !op.is_comparison() {
        return Err(TesseraError::type_error("numeric", "SYMBOL"));
    }
    let (x, y) = (SymKey::of(l)?, SymKey::of(r)?);
    let dict = symbol::global().read();
    let text_at = |k: &SymKey<'_>, i: usize| -> Arc<str> {
        match k {
            SymKey::Ids(ids) => dict.resolve(ids.get(i)).cloned().unwrap_or_else(|| Arc::from("")),
            SymKey::Lit { text, .. } => Arc::from(*text),
        }
    };
    let out: Vec<bool> = (0..len)
        .map(|i| {
            let equal = match (&x, &y) {
                (SymKey::Lit { text: a, .. }, SymKey::Lit { text: b, .. }) => a == b,
                _ => x.id(i).is_some() && x.id(i) == y.id(i),
            };
            match op {
                OpCode::Eq => equal,
                OpCode::Ne => !equal,
                _ => {
                    let ord = if equal {
                        Ordering::Equal
                    } else {
                        text_at(&x, i).cmp(&text_at(&y, i))
                    };
                    match op {
                        OpCode::Lt => ord == Ordering::Less,
                        OpCode::Le => ord != Ordering::Greater,
                        OpCode::Gt => ord == Ordering::Greater,
                        _ => ord != Ordering::Less,
                    }
                }
            }
        })
        .collect();
    drop(dict);
    finish(ColumnData::Bool(out), union_nulls(&[l, r], len), scalar)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(c: Column) -> Datum {
        Datum::Vector(Arc::new(c))
    }

    #[test]
    fn test_nulls_propagate() {
        let a = vector(
            Column::from_values(DataType::I64, &[Value::I64(1), Value::Null, Value::I64(3)]).unwrap(),
        );
        let out = binary(OpCode::Add, &a, &Datum::Atom(Value::I64(10))).unwrap();
        let v = out.as_vector().unwrap();
        assert_eq!(v.values(), vec![Value::I64(11), Value::Null, Value::I64(13)]);
    }

    #[test]
    fn test_length_mismatch() {
        let a = vector(Column::from_i64(vec![1, 2]));
        let b = vector(Column::from_i64(vec![1, 2, 3]));
        assert!(matches!(
            binary(OpCode::Add, &a, &b),
            Err(TesseraError::LengthMismatch { left: 2, right: 3 })
        ));
    }

    #[test]
    fn test_atoms_stay_atoms() {
        let out = binary(OpCode::Div, &Datum::Atom(Value::I64(7)), &Datum::Atom(Value::I64(2))).unwrap();
        assert_eq!(out.as_atom(), Some(&Value::F64(3.5)));
        let out = binary(OpCode::Mul, &Datum::Atom(Value::Null), &Datum::Atom(Value::I64(2))).unwrap();
        assert_eq!(out.as_atom(), Some(&Value::Null));
    }

    #[test]
    fn test_symbol_ordering_is_lexical() {
        let s = vector(Column::from_symbols(&["pear", "apple", "zebra"]));
        let out = binary(OpCode::Lt, &s, &Datum::Atom(Value::str("orange"))).unwrap();
        assert_eq!(
            out.as_vector().unwrap().values(),
            vec![Value::Bool(false), Value::Bool(true), Value::Bool(false)]
        );
        let out = binary(OpCode::Eq, &s, &Datum::Atom(Value::str("no-such-symbol"))).unwrap();
        assert!(out
            .as_vector()
            .unwrap()
            .values()
            .iter()
            .all(|v| *v == Value::Bool(false)));
    }

    #[test]
    fn test_is_null_and_cast() {
        let a = vector(Column::from_values(DataType::F64, &[Value::F64(2.9), Value::Null]).unwrap());
        let nulls = unary(OpCode::IsNull, None, &a).unwrap();
        assert_eq!(
            nulls.as_vector().unwrap().values(),
            vec![Value::Bool(false), Value::Bool(true)]
        );
        let cast = unary(OpCode::Cast, Some(DataType::I16), &a).unwrap();
        assert_eq!(cast.as_vector().unwrap().values(), vec![Value::I16(2), Value::Null]);
    }

    #[test]
    fn test_arithmetic_on_symbols_is_type_error() {
        let s = vector(Column::from_symbols(&["a"]));
        assert!(matches!(
            binary(OpCode::Add, &s, &Datum::Atom(Value::I64(1))),
            Err(TesseraError::TypeError { .. })
        ));
    }
}
