//! Lowers an elementwise operator sub-tree into a flat register program.
//!
//! A program has at most [`MAX_REGISTERS`] registers and
//! [`MAX_INSTRUCTIONS`] instructions. Anything the compiler cannot express
//! (null-bearing columns, constant-run columns, symbol ordering, budgets)
//! makes [`compile`] return `None` and the caller falls back to the
//! recursive evaluator.

use std::collections::HashMap;

use tracing::trace;

use crate::graph::{ExtRecord, Graph, Literal, NodeId, OpCode};
use crate::storage::{symbol, Table, TableColumn};
use crate::types::{DataType, Value};

use super::kernels::{binary_lane, operand_lane, unary_lane, Lane};

/// Register budget per program.
pub const MAX_REGISTERS: usize = 16;

/// Instruction budget per program.
pub const MAX_INSTRUCTIONS: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ConstValue {
    I64(i64),
    F64(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum RegKind {
    /// Table column by position.
    Column(usize),
    Const(ConstValue),
    Scratch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Register {
    pub(crate) lane: Lane,
    pub(crate) kind: RegKind,
    /// Holds symbol ids; only equality is meaningful.
    symbol: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Instr {
    Unary { op: OpCode, dst: usize, src: usize },
    Binary { op: OpCode, dst: usize, lhs: usize, rhs: usize },
    Cast { dst: usize, src: usize },
}

/// A compiled elementwise expression.
#[derive(Debug, Clone)]
pub struct Program {
    pub(crate) registers: Vec<Register>,
    pub(crate) instrs: Vec<Instr>,
    pub(crate) output: usize,
    out_type: DataType,
}

impl Program {
    /// Returns the element type of the result column.
    #[must_use]
    pub fn out_type(&self) -> DataType {
        self.out_type
    }

    /// Returns the number of registers.
    #[must_use]
    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    /// Returns the number of instructions.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.instrs.len()
    }

    pub(crate) fn out_lane(&self) -> Lane {
        self.registers[self.output].lane
    }
}

struct Compiler<'a> {
    graph: &'a Graph,
    table: &'a Table,
    registers: Vec<Register>,
    instrs: Vec<Instr>,
    memo: HashMap<NodeId, usize>,
}

impl<'a> Compiler<'a> {
    fn push_register(&mut self, register: Register) -> Option<usize> {
        if self.registers.len() >= MAX_REGISTERS {
            return None;
        }
        self.registers.push(register);
        Some(self.registers.len() - 1)
    }

    fn push_instr(&mut self, instr: Instr) -> Option<()> {
        if self.instrs.len() >= MAX_INSTRUCTIONS {
            return None;
        }
        self.instrs.push(instr);
        Some(())
    }

    fn constant(&mut self, value: ConstValue, symbol: bool) -> Option<usize> {
        let lane = match value {
            ConstValue::I64(_) => Lane::I64,
            ConstValue::F64(_) => Lane::F64,
            ConstValue::Bool(_) => Lane::Bool,
        };
        self.push_register(Register {
            lane,
            kind: RegKind::Const(value),
            symbol,
        })
    }

    fn scratch(&mut self, lane: Lane) -> Option<usize> {
        self.push_register(Register {
            lane,
            kind: RegKind::Scratch,
            symbol: false,
        })
    }

    /// Returns a register holding `reg` in `lane`, inserting a cast when the
    /// lanes differ. Constants are converted in place.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn coerce(&mut self, reg: usize, lane: Lane) -> Option<usize> {
        let register = self.registers[reg];
        if register.lane == lane {
            return Some(reg);
        }
        if let RegKind::Const(value) = register.kind {
            let converted = match (value, lane) {
                (ConstValue::I64(v), Lane::F64) => ConstValue::F64(v as f64),
                (ConstValue::I64(v), Lane::Bool) => ConstValue::Bool(v != 0),
                (ConstValue::F64(v), Lane::I64) => ConstValue::I64(v as i64),
                (ConstValue::F64(v), Lane::Bool) => ConstValue::Bool(v != 0.0),
                (ConstValue::Bool(v), Lane::I64) => ConstValue::I64(i64::from(v)),
                (ConstValue::Bool(v), Lane::F64) => ConstValue::F64(f64::from(u8::from(v))),
                (v, _) => v,
            };
            return self.constant(converted, register.symbol);
        }
        let dst = self.scratch(lane)?;
        self.push_instr(Instr::Cast { dst, src: reg })?;
        Some(dst)
    }

    fn scan(&mut self, name: &str) -> Option<usize> {
        let index = self.table.column_index(name)?;
        let (data_type, has_nulls) = match self.table.column_at(index)? {
            TableColumn::Flat(c) => (c.data_type(), c.has_nulls()),
            TableColumn::Parted(p) => (p.data_type(), p.segments().iter().any(|s| s.has_nulls())),
            TableColumn::MapCommon(_) => {
                trace!(column = name, "constant-run column is not compilable");
                return None;
            }
        };
        if has_nulls {
            trace!(column = name, "nullable column is not compilable");
            return None;
        }
        self.push_register(Register {
            lane: Lane::of(data_type),
            kind: RegKind::Column(index),
            symbol: data_type == DataType::Symbol,
        })
    }

    fn literal(&mut self, value: &Value) -> Option<usize> {
        match value {
            Value::Null | Value::Str(_) => None,
            Value::Bool(b) => self.constant(ConstValue::Bool(*b), false),
            Value::F64(f) => self.constant(ConstValue::F64(*f), false),
            other => self.constant(ConstValue::I64(other.as_i64()?), false),
        }
    }

    fn string_literal(&self, id: NodeId) -> Option<&'a str> {
        match self.graph.ext(id)? {
            ExtRecord::Const(Literal::Atom(Value::Str(s))) => Some(&**s),
            _ => None,
        }
    }

    /// Resolves a string literal compared against a symbol operand to its
    /// dictionary id.
    fn symbol_literal(&mut self, op: OpCode, other: usize, literal: &str) -> Option<usize> {
        if !self.registers[other].symbol || !matches!(op, OpCode::Eq | OpCode::Ne) {
            return None;
        }
        let Some(id) = symbol::lookup(literal) else {
            trace!(literal, "string literal is not in the symbol table");
            return None;
        };
        self.constant(ConstValue::I64(i64::try_from(id).ok()?), true)
    }

    fn emit(&mut self, id: NodeId) -> Option<usize> {
        if let Some(&reg) = self.memo.get(&id) {
            return Some(reg);
        }
        let node = *self.graph.node(id).ok()?;
        let reg = match node.opcode {
            OpCode::Scan => match self.graph.ext(id)? {
                ExtRecord::Scan { column } => {
                    let column = column.clone();
                    self.scan(&column)?
                }
                _ => return None,
            },
            OpCode::Const => match self.graph.ext(id)? {
                ExtRecord::Const(Literal::Atom(value)) => {
                    let value = value.clone();
                    self.literal(&value)?
                }
                _ => return None,
            },
            OpCode::Alias => self.emit(node.inputs[0]?)?,
            OpCode::Cast => {
                let target = match self.graph.ext(id)? {
                    ExtRecord::Cast { target } => *target,
                    _ => return None,
                };
                if target == DataType::Symbol {
                    return None;
                }
                // The I64 lane cannot wrap to a narrower width mid-program.
                if matches!(
                    target,
                    DataType::U8 | DataType::I16 | DataType::I32 | DataType::Date | DataType::Time
                ) {
                    trace!(node = %id, ?target, "narrowing cast is not compiled");
                    return None;
                }
                let src = self.emit(node.inputs[0]?)?;
                if self.registers[src].symbol {
                    return None;
                }
                self.coerce(src, Lane::of(target))?
            }
            OpCode::IsNull => {
                self.emit(node.inputs[0]?)?;
                self.constant(ConstValue::Bool(false), false)?
            }
            op if op.is_unary_elementwise() => {
                let src = self.emit(node.inputs[0]?)?;
                if self.registers[src].symbol {
                    return None;
                }
                let out = unary_lane(op, self.registers[src].lane).ok()?;
                let in_lane = match op {
                    OpCode::Not => Lane::Bool,
                    OpCode::Sqrt | OpCode::Log | OpCode::Exp => Lane::F64,
                    _ => out,
                };
                let src = self.coerce(src, in_lane)?;
                if matches!(op, OpCode::Ceil | OpCode::Floor) && out == Lane::I64 {
                    src
                } else {
                    let dst = self.scratch(out)?;
                    self.push_instr(Instr::Unary { op, dst, src })?;
                    dst
                }
            }
            op if op.is_binary_elementwise() => {
                let (a, b) = (node.inputs[0]?, node.inputs[1]?);
                let (lhs, rhs) = match (self.string_literal(a), self.string_literal(b)) {
                    (None, Some(lit)) => {
                        let lhs = self.emit(a)?;
                        (lhs, self.symbol_literal(op, lhs, lit)?)
                    }
                    (Some(lit), None) => {
                        let rhs = self.emit(b)?;
                        (self.symbol_literal(op, rhs, lit)?, rhs)
                    }
                    (Some(_), Some(_)) => return None,
                    (None, None) => (self.emit(a)?, self.emit(b)?),
                };
                let (l, r) = (self.registers[lhs], self.registers[rhs]);
                let symbolic = l.symbol || r.symbol;
                if symbolic && !(matches!(op, OpCode::Eq | OpCode::Ne) && l.symbol && r.symbol) {
                    return None;
                }
                let in_lane = operand_lane(op, l.lane, r.lane).ok()?;
                let out = binary_lane(op, l.lane, r.lane).ok()?;
                let lhs = self.coerce(lhs, in_lane)?;
                let rhs = self.coerce(rhs, in_lane)?;
                let dst = self.scratch(out)?;
                self.push_instr(Instr::Binary { op, dst, lhs, rhs })?;
                dst
            }
            _ => return None,
        };
        self.memo.insert(id, reg);
        Some(reg)
    }
}

/// Compiles the elementwise sub-tree rooted at `root` against `table`.
///
/// Returns `None` when the sub-tree is not compilable or is a bare leaf.
#[must_use]
pub fn compile(graph: &Graph, root: NodeId, table: &Table) -> Option<Program> {
    let mut compiler = Compiler {
        graph,
        table,
        registers: Vec::with_capacity(MAX_REGISTERS),
        instrs: Vec::with_capacity(MAX_INSTRUCTIONS),
        memo: HashMap::new(),
    };
    let Some(output) = compiler.emit(root) else {
        trace!(node = %root, "expression falls back to recursive evaluation");
        return None;
    };
    if compiler.instrs.is_empty() {
        return None;
    }
    // Constant-only expressions stay atoms.
    if !compiler
        .registers
        .iter()
        .any(|r| matches!(r.kind, RegKind::Column(_)))
    {
        return None;
    }
    let lane = compiler.registers[output].lane;
    let out_type = match graph.ext(root) {
        Some(ExtRecord::Cast { target }) if Lane::of(*target) == lane => *target,
        _ => lane.data_type(),
    };
    Some(Program {
        registers: compiler.registers,
        instrs: compiler.instrs,
        output,
        out_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Column;
    use crate::types::Value;

    fn table() -> Table {
        Table::new()
            .with_column("a", Column::from_i64(vec![1, 2, 3]))
            .unwrap()
            .with_column("b", Column::from_f64(vec![0.5, 1.5, 2.5]))
            .unwrap()
            .with_column("s", Column::from_symbols(&["x", "y", "x"]))
            .unwrap()
            .with_column(
                "n",
                Column::from_values(DataType::I64, &[Value::I64(1), Value::Null, Value::I64(3)])
                    .unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn test_mixed_arithmetic_inserts_cast() {
        let t = table();
        let mut g = Graph::with_table(t.clone());
        let a = g.scan("a");
        let b = g.scan("b");
        let sum = g.add(a, b);
        let program = compile(&g, sum, &t).unwrap();
        assert_eq!(program.out_type(), DataType::F64);
        assert!(program
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Cast { .. })));
    }

    #[test]
    fn test_shared_subexpression_compiles_once() {
        let t = table();
        let mut g = Graph::with_table(t.clone());
        let a = g.scan("a");
        let sq = g.mul(a, a);
        let program = compile(&g, sq, &t).unwrap();
        assert_eq!(program.register_count(), 2);
        assert_eq!(program.instruction_count(), 1);
    }

    #[test]
    fn test_symbol_literal_resolved_at_compile_time() {
        let t = table();
        let mut g = Graph::with_table(t.clone());
        let s = g.scan("s");
        let lit = g.const_value(Value::str("x"));
        let eq = g.eq(s, lit);
        let program = compile(&g, eq, &t).unwrap();
        assert_eq!(program.out_type(), DataType::Bool);

        let missing = g.const_value(Value::str("never-interned-literal"));
        let eq = g.eq(s, missing);
        assert!(compile(&g, eq, &t).is_none());

        let lit = g.const_value(Value::str("x"));
        let lt = g.lt(s, lit);
        assert!(compile(&g, lt, &t).is_none());
    }

    #[test]
    fn test_nullable_column_falls_back() {
        let t = table();
        let mut g = Graph::with_table(t.clone());
        let n = g.scan("n");
        let one = g.const_value(Value::I64(1));
        let sum = g.add(n, one);
        assert!(compile(&g, sum, &t).is_none());
    }

    #[test]
    fn test_bare_scan_is_not_a_program() {
        let t = table();
        let mut g = Graph::with_table(t.clone());
        let a = g.scan("a");
        assert!(compile(&g, a, &t).is_none());
    }

    #[test]
    fn test_narrowing_cast_is_not_compiled() {
        let t = table();
        let mut g = Graph::with_table(t.clone());
        let a = g.scan("a");
        let zero = g.const_value(Value::I64(0));
        for target in [DataType::U8, DataType::I16, DataType::I32, DataType::Date] {
            let narrow = g.cast(a, target);
            let sum = g.add(narrow, zero);
            assert!(compile(&g, sum, &t).is_none(), "{target:?}");
        }
        let wide = g.cast(a, DataType::F64);
        let sum = g.add(wide, zero);
        assert_eq!(compile(&g, sum, &t).unwrap().out_type(), DataType::F64);
    }

    #[test]
    fn test_constant_expression_is_not_a_program() {
        let t = table();
        let mut g = Graph::with_table(t.clone());
        let one = g.const_value(Value::I64(1));
        let two = g.const_value(Value::I64(2));
        let sum = g.add(one, two);
        assert!(compile(&g, sum, &t).is_none());
    }

    #[test]
    fn test_instruction_budget() {
        let t = table();
        let mut g = Graph::with_table(t.clone());
        let mut acc = g.scan("a");
        for i in 0..MAX_INSTRUCTIONS {
            let c = g.const_value(Value::I64(i as i64));
            acc = g.add(acc, c);
        }
        assert!(compile(&g, acc, &t).is_none());
    }
}
