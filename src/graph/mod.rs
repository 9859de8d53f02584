//! Operator graphs.
//!
//! A [`Graph`] is an immutable-after-build DAG of typed nodes. Nodes live in
//! one growable array and reference each other by stable [`NodeId`]; the
//! variable-length payload of structural operators lives in a parallel
//! extended-record array looked up by the same id, so growth never
//! invalidates a stored reference.

mod node;

use std::fmt;
use std::sync::Arc;

pub use node::{
    AggSpec, AggregateFunction, ExtRecord, JoinType, Literal, Node, NodeId, OpCode, SortKey,
};

use crate::error::{Result, TesseraError};
use crate::storage::{Column, Table};
use crate::types::{DataType, Value};

/// Operator graph with an optional bound input table.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    ext: Vec<Option<ExtRecord>>,
    table: Option<Table>,
}

impl Graph {
    /// Creates an empty graph without a bound table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a graph whose free-standing scans read `table`.
    #[must_use]
    pub fn with_table(table: Table) -> Self {
        Self {
            table: Some(table),
            ..Self::default()
        }
    }

    /// Returns the bound table.
    #[must_use]
    pub fn table(&self) -> Option<&Table> {
        self.table.as_ref()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node.
    ///
    /// # Errors
    ///
    /// Returns a domain error for an id that does not belong to this graph.
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| TesseraError::DomainError(format!("unknown node {id}")))
    }

    /// Looks up the extended record of a node.
    #[must_use]
    pub fn ext(&self, id: NodeId) -> Option<&ExtRecord> {
        self.ext.get(id.index()).and_then(Option::as_ref)
    }

    /// Returns the input node at `slot`.
    pub fn input(&self, id: NodeId, slot: usize) -> Result<NodeId> {
        let node = self.node(id)?;
        node.inputs[slot].ok_or_else(|| {
            TesseraError::DomainError(format!("{} {id} is missing input {slot}", node.opcode.name()))
        })
    }

    fn push(
        &mut self,
        opcode: OpCode,
        inputs: [Option<NodeId>; 2],
        out_type: Option<DataType>,
        ext: Option<ExtRecord>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let est_rows = inputs
            .iter()
            .flatten()
            .filter_map(|i| self.nodes.get(i.index()))
            .map(|n| n.est_rows)
            .max()
            .unwrap_or_else(|| self.table.as_ref().map_or(0, Table::nrows));
        self.nodes.push(Node {
            id,
            opcode,
            inputs,
            out_type,
            est_rows,
        });
        self.ext.push(ext);
        id
    }

    fn out_type(&self, id: NodeId) -> Option<DataType> {
        self.nodes.get(id.index()).and_then(|n| n.out_type)
    }

    // === Leaves ===

    /// Column `name` of the scope table.
    pub fn scan(&mut self, name: &str) -> NodeId {
        let out_type = self
            .table
            .as_ref()
            .and_then(|t| t.column(name))
            .map(crate::storage::TableColumn::data_type);
        self.push(
            OpCode::Scan,
            [None, None],
            out_type,
            Some(ExtRecord::Scan {
                column: Arc::from(name),
            }),
        )
    }

    /// Scalar literal.
    pub fn const_value(&mut self, value: Value) -> NodeId {
        let out_type = value.data_type();
        self.push(
            OpCode::Const,
            [None, None],
            out_type,
            Some(ExtRecord::Const(Literal::Atom(value))),
        )
    }

    /// Vector literal.
    pub fn const_vector(&mut self, column: Column) -> NodeId {
        let out_type = Some(column.data_type());
        let id = self.push(
            OpCode::Const,
            [None, None],
            out_type,
            Some(ExtRecord::Const(Literal::Vector(Arc::new(column)))),
        );
        self.set_est_rows(id);
        id
    }

    /// Table literal.
    pub fn const_table(&mut self, table: Table) -> NodeId {
        let id = self.push(
            OpCode::Const,
            [None, None],
            None,
            Some(ExtRecord::Const(Literal::Table(table))),
        );
        self.set_est_rows(id);
        id
    }

    /// The bound table as a table-valued node.
    ///
    /// # Errors
    ///
    /// Returns a schema error if no table is bound.
    pub fn table_node(&mut self) -> Result<NodeId> {
        let table = self
            .table
            .clone()
            .ok_or_else(|| TesseraError::SchemaError("graph has no bound table".to_string()))?;
        Ok(self.const_table(table))
    }

    fn set_est_rows(&mut self, id: NodeId) {
        let rows = match self.ext(id) {
            Some(ExtRecord::Const(Literal::Vector(c))) => c.len(),
            Some(ExtRecord::Const(Literal::Table(t))) => t.selected_rows(),
            _ => return,
        };
        self.nodes[id.index()].est_rows = rows;
    }

    // === Elementwise ===

    /// Generic unary operator.
    pub fn unary(&mut self, opcode: OpCode, a: NodeId) -> NodeId {
        let input = self.out_type(a);
        let out_type = match opcode {
            OpCode::Not | OpCode::IsNull => Some(DataType::Bool),
            OpCode::Sqrt | OpCode::Log | OpCode::Exp => Some(DataType::F64),
            _ => input.map(|t| DataType::promote(t, t)),
        };
        self.push(opcode, [Some(a), None], out_type, None)
    }

    /// Generic binary operator.
    pub fn binary(&mut self, opcode: OpCode, a: NodeId, b: NodeId) -> NodeId {
        let out_type = if opcode.is_comparison() || matches!(opcode, OpCode::And | OpCode::Or) {
            Some(DataType::Bool)
        } else if opcode == OpCode::Div {
            Some(DataType::F64)
        } else {
            match (self.out_type(a), self.out_type(b)) {
                (Some(x), Some(y)) => Some(DataType::promote(x, y)),
                (Some(x), None) | (None, Some(x)) => Some(DataType::promote(x, x)),
                (None, None) => None,
            }
        };
        self.push(opcode, [Some(a), Some(b)], out_type, None)
    }

    pub fn neg(&mut self, a: NodeId) -> NodeId {
        self.unary(OpCode::Neg, a)
    }

    pub fn abs(&mut self, a: NodeId) -> NodeId {
        self.unary(OpCode::Abs, a)
    }

    pub fn not(&mut self, a: NodeId) -> NodeId {
        self.unary(OpCode::Not, a)
    }

    pub fn sqrt(&mut self, a: NodeId) -> NodeId {
        self.unary(OpCode::Sqrt, a)
    }

    pub fn is_null(&mut self, a: NodeId) -> NodeId {
        self.unary(OpCode::IsNull, a)
    }

    /// Converts `a` to `target`.
    pub fn cast(&mut self, a: NodeId, target: DataType) -> NodeId {
        self.push(
            OpCode::Cast,
            [Some(a), None],
            Some(target),
            Some(ExtRecord::Cast { target }),
        )
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(OpCode::Add, a, b)
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(OpCode::Sub, a, b)
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(OpCode::Mul, a, b)
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(OpCode::Div, a, b)
    }

    pub fn eq(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(OpCode::Eq, a, b)
    }

    pub fn ne(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(OpCode::Ne, a, b)
    }

    pub fn lt(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(OpCode::Lt, a, b)
    }

    pub fn le(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(OpCode::Le, a, b)
    }

    pub fn gt(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(OpCode::Gt, a, b)
    }

    pub fn ge(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(OpCode::Ge, a, b)
    }

    pub fn and(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(OpCode::And, a, b)
    }

    pub fn or(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(OpCode::Or, a, b)
    }

    // === Reductions ===

    /// Whole-vector reduction producing an atom.
    pub fn reduce(&mut self, func: AggregateFunction, a: NodeId) -> NodeId {
        let opcode = match func {
            AggregateFunction::Sum => OpCode::Sum,
            AggregateFunction::Count => OpCode::Count,
            AggregateFunction::Avg => OpCode::Avg,
            AggregateFunction::Min => OpCode::Min,
            AggregateFunction::Max => OpCode::Max,
            AggregateFunction::First => OpCode::First,
            AggregateFunction::Last => OpCode::Last,
            AggregateFunction::Var => OpCode::Var,
            AggregateFunction::VarPop => OpCode::VarPop,
            AggregateFunction::Stddev => OpCode::Stddev,
            AggregateFunction::StddevPop => OpCode::StddevPop,
        };
        let out_type = self.out_type(a).map(|t| func.output_type(t));
        self.push(opcode, [Some(a), None], out_type, None)
    }

    // === Structural ===

    /// Rows of `input` where `predicate` holds (lazily applied to tables).
    pub fn filter(&mut self, input: NodeId, predicate: NodeId) -> NodeId {
        let out_type = self.out_type(input);
        self.push(OpCode::Filter, [Some(input), Some(predicate)], out_type, None)
    }

    /// Sorts the rows of `input` by up to eight keys.
    pub fn sort(&mut self, input: NodeId, keys: Vec<SortKey>) -> NodeId {
        self.push(
            OpCode::Sort,
            [Some(input), None],
            None,
            Some(ExtRecord::Sort { keys, limit: None }),
        )
    }

    /// Sorts and keeps only the first `limit` rows.
    pub fn sort_limit(&mut self, input: NodeId, keys: Vec<SortKey>, limit: usize) -> NodeId {
        self.push(
            OpCode::Sort,
            [Some(input), None],
            None,
            Some(ExtRecord::Sort {
                keys,
                limit: Some(limit),
            }),
        )
    }

    /// Groups `input` by `keys` computing `aggs`.
    pub fn group(
        &mut self,
        input: NodeId,
        keys: &[NodeId],
        aggs: &[(AggregateFunction, NodeId)],
    ) -> NodeId {
        let aggs = aggs
            .iter()
            .map(|&(func, input)| AggSpec { func, input })
            .collect();
        self.push(
            OpCode::Group,
            [Some(input), None],
            None,
            Some(ExtRecord::Group {
                keys: keys.to_vec(),
                aggs,
            }),
        )
    }

    /// Equality join of two tables.
    pub fn join(
        &mut self,
        left: NodeId,
        right: NodeId,
        left_keys: &[NodeId],
        right_keys: &[NodeId],
        join_type: JoinType,
    ) -> NodeId {
        self.push(
            OpCode::Join,
            [Some(left), Some(right)],
            None,
            Some(ExtRecord::Join {
                left_keys: left_keys.to_vec(),
                right_keys: right_keys.to_vec(),
                join_type,
            }),
        )
    }

    /// First `n` rows.
    pub fn head(&mut self, input: NodeId, n: usize) -> NodeId {
        let out_type = self.out_type(input);
        self.push(OpCode::Head, [Some(input), None], out_type, Some(ExtRecord::Head { n }))
    }

    /// Last `n` rows.
    pub fn tail(&mut self, input: NodeId, n: usize) -> NodeId {
        let out_type = self.out_type(input);
        self.push(OpCode::Tail, [Some(input), None], out_type, Some(ExtRecord::Tail { n }))
    }

    /// Table of expression columns evaluated over `input`.
    pub fn project(&mut self, input: NodeId, columns: &[NodeId]) -> NodeId {
        self.push(
            OpCode::Project,
            [Some(input), None],
            None,
            Some(ExtRecord::Project {
                columns: columns.to_vec(),
            }),
        )
    }

    /// Names the result of `input`.
    pub fn alias(&mut self, input: NodeId, name: &str) -> NodeId {
        let out_type = self.out_type(input);
        self.push(
            OpCode::Alias,
            [Some(input), None],
            out_type,
            Some(ExtRecord::Alias {
                name: Arc::from(name),
            }),
        )
    }

    /// Flattens segmented columns and applies any pending selection.
    pub fn materialize(&mut self, input: NodeId) -> NodeId {
        let out_type = self.out_type(input);
        self.push(OpCode::Materialize, [Some(input), None], out_type, None)
    }

    /// Returns the name an expression's result column takes: the alias or
    /// scanned column name, or `fallback`.
    #[must_use]
    pub fn output_name(&self, id: NodeId, fallback: &str) -> Arc<str> {
        match self.ext(id) {
            Some(ExtRecord::Alias { name }) => Arc::clone(name),
            Some(ExtRecord::Scan { column }) => Arc::clone(column),
            _ => Arc::from(fallback),
        }
    }

    fn format_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId, indent: usize) -> fmt::Result {
        let prefix = "  ".repeat(indent);
        let Some(node) = self.nodes.get(id.index()) else {
            return writeln!(f, "{prefix}<dangling {id}>");
        };
        write!(f, "{prefix}{} {id}", node.opcode.name())?;
        match self.ext(id) {
            Some(ExtRecord::Scan { column }) => write!(f, " {column}")?,
            Some(ExtRecord::Const(Literal::Atom(v))) => write!(f, " {v}")?,
            Some(ExtRecord::Const(Literal::Vector(c))) => write!(f, " [{} rows]", c.len())?,
            Some(ExtRecord::Const(Literal::Table(t))) => write!(f, " <table {} rows>", t.nrows())?,
            Some(ExtRecord::Sort { keys, limit }) => {
                write!(f, " keys={}", keys.len())?;
                if let Some(n) = limit {
                    write!(f, " limit={n}")?;
                }
            }
            Some(ExtRecord::Group { keys, aggs }) => {
                write!(f, " keys={} aggs=[", keys.len())?;
                for (i, agg) in aggs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}({})", agg.func.name(), agg.input)?;
                }
                f.write_str("]")?;
            }
            Some(ExtRecord::Join { join_type, .. }) => write!(f, " {join_type:?}")?,
            Some(ExtRecord::Head { n } | ExtRecord::Tail { n }) => write!(f, " {n}")?,
            Some(ExtRecord::Alias { name }) => write!(f, " as {name}")?,
            Some(ExtRecord::Cast { target }) => write!(f, " {target}")?,
            Some(ExtRecord::Project { columns }) => write!(f, " cols={}", columns.len())?,
            None => {}
        }
        writeln!(f)?;
        for input in node.inputs.iter().flatten() {
            self.format_node(f, *input, indent + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Graph {
    /// Prints the graph as a tree rooted at the most recently added node.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.nodes.last() {
            Some(root) => self.format_node(f, root.id, 0),
            None => writeln!(f, "<empty graph>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table::new()
            .with_column("a", Column::from_i32(vec![1, 2]))
            .unwrap()
            .with_column("b", Column::from_f64(vec![1.0, 2.0]))
            .unwrap()
    }

    #[test]
    fn test_output_types() {
        let mut g = Graph::with_table(table());
        let a = g.scan("a");
        let b = g.scan("b");
        let sum = g.add(a, a);
        let mixed = g.add(a, b);
        let ratio = g.div(a, a);
        let cmp = g.lt(a, b);
        assert_eq!(g.node(sum).unwrap().out_type, Some(DataType::I64));
        assert_eq!(g.node(mixed).unwrap().out_type, Some(DataType::F64));
        assert_eq!(g.node(ratio).unwrap().out_type, Some(DataType::F64));
        assert_eq!(g.node(cmp).unwrap().out_type, Some(DataType::Bool));
        assert_eq!(g.node(a).unwrap().est_rows, 2);
    }

    #[test]
    fn test_ids_survive_growth() {
        let mut g = Graph::with_table(table());
        let a = g.scan("a");
        let t = g.table_node().unwrap();
        let grp = g.group(t, &[a], &[(AggregateFunction::Sum, a)]);
        for _ in 0..1000 {
            g.const_value(Value::I64(1));
        }
        match g.ext(grp) {
            Some(ExtRecord::Group { keys, aggs }) => {
                assert_eq!(keys, &vec![a]);
                assert_eq!(aggs[0].input, a);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_node() {
        let g = Graph::new();
        assert!(g.node(NodeId(3)).is_err());
    }

    #[test]
    fn test_display() {
        let mut g = Graph::with_table(table());
        let a = g.scan("a");
        let one = g.const_value(Value::I64(1));
        g.add(a, one);
        let text = g.to_string();
        assert!(text.starts_with("ADD #2"));
        assert!(text.contains("SCAN #0 a"));
    }
}
