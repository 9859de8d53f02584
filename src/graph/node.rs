//! Operator graph node definitions.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::storage::{ColumnRef, Table};
use crate::types::{DataType, Value};

/// Stable index of a node inside its [`Graph`](super::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Returns the position of the node in the graph's node array.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Operator codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    // === Leaves ===
    /// Column of the scope table, by name.
    Scan,
    /// Literal atom, vector or table.
    Const,

    // === Unary elementwise ===
    Neg,
    Abs,
    Not,
    Sqrt,
    Log,
    Exp,
    Ceil,
    Floor,
    IsNull,
    Cast,

    // === Binary elementwise ===
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Min2,
    Max2,

    // === Reductions ===
    Sum,
    Count,
    Avg,
    Min,
    Max,
    First,
    Last,
    Var,
    VarPop,
    Stddev,
    StddevPop,

    // === Structural ===
    Filter,
    Sort,
    Group,
    Join,
    Head,
    Tail,
    Project,
    Alias,
    Materialize,
}

impl OpCode {
    /// Returns the operator name used in plan output.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Scan => "SCAN",
            OpCode::Const => "CONST",
            OpCode::Neg => "NEG",
            OpCode::Abs => "ABS",
            OpCode::Not => "NOT",
            OpCode::Sqrt => "SQRT",
            OpCode::Log => "LOG",
            OpCode::Exp => "EXP",
            OpCode::Ceil => "CEIL",
            OpCode::Floor => "FLOOR",
            OpCode::IsNull => "ISNULL",
            OpCode::Cast => "CAST",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Eq => "EQ",
            OpCode::Ne => "NE",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Gt => "GT",
            OpCode::Ge => "GE",
            OpCode::And => "AND",
            OpCode::Or => "OR",
            OpCode::Min2 => "MIN2",
            OpCode::Max2 => "MAX2",
            OpCode::Sum => "SUM",
            OpCode::Count => "COUNT",
            OpCode::Avg => "AVG",
            OpCode::Min => "MIN",
            OpCode::Max => "MAX",
            OpCode::First => "FIRST",
            OpCode::Last => "LAST",
            OpCode::Var => "VAR",
            OpCode::VarPop => "VAR_POP",
            OpCode::Stddev => "STDDEV",
            OpCode::StddevPop => "STDDEV_POP",
            OpCode::Filter => "FILTER",
            OpCode::Sort => "SORT",
            OpCode::Group => "GROUP",
            OpCode::Join => "JOIN",
            OpCode::Head => "HEAD",
            OpCode::Tail => "TAIL",
            OpCode::Project => "PROJECT",
            OpCode::Alias => "ALIAS",
            OpCode::Materialize => "MATERIALIZE",
        }
    }

    /// Returns true for single-input per-row operators.
    #[must_use]
    pub fn is_unary_elementwise(&self) -> bool {
        matches!(
            self,
            OpCode::Neg
                | OpCode::Abs
                | OpCode::Not
                | OpCode::Sqrt
                | OpCode::Log
                | OpCode::Exp
                | OpCode::Ceil
                | OpCode::Floor
                | OpCode::IsNull
                | OpCode::Cast
        )
    }

    /// Returns true for two-input per-row operators.
    #[must_use]
    pub fn is_binary_elementwise(&self) -> bool {
        matches!(
            self,
            OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Eq
                | OpCode::Ne
                | OpCode::Lt
                | OpCode::Le
                | OpCode::Gt
                | OpCode::Ge
                | OpCode::And
                | OpCode::Or
                | OpCode::Min2
                | OpCode::Max2
        )
    }

    /// Returns true for per-row operators of any arity.
    #[must_use]
    pub fn is_elementwise(&self) -> bool {
        self.is_unary_elementwise() || self.is_binary_elementwise()
    }

    /// Returns true for comparison operators.
    #[must_use]
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            OpCode::Eq | OpCode::Ne | OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge
        )
    }

    /// Returns the aggregate a reduction opcode computes.
    #[must_use]
    pub fn aggregate(&self) -> Option<AggregateFunction> {
        Some(match self {
            OpCode::Sum => AggregateFunction::Sum,
            OpCode::Count => AggregateFunction::Count,
            OpCode::Avg => AggregateFunction::Avg,
            OpCode::Min => AggregateFunction::Min,
            OpCode::Max => AggregateFunction::Max,
            OpCode::First => AggregateFunction::First,
            OpCode::Last => AggregateFunction::Last,
            OpCode::Var => AggregateFunction::Var,
            OpCode::VarPop => AggregateFunction::VarPop,
            OpCode::Stddev => AggregateFunction::Stddev,
            OpCode::StddevPop => AggregateFunction::StddevPop,
            _ => return None,
        })
    }
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    First,
    Last,
    /// Sample variance.
    Var,
    /// Population variance.
    VarPop,
    /// Sample standard deviation.
    Stddev,
    /// Population standard deviation.
    StddevPop,
}

impl AggregateFunction {
    /// Returns the name of this aggregate function.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
            AggregateFunction::First => "FIRST",
            AggregateFunction::Last => "LAST",
            AggregateFunction::Var => "VAR",
            AggregateFunction::VarPop => "VAR_POP",
            AggregateFunction::Stddev => "STDDEV",
            AggregateFunction::StddevPop => "STDDEV_POP",
        }
    }

    /// Returns the suffix used to name the output column (`<input>_<suffix>`).
    #[must_use]
    pub fn suffix(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Count => "count",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::First => "first",
            AggregateFunction::Last => "last",
            AggregateFunction::Var => "var",
            AggregateFunction::VarPop => "var_pop",
            AggregateFunction::Stddev => "stddev",
            AggregateFunction::StddevPop => "stddev_pop",
        }
    }

    /// Returns the output data type for this aggregate function given an input type.
    #[must_use]
    pub fn output_type(&self, input_type: DataType) -> DataType {
        match self {
            AggregateFunction::Count => DataType::I64,
            AggregateFunction::Avg
            | AggregateFunction::Var
            | AggregateFunction::VarPop
            | AggregateFunction::Stddev
            | AggregateFunction::StddevPop => DataType::F64,
            AggregateFunction::Sum => {
                if input_type == DataType::F64 {
                    DataType::F64
                } else {
                    DataType::I64
                }
            }
            AggregateFunction::Min
            | AggregateFunction::Max
            | AggregateFunction::First
            | AggregateFunction::Last => input_type,
        }
    }
}

/// Join type for hash joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    LeftOuter,
    FullOuter,
}

/// One sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub expr: NodeId,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    /// Creates an ascending key with nulls last.
    #[must_use]
    pub fn asc(expr: NodeId) -> Self {
        SortKey {
            expr,
            descending: false,
            nulls_first: false,
        }
    }

    /// Creates a descending key with nulls last.
    #[must_use]
    pub fn desc(expr: NodeId) -> Self {
        SortKey {
            expr,
            descending: true,
            nulls_first: false,
        }
    }

    /// Sets the null placement.
    #[must_use]
    pub fn nulls_first(mut self, nulls_first: bool) -> Self {
        self.nulls_first = nulls_first;
        self
    }
}

/// One requested aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggSpec {
    pub func: AggregateFunction,
    pub input: NodeId,
}

/// Literal operand of a `Const` node.
#[derive(Debug, Clone)]
pub enum Literal {
    Atom(Value),
    Vector(ColumnRef),
    Table(Table),
}

/// Out-of-band payload of nodes whose operands do not fit in two inputs.
#[derive(Debug, Clone)]
pub enum ExtRecord {
    Scan { column: Arc<str> },
    Const(Literal),
    Cast { target: DataType },
    Group { keys: Vec<NodeId>, aggs: Vec<AggSpec> },
    Sort { keys: Vec<SortKey>, limit: Option<usize> },
    Join {
        left_keys: Vec<NodeId>,
        right_keys: Vec<NodeId>,
        join_type: JoinType,
    },
    Head { n: usize },
    Tail { n: usize },
    Project { columns: Vec<NodeId> },
    Alias { name: Arc<str> },
}

/// A typed operator node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub opcode: OpCode,
    pub inputs: [Option<NodeId>; 2],
    /// Element type of vector results; None for tables and unresolved scans.
    pub out_type: Option<DataType>,
    pub est_rows: usize,
}

impl Node {
    /// Returns the number of direct inputs.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.inputs.iter().filter(|i| i.is_some()).count()
    }
}
