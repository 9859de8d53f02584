//! tessera - vectorized execution core for in-memory columnar tables
//!
//! Evaluates operator graphs over columnar tables on a fixed worker pool:
//! - elementwise expressions compiled into register programs and run one
//!   morsel at a time;
//! - sorts picking insertion, radix, merge or top-N by shape;
//! - GROUP BY choosing between dense arrays, partitioned hashing and
//!   per-segment partials;
//! - parallel hash joins (inner, left outer, full outer).
//!
//! ```
//! use tessera::{AggregateFunction, Column, Executor, Graph, Table, Value};
//!
//! let table = Table::from_columns(vec![
//!     ("k", Column::from_i64(vec![1, 1, 2, 2, 2])),
//!     ("v", Column::from_i64(vec![10, 20, 30, 40, 50])),
//! ])?;
//! let mut graph = Graph::with_table(table);
//! let input = graph.table_node()?;
//! let (k, v) = (graph.scan("k"), graph.scan("v"));
//! let grouped = graph.group(input, &[k], &[(AggregateFunction::Sum, v)]);
//!
//! let out = Executor::with_defaults()?.execute(&graph, grouped)?.into_table()?;
//! assert_eq!(out.nrows(), 2);
//! assert_eq!(out.names()[1].as_ref(), "v_sum");
//! # Ok::<(), tessera::TesseraError>(())
//! ```

pub mod error;
pub mod executor;
pub mod graph;
pub mod pool;
pub mod storage;
pub mod types;

pub use error::{Result, TesseraError};
pub use executor::{CancelToken, Datum, Executor, ExecutorConfig, GroupStrategy, SortStrategy};
pub use graph::{AggregateFunction, Graph, JoinType, NodeId, OpCode, SortKey};
pub use storage::{Column, ColumnRef, MemoryArena, PartedColumn, RowSelection, Table, TableColumn};
pub use types::{DataType, Value};

/// Evaluates `root` of `graph` on a fresh executor with the default
/// configuration.
///
/// # Errors
///
/// Returns the first error raised while evaluating the graph.
pub fn execute(graph: &Graph, root: NodeId) -> Result<Datum> {
    Executor::with_defaults()?.execute(graph, root)
}
