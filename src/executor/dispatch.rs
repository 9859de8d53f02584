//! Node dispatch: walks the operator graph and routes every node to its
//! engine.
//!
//! Expressions under a structural node resolve their scans against that
//! node's input table (the *scope*); free-standing scans resolve against the
//! graph's bound table.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Result, TesseraError};
use crate::graph::{AggSpec, ExtRecord, Graph, JoinType, Literal, NodeId, OpCode, SortKey};
use crate::storage::{Column, ColumnRef, RowSelection, Table, TableColumn};
use crate::types::{DataType, Value};

use super::context::ExecContext;
use super::elementwise;
use super::gather::materialize_selection;
use super::group::{group_columns, group_parted, GroupAgg, GroupKey, Measure, PartedAgg};
use super::join::hash_join;
use super::sort::{sort_table, SortColumn};
use super::vectorized::{compile, evaluator};
use super::Datum;

fn ext<'g>(graph: &'g Graph, id: NodeId) -> Result<&'g ExtRecord> {
    graph.ext(id).ok_or_else(|| {
        TesseraError::DomainError(format!("node {id} is missing its extended record"))
    })
}

fn scope_table<'a>(graph: &'a Graph, scope: Option<&'a Table>) -> Result<&'a Table> {
    scope
        .or_else(|| graph.table())
        .ok_or_else(|| TesseraError::SchemaError("scan outside of any table".to_string()))
}

/// Turns an expression result into a column of `len` rows, broadcasting
/// atoms.
fn to_column(datum: Datum, len: usize) -> Result<ColumnRef> {
    match datum {
        Datum::Vector(v) if v.len() == len => Ok(v),
        Datum::Vector(v) => Err(TesseraError::LengthMismatch {
            left: len,
            right: v.len(),
        }),
        Datum::Atom(value) => {
            let data_type = value.data_type().unwrap_or(DataType::I64);
            Ok(Arc::new(Column::from_values(data_type, &vec![value; len])?))
        }
        Datum::Table(_) => Err(TesseraError::SchemaError(
            "expected an expression, got a table".to_string(),
        )),
    }
}

fn eval_column(
    ctx: &ExecContext<'_>,
    graph: &Graph,
    id: NodeId,
    table: &Table,
) -> Result<ColumnRef> {
    to_column(exec_node(ctx, graph, id, Some(table))?, table.nrows())
}

fn input_table(ctx: &ExecContext<'_>, graph: &Graph, id: NodeId, scope: Option<&Table>) -> Result<Table> {
    exec_node(ctx, graph, graph.input(id, 0)?, scope)?.into_table()
}

/// First or last `n` rows of a datum.
fn slice(ctx: &ExecContext<'_>, datum: Datum, from_end: bool, n: usize) -> Result<Datum> {
    let window = |total: usize| {
        let n = n.min(total);
        if from_end {
            (total - n, n)
        } else {
            (0, n)
        }
    };
    match datum {
        Datum::Table(t) => {
            let dense = materialize_selection(ctx, &t)?;
            let (start, len) = window(dense.nrows());
            let mut out = Table::new();
            for (name, column) in dense.names().iter().zip(dense.columns()) {
                let column = column.flatten()?;
                out.add_column(name, TableColumn::Flat(Arc::new(column.slice(start, len))))?;
            }
            Ok(Datum::Table(out))
        }
        Datum::Vector(v) => {
            let (start, len) = window(v.len());
            Ok(Datum::Vector(Arc::new(v.slice(start, len))))
        }
        Datum::Atom(_) => Ok(datum),
    }
}

fn exec_filter(ctx: &ExecContext<'_>, graph: &Graph, id: NodeId, scope: Option<&Table>) -> Result<Datum> {
    match exec_node(ctx, graph, graph.input(id, 0)?, scope)? {
        Datum::Table(t) => {
            let predicate = eval_column(ctx, graph, graph.input(id, 1)?, &t)?;
            let selection = RowSelection::from_column(&predicate)?;
            trace!(rows = t.nrows(), selected = selection.count(), "filter attaches selection");
            Ok(Datum::Table(t.with_selection(selection)?))
        }
        Datum::Vector(v) => {
            let predicate = to_column(exec_node(ctx, graph, graph.input(id, 1)?, scope)?, v.len())?;
            let indices = RowSelection::from_column(&predicate)?.indices();
            Ok(Datum::Vector(Arc::new(v.gather(&indices))))
        }
        Datum::Atom(_) => Err(TesseraError::DomainError("cannot filter an atom".to_string())),
    }
}

fn exec_sort(
    ctx: &ExecContext<'_>,
    graph: &Graph,
    id: NodeId,
    scope: Option<&Table>,
    fused_limit: Option<usize>,
) -> Result<Datum> {
    let ExtRecord::Sort { keys, limit } = ext(graph, id)? else {
        return Err(TesseraError::DomainError(format!("SORT {id} has no sort keys")));
    };
    let limit = match (*limit, fused_limit) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let table = materialize_selection(ctx, &input_table(ctx, graph, id, scope)?)?;
    let columns = keys
        .iter()
        .map(|&SortKey { expr, descending, nulls_first }| {
            Ok(SortColumn {
                column: eval_column(ctx, graph, expr, &table)?,
                descending,
                nulls_first,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Datum::Table(sort_table(ctx, &table, &columns, limit)?))
}

/// Column names when every listed node is a plain scan.
fn scan_names(graph: &Graph, ids: impl Iterator<Item = NodeId>) -> Option<Vec<Arc<str>>> {
    ids.map(|id| match graph.ext(id) {
        Some(ExtRecord::Scan { column }) => Some(Arc::clone(column)),
        _ => None,
    })
    .collect()
}

fn agg_name(graph: &Graph, spec: &AggSpec, i: usize) -> Arc<str> {
    let input = graph.output_name(spec.input, &format!("x{i}"));
    Arc::from(format!("{input}_{}", spec.func.suffix()))
}

fn exec_group(ctx: &ExecContext<'_>, graph: &Graph, id: NodeId, scope: Option<&Table>) -> Result<Datum> {
    let ExtRecord::Group { keys, aggs } = ext(graph, id)? else {
        return Err(TesseraError::DomainError(format!("GROUP {id} has no group spec")));
    };
    let mut table = input_table(ctx, graph, id, scope)?;

    if !table.is_flat() {
        let key_names = scan_names(graph, keys.iter().copied());
        let agg_columns = scan_names(graph, aggs.iter().map(|a| a.input));
        if let (Some(key_names), Some(agg_columns)) = (key_names, agg_columns) {
            let referenced: Vec<Arc<str>> =
                key_names.iter().chain(&agg_columns).cloned().collect();
            let parted: Vec<PartedAgg> = aggs
                .iter()
                .zip(agg_columns)
                .enumerate()
                .map(|(i, (spec, column))| PartedAgg {
                    measure: Measure::from(spec.func),
                    column,
                    name: agg_name(graph, spec, i),
                })
                .collect();
            if let Some(out) = group_parted(ctx, &table, &key_names, &parted)? {
                return Ok(Datum::Table(out));
            }
            debug!(node = %id, "group by flattens referenced columns");
            let names: Vec<&str> = referenced.iter().map(AsRef::as_ref).collect();
            table = table.flatten_columns(&names)?;
        }
    }

    let keys = keys
        .iter()
        .enumerate()
        .map(|(i, &key)| {
            Ok(GroupKey {
                name: graph.output_name(key, &format!("k{i}")),
                column: eval_column(ctx, graph, key, &table)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let aggs = aggs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            Ok(GroupAgg {
                measure: Measure::from(spec.func),
                name: agg_name(graph, spec, i),
                column: eval_column(ctx, graph, spec.input, &table)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let selection = table.selection().map(AsRef::as_ref);
    Ok(Datum::Table(group_columns(ctx, &keys, &aggs, selection, table.nrows())?))
}

fn exec_join(ctx: &ExecContext<'_>, graph: &Graph, id: NodeId, scope: Option<&Table>) -> Result<Datum> {
    let ExtRecord::Join {
        left_keys,
        right_keys,
        join_type,
    } = ext(graph, id)?
    else {
        return Err(TesseraError::DomainError(format!("JOIN {id} has no join keys")));
    };
    let left = exec_node(ctx, graph, graph.input(id, 0)?, scope)?.into_table()?;
    let right = exec_node(ctx, graph, graph.input(id, 1)?, scope)?.into_table()?;
    let left = materialize_selection(ctx, &left)?;
    let right = materialize_selection(ctx, &right)?;
    let keys = |table: &Table, ids: &[NodeId]| {
        ids.iter()
            .map(|&k| eval_column(ctx, graph, k, table))
            .collect::<Result<Vec<_>>>()
    };
    let (lk, rk) = (keys(&left, left_keys)?, keys(&right, right_keys)?);
    let join_type: JoinType = *join_type;
    Ok(Datum::Table(hash_join(ctx, &left, &lk, &right, &rk, join_type)?))
}

fn exec_project(ctx: &ExecContext<'_>, graph: &Graph, id: NodeId, scope: Option<&Table>) -> Result<Datum> {
    let ExtRecord::Project { columns } = ext(graph, id)? else {
        return Err(TesseraError::DomainError(format!("PROJECT {id} has no columns")));
    };
    let table = input_table(ctx, graph, id, scope)?;
    let mut out = Table::new();
    for (i, &column) in columns.iter().enumerate() {
        let name = graph.output_name(column, &format!("c{i}"));
        out.add_column(&name, TableColumn::Flat(eval_column(ctx, graph, column, &table)?))?;
    }
    if out.ncols() == 0 {
        return Ok(Datum::Table(out));
    }
    match table.selection() {
        Some(selection) => Ok(Datum::Table(out.with_selection(selection.as_ref().clone())?)),
        None => Ok(Datum::Table(out)),
    }
}

/// Whole-vector reduction through the zero-key GROUP BY path.
fn exec_reduce(ctx: &ExecContext<'_>, graph: &Graph, id: NodeId, scope: Option<&Table>) -> Result<Datum> {
    let node = graph.node(id)?;
    let Some(func) = node.opcode.aggregate() else {
        return Err(TesseraError::DomainError(format!("{} is not a reduction", node.opcode.name())));
    };
    let input = exec_node(ctx, graph, graph.input(id, 0)?, scope)?;
    let column = match input {
        Datum::Atom(_) => to_column(input, 1)?,
        Datum::Vector(v) => v,
        Datum::Table(_) => {
            return Err(TesseraError::DomainError(format!(
                "{} needs a vector, got a table",
                node.opcode.name()
            )))
        }
    };
    let nrows = column.len();
    let agg = GroupAgg {
        measure: Measure::from(func),
        name: Arc::from(func.suffix()),
        column,
    };
    let out = group_columns(ctx, &[], &[agg], None, nrows)?;
    Ok(Datum::Atom(out.get(0, func.suffix()).unwrap_or(Value::Null)))
}

fn exec_elementwise(
    ctx: &ExecContext<'_>,
    graph: &Graph,
    id: NodeId,
    opcode: OpCode,
    scope: Option<&Table>,
) -> Result<Datum> {
    if let Some(table) = scope.or_else(|| graph.table()) {
        if let Some(program) = compile(graph, id, table) {
            trace!(
                node = %id,
                instructions = program.instruction_count(),
                "compiled expression"
            );
            let column = evaluator::evaluate(ctx, &program, table)?;
            return Ok(Datum::Vector(Arc::new(column)));
        }
    }
    let a = exec_node(ctx, graph, graph.input(id, 0)?, scope)?;
    if opcode.is_unary_elementwise() {
        let target = match graph.ext(id) {
            Some(ExtRecord::Cast { target }) => Some(*target),
            _ => None,
        };
        return elementwise::unary(opcode, target, &a);
    }
    let b = exec_node(ctx, graph, graph.input(id, 1)?, scope)?;
    elementwise::binary(opcode, &a, &b)
}

/// Evaluates node `id`; scans resolve against `scope` or, without one, the
/// graph's bound table.
pub(crate) fn exec_node(
    ctx: &ExecContext<'_>,
    graph: &Graph,
    id: NodeId,
    scope: Option<&Table>,
) -> Result<Datum> {
    ctx.check_cancelled()?;
    let opcode = graph.node(id)?.opcode;
    match opcode {
        OpCode::Scan => {
            let ExtRecord::Scan { column } = ext(graph, id)? else {
                return Err(TesseraError::DomainError(format!("SCAN {id} has no column")));
            };
            Ok(Datum::Vector(scope_table(graph, scope)?.flat_column(column)?))
        }
        OpCode::Const => match ext(graph, id)? {
            ExtRecord::Const(Literal::Atom(v)) => Ok(Datum::Atom(v.clone())),
            ExtRecord::Const(Literal::Vector(c)) => Ok(Datum::Vector(Arc::clone(c))),
            ExtRecord::Const(Literal::Table(t)) => Ok(Datum::Table(t.clone())),
            _ => Err(TesseraError::DomainError(format!("CONST {id} has no literal"))),
        },
        op if op.is_elementwise() => exec_elementwise(ctx, graph, id, op, scope),
        op if op.aggregate().is_some() => exec_reduce(ctx, graph, id, scope),
        OpCode::Filter => exec_filter(ctx, graph, id, scope),
        OpCode::Sort => exec_sort(ctx, graph, id, scope, None),
        OpCode::Group => exec_group(ctx, graph, id, scope),
        OpCode::Join => exec_join(ctx, graph, id, scope),
        OpCode::Head | OpCode::Tail => {
            let n = match ext(graph, id)? {
                ExtRecord::Head { n } | ExtRecord::Tail { n } => *n,
                _ => return Err(TesseraError::DomainError(format!("{} {id} has no count", opcode.name()))),
            };
            let input = graph.input(id, 0)?;
            if opcode == OpCode::Head && graph.node(input)?.opcode == OpCode::Sort {
                return exec_sort(ctx, graph, input, scope, Some(n));
            }
            let datum = exec_node(ctx, graph, input, scope)?;
            slice(ctx, datum, opcode == OpCode::Tail, n)
        }
        OpCode::Project => exec_project(ctx, graph, id, scope),
        OpCode::Alias => exec_node(ctx, graph, graph.input(id, 0)?, scope),
        OpCode::Materialize => match exec_node(ctx, graph, graph.input(id, 0)?, scope)? {
            Datum::Table(t) => Ok(Datum::Table(materialize_selection(ctx, &t)?)),
            other => Ok(other),
        },
        other => Err(TesseraError::NotYetImplemented(format!("operator {}", other.name()))),
    }
}
