//! Row gathers by permutation and compaction of pending selections.
//!
//! Output buffers are allocated once at full length. Each worker owns one
//! contiguous window of every output column and fills it a batch of rows
//! at a time, moving across all columns before the next batch.

use std::sync::Arc;

use rayon::prelude::*;

use crate::error::Result;
use crate::pool::split_ranges;
use crate::storage::{
    split_lens, CellsMut, Column, ColumnData, ColumnRef, NullMask, Table, TableColumn,
};

use super::context::ExecContext;

/// Rows gathered across all columns before moving to the next batch.
pub(crate) const GATHER_BATCH: usize = 512;

/// One preallocated output column.
struct Output {
    data: ColumnData,
    nulls: Option<Vec<bool>>,
}

impl Output {
    fn new(source: &Column, len: usize, nullable: bool) -> Self {
        Self {
            data: source.data().zeroed_like(len),
            nulls: (nullable || source.has_nulls()).then(|| vec![false; len]),
        }
    }

    fn finish(self) -> Result<Column> {
        let column = Column::new(self.data);
        match self.nulls {
            Some(flags) if flags.contains(&true) => column.with_nulls(NullMask::from_flags(&flags)),
            _ => Ok(column),
        }
    }
}

/// One worker's windows: a cell window and an optional null window per
/// column.
struct Windows<'a> {
    cells: Vec<CellsMut<'a>>,
    nulls: Vec<Option<&'a mut [bool]>>,
}

impl Windows<'_> {
    fn fill(&mut self, columns: &[ColumnRef], indices: &[u32]) -> Result<()> {
        for (b, batch) in indices.chunks(GATHER_BATCH).enumerate() {
            let at = b * GATHER_BATCH;
            for ((column, cells), nulls) in columns.iter().zip(&mut self.cells).zip(&mut self.nulls) {
                column.gather_into(batch, cells, nulls.as_deref_mut(), at)?;
            }
        }
        Ok(())
    }
}

/// Gathers `indices` from every column into preallocated buffers, one
/// contiguous range of `indices` per worker.
///
/// With `nullable` set, [`NO_ROW`](crate::storage::NO_ROW) indices produce
/// null cells.
pub(crate) fn gather_columns(
    ctx: &ExecContext<'_>,
    columns: &[ColumnRef],
    indices: &[u32],
    nullable: bool,
) -> Result<Vec<Column>> {
    ctx.check_cancelled()?;
    let mut outputs: Vec<Output> = columns
        .iter()
        .map(|c| Output::new(c, indices.len(), nullable))
        .collect();
    let workers = if columns.is_empty() { 1 } else { ctx.workers_for(indices.len()) };
    let ranges = split_ranges(indices.len(), workers, GATHER_BATCH);
    let lens: Vec<usize> = ranges.iter().map(|&(start, end)| end - start).collect();

    let mut windows: Vec<Windows<'_>> = ranges
        .iter()
        .map(|_| Windows {
            cells: Vec::with_capacity(columns.len()),
            nulls: Vec::with_capacity(columns.len()),
        })
        .collect();
    for output in &mut outputs {
        for (w, cells) in output.data.split_mut(&lens).into_iter().enumerate() {
            windows[w].cells.push(cells);
        }
        match output.nulls.as_mut() {
            Some(flags) => {
                for (w, nulls) in split_lens(flags, &lens).into_iter().enumerate() {
                    windows[w].nulls.push(Some(nulls));
                }
            }
            None => windows.iter_mut().for_each(|w| w.nulls.push(None)),
        }
    }

    if windows.len() == 1 {
        for mut window in windows {
            window.fill(columns, indices)?;
        }
    } else {
        ctx.pool.install(|| {
            windows
                .into_par_iter()
                .zip(ranges)
                .try_for_each(|(mut window, (start, end))| window.fill(columns, &indices[start..end]))
        })?;
    }
    outputs.into_iter().map(Output::finish).collect()
}

/// Builds a flat table whose rows are `indices` of `table`.
pub(crate) fn gather_table(ctx: &ExecContext<'_>, table: &Table, indices: &[u32]) -> Result<Table> {
    let flat: Vec<ColumnRef> = table
        .columns()
        .iter()
        .map(TableColumn::flatten)
        .collect::<Result<_>>()?;
    let gathered = gather_columns(ctx, &flat, indices, false)?;
    let mut out = Table::new();
    for (name, column) in table.names().iter().zip(gathered) {
        out.add_column(name, TableColumn::Flat(Arc::new(column)))?;
    }
    Ok(out)
}

/// Turns a table with a pending row selection (or parted columns) into a
/// dense flat table.
pub(crate) fn materialize_selection(ctx: &ExecContext<'_>, table: &Table) -> Result<Table> {
    match table.selection() {
        None => table.flatten(),
        Some(selection) => {
            let indices = selection.indices();
            gather_table(ctx, table, &indices)
        }
    }
}
