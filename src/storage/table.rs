//! Tables: ordered, named sets of equal-length columns.
//!
//! Besides flat columns a table may hold parted columns (one logical column
//! split across segments) and constant-run columns (one value per segment).
//! Every non-flat column of a table shares the same segment bounds.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, TesseraError};
use crate::storage::{Column, ColumnRef, RowSelection};
use crate::types::{DataType, Value};

/// One logical column stored as ordered, independent segment vectors.
#[derive(Debug, Clone)]
pub struct PartedColumn {
    segments: Vec<ColumnRef>,
    len: usize,
}

impl PartedColumn {
    /// Creates a parted column; every segment must have the same type.
    pub fn new(segments: Vec<ColumnRef>) -> Result<Self> {
        let Some(first) = segments.first() else {
            return Err(TesseraError::DomainError(
                "parted column needs at least one segment".to_string(),
            ));
        };
        let data_type = first.data_type();
        if let Some(bad) = segments.iter().find(|s| s.data_type() != data_type) {
            return Err(TesseraError::type_error(data_type.name(), bad.data_type().name()));
        }
        let len = segments.iter().map(|s| s.len()).sum();
        Ok(Self { segments, len })
    }

    /// Returns the segments in order.
    #[must_use]
    pub fn segments(&self) -> &[ColumnRef] {
        &self.segments
    }

    /// Returns the total number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the column has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the element type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.segments[0].data_type()
    }

    /// Concatenates the segments into one flat column.
    pub fn flatten(&self) -> Result<Column> {
        let parts: Vec<&Column> = self.segments.iter().map(AsRef::as_ref).collect();
        Column::concat(&parts)
    }
}

/// A column that is constant within each segment: one value per run plus
/// the run's row count.
#[derive(Debug, Clone)]
pub struct MapCommon {
    values: ColumnRef,
    runs: Vec<usize>,
}

impl MapCommon {
    /// Creates a constant-run column.
    pub fn new(values: ColumnRef, runs: Vec<usize>) -> Result<Self> {
        if values.len() != runs.len() {
            return Err(TesseraError::LengthMismatch {
                left: values.len(),
                right: runs.len(),
            });
        }
        Ok(Self { values, runs })
    }

    /// Returns the per-run values.
    #[must_use]
    pub fn values(&self) -> &ColumnRef {
        &self.values
    }

    /// Returns the run lengths.
    #[must_use]
    pub fn runs(&self) -> &[usize] {
        &self.runs
    }

    /// Returns the total number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.iter().sum()
    }

    /// Returns true if the column has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expands run `run` to a flat column of its length.
    #[must_use]
    pub fn expand_run(&self, run: usize) -> Column {
        self.values.gather(&vec![run as u32; self.runs[run]])
    }

    /// Expands every run into one flat column.
    #[must_use]
    pub fn expand(&self) -> Column {
        let mut indices = Vec::with_capacity(self.len());
        for (run, &n) in self.runs.iter().enumerate() {
            indices.extend(std::iter::repeat(run as u32).take(n));
        }
        self.values.gather(&indices)
    }
}

/// Physical representation of a table column.
#[derive(Debug, Clone)]
pub enum TableColumn {
    /// One contiguous buffer.
    Flat(ColumnRef),
    /// Segmented buffers.
    Parted(PartedColumn),
    /// Constant per segment.
    MapCommon(MapCommon),
}

impl TableColumn {
    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            TableColumn::Flat(c) => c.len(),
            TableColumn::Parted(p) => p.len(),
            TableColumn::MapCommon(m) => m.len(),
        }
    }

    /// Returns true if the column has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the element type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            TableColumn::Flat(c) => c.data_type(),
            TableColumn::Parted(p) => p.data_type(),
            TableColumn::MapCommon(m) => m.values().data_type(),
        }
    }

    /// Returns the flat column, materializing segments or runs if needed.
    pub fn flatten(&self) -> Result<ColumnRef> {
        match self {
            TableColumn::Flat(c) => Ok(Arc::clone(c)),
            TableColumn::Parted(p) => Ok(Arc::new(p.flatten()?)),
            TableColumn::MapCommon(m) => Ok(Arc::new(m.expand())),
        }
    }

    /// Returns the rows of segment `seg`, whose rows are `bounds[seg]..bounds[seg + 1]`.
    #[must_use]
    pub fn segment(&self, seg: usize, bounds: &[usize]) -> ColumnRef {
        match self {
            TableColumn::Flat(c) => {
                let (start, end) = (bounds[seg], bounds[seg + 1]);
                Arc::new(c.slice(start, end - start))
            }
            TableColumn::Parted(p) => Arc::clone(&p.segments()[seg]),
            TableColumn::MapCommon(m) => Arc::new(m.expand_run(seg)),
        }
    }

    fn segment_lens(&self) -> Option<Vec<usize>> {
        match self {
            TableColumn::Flat(_) => None,
            TableColumn::Parted(p) => Some(p.segments().iter().map(|s| s.len()).collect()),
            TableColumn::MapCommon(m) => Some(m.runs().to_vec()),
        }
    }
}

impl From<Column> for TableColumn {
    fn from(column: Column) -> Self {
        TableColumn::Flat(Arc::new(column))
    }
}

impl From<ColumnRef> for TableColumn {
    fn from(column: ColumnRef) -> Self {
        TableColumn::Flat(column)
    }
}

/// An ordered, named set of equal-length columns with an optional pending
/// row selection.
#[derive(Clone, Default)]
pub struct Table {
    names: Vec<Arc<str>>,
    columns: Vec<TableColumn>,
    nrows: usize,
    selection: Option<Arc<RowSelection>>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("names", &self.names)
            .field("nrows", &self.nrows)
            .field("selected", &self.selection.as_ref().map(|s| s.count()))
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Creates an empty table with no columns.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table of flat columns.
    pub fn from_columns<S: AsRef<str>>(columns: Vec<(S, Column)>) -> Result<Self> {
        let mut table = Self::new();
        for (name, column) in columns {
            table.add_column(name.as_ref(), TableColumn::from(column))?;
        }
        Ok(table)
    }

    /// Appends a column.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is already used, the length differs from
    /// the existing columns, or the segment layout disagrees with the other
    /// non-flat columns.
    pub fn add_column(&mut self, name: &str, column: TableColumn) -> Result<()> {
        if self.column_index(name).is_some() {
            return Err(TesseraError::SchemaError(format!(
                "duplicate column '{name}'"
            )));
        }
        if !self.columns.is_empty() && column.len() != self.nrows {
            return Err(TesseraError::LengthMismatch {
                left: self.nrows,
                right: column.len(),
            });
        }
        if let (Some(new_lens), Some(bounds)) = (column.segment_lens(), self.segment_bounds()?) {
            let existing: Vec<usize> = bounds.windows(2).map(|w| w[1] - w[0]).collect();
            if new_lens != existing {
                return Err(TesseraError::SchemaError(format!(
                    "column '{name}' has a different segment layout"
                )));
            }
        }
        self.nrows = column.len();
        self.names.push(Arc::from(name));
        self.columns.push(column);
        Ok(())
    }

    /// Builder form of [`Table::add_column`] for flat columns.
    pub fn with_column(mut self, name: &str, column: Column) -> Result<Self> {
        self.add_column(name, TableColumn::from(column))?;
        Ok(self)
    }

    /// Returns the number of physical rows (ignoring any selection).
    #[must_use]
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Returns the number of rows that survive the pending selection.
    #[must_use]
    pub fn selected_rows(&self) -> usize {
        self.selection.as_ref().map_or(self.nrows, |s| s.count())
    }

    /// Returns the number of columns.
    #[must_use]
    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    /// Returns the column names in order.
    #[must_use]
    pub fn names(&self) -> &[Arc<str>] {
        &self.names
    }

    /// Returns the position of a column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| &**n == name)
    }

    /// Returns a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&TableColumn> {
        self.column_index(name).map(|i| &self.columns[i])
    }

    /// Returns a column by position.
    #[must_use]
    pub fn column_at(&self, index: usize) -> Option<&TableColumn> {
        self.columns.get(index)
    }

    /// Returns all columns in order.
    #[must_use]
    pub fn columns(&self) -> &[TableColumn] {
        &self.columns
    }

    /// Returns a column by name as a flat column.
    ///
    /// # Errors
    ///
    /// Returns a schema error if the column is absent.
    pub fn flat_column(&self, name: &str) -> Result<ColumnRef> {
        self.column(name)
            .ok_or_else(|| TesseraError::SchemaError(format!("column '{name}' not found")))?
            .flatten()
    }

    /// Returns the pending selection, if any.
    #[must_use]
    pub fn selection(&self) -> Option<&Arc<RowSelection>> {
        self.selection.as_ref()
    }

    /// Attaches a selection, intersecting it with any existing one.
    pub fn with_selection(mut self, selection: RowSelection) -> Result<Self> {
        if selection.len() != self.nrows {
            return Err(TesseraError::LengthMismatch {
                left: self.nrows,
                right: selection.len(),
            });
        }
        let merged = match &self.selection {
            Some(existing) => existing.and(&selection)?,
            None => selection,
        };
        self.selection = Some(Arc::new(merged));
        Ok(self)
    }

    /// Returns the table with its pending selection dropped.
    #[must_use]
    pub fn without_selection(mut self) -> Self {
        self.selection = None;
        self
    }

    /// Returns true if every column is flat.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.columns
            .iter()
            .all(|c| matches!(c, TableColumn::Flat(_)))
    }

    /// Returns segment row offsets (`[0, end0, end1, ...]`) if any column is
    /// parted or constant-run.
    ///
    /// # Errors
    ///
    /// Returns a schema error if two non-flat columns disagree.
    pub fn segment_bounds(&self) -> Result<Option<Vec<usize>>> {
        let mut lens: Option<Vec<usize>> = None;
        for (name, column) in self.names.iter().zip(&self.columns) {
            let Some(these) = column.segment_lens() else {
                continue;
            };
            match &lens {
                Some(existing) if *existing != these => {
                    return Err(TesseraError::SchemaError(format!(
                        "column '{name}' has a different segment layout"
                    )));
                }
                Some(_) => {}
                None => lens = Some(these),
            }
        }
        Ok(lens.map(|lens| {
            let mut bounds = Vec::with_capacity(lens.len() + 1);
            bounds.push(0);
            let mut acc = 0;
            for n in lens {
                acc += n;
                bounds.push(acc);
            }
            bounds
        }))
    }

    /// Returns segment `seg` as a flat table, with its slice of the pending
    /// selection.
    pub fn segment(&self, seg: usize, bounds: &[usize]) -> Result<Table> {
        let (start, end) = (bounds[seg], bounds[seg + 1]);
        let mut out = Table::new();
        for (name, column) in self.names.iter().zip(&self.columns) {
            out.add_column(name, TableColumn::Flat(column.segment(seg, bounds)))?;
        }
        out.nrows = end - start;
        if let Some(sel) = &self.selection {
            out.selection = Some(Arc::new(sel.slice(start, end - start)));
        }
        Ok(out)
    }

    /// Returns a table whose columns are all flat, keeping the selection.
    pub fn flatten(&self) -> Result<Table> {
        if self.is_flat() {
            return Ok(self.clone());
        }
        let mut out = Table::new();
        for (name, column) in self.names.iter().zip(&self.columns) {
            out.add_column(name, TableColumn::Flat(column.flatten()?))?;
        }
        out.nrows = self.nrows;
        out.selection = self.selection.clone();
        Ok(out)
    }

    /// Returns a table holding only the named columns, flattening them.
    pub fn flatten_columns(&self, names: &[&str]) -> Result<Table> {
        let mut out = Table::new();
        for name in names {
            if out.column_index(name).is_none() {
                out.add_column(name, TableColumn::Flat(self.flat_column(name)?))?;
            }
        }
        out.nrows = self.nrows;
        out.selection = self.selection.clone();
        Ok(out)
    }

    /// Reads one cell.
    #[must_use]
    pub fn get(&self, row: usize, name: &str) -> Option<Value> {
        let column = self.column(name)?;
        match column {
            TableColumn::Flat(c) => (row < c.len()).then(|| c.get(row)),
            other => other.flatten().ok().and_then(|c| (row < c.len()).then(|| c.get(row))),
        }
    }

    /// Reads a whole column as values.
    pub fn column_values(&self, name: &str) -> Result<Vec<Value>> {
        Ok(self.flat_column(name)?.values())
    }

    /// Reads every row as a vector of values, in column order.
    pub fn rows(&self) -> Result<Vec<Vec<Value>>> {
        let flat: Vec<ColumnRef> = self
            .columns
            .iter()
            .map(TableColumn::flatten)
            .collect::<Result<_>>()?;
        Ok((0..self.nrows)
            .map(|r| flat.iter().map(|c| c.get(r)).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parted(chunks: &[&[i64]]) -> TableColumn {
        let segments = chunks
            .iter()
            .map(|c| Arc::new(Column::from_i64(c.to_vec())))
            .collect();
        TableColumn::Parted(PartedColumn::new(segments).unwrap())
    }

    #[test]
    fn test_add_column_length_mismatch() {
        let table = Table::new()
            .with_column("a", Column::from_i64(vec![1, 2]))
            .unwrap();
        let err = table.with_column("b", Column::from_i64(vec![1])).unwrap_err();
        assert!(matches!(err, TesseraError::LengthMismatch { .. }));
    }

    #[test]
    fn test_duplicate_column() {
        let table = Table::new().with_column("a", Column::from_i64(vec![1])).unwrap();
        assert!(table.with_column("a", Column::from_i64(vec![2])).is_err());
    }

    #[test]
    fn test_segment_bounds_and_segment() {
        let mut table = Table::new();
        table.add_column("v", parted(&[&[1, 2], &[3, 4, 5]])).unwrap();
        let runs = MapCommon::new(Arc::new(Column::from_i64(vec![7, 8])), vec![2, 3]).unwrap();
        table.add_column("p", TableColumn::MapCommon(runs)).unwrap();

        let bounds = table.segment_bounds().unwrap().unwrap();
        assert_eq!(bounds, vec![0, 2, 5]);

        let seg = table.segment(1, &bounds).unwrap();
        assert_eq!(seg.nrows(), 3);
        assert_eq!(seg.column_values("p").unwrap(), vec![Value::I64(8); 3]);
        assert_eq!(seg.get(0, "v"), Some(Value::I64(3)));
    }

    #[test]
    fn test_mismatched_segment_layout() {
        let mut table = Table::new();
        table.add_column("a", parted(&[&[1, 2], &[3]])).unwrap();
        assert!(table.add_column("b", parted(&[&[1], &[2, 3]])).is_err());
    }

    #[test]
    fn test_flatten_keeps_selection() {
        let mut table = Table::new();
        table.add_column("a", parted(&[&[1, 2], &[3]])).unwrap();
        let table = table
            .with_selection(RowSelection::from_predicate(&[true, false, true]))
            .unwrap();
        let flat = table.flatten().unwrap();
        assert!(flat.is_flat());
        assert_eq!(flat.selected_rows(), 2);
        assert_eq!(
            flat.column_values("a").unwrap(),
            vec![Value::I64(1), Value::I64(2), Value::I64(3)]
        );
    }
}
