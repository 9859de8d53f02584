//! Conversion between tables and Arrow record batches.
//!
//! Symbols export as Utf8 and import by interning every string; temporal
//! types map to Date32, Time32(ms) and Timestamp(µs). A pending selection is
//! applied on export.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    StringArray, Time32MillisecondArray, TimestampMicrosecondArray, UInt8Array,
};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};

use crate::error::{Result, TesseraError};
use crate::storage::{symbol, Column, ColumnData, NullMask, SymIds, Table, TableColumn};
use crate::types::DataType;

fn with_validity<T: Copy>(values: &[T], column: &Column) -> Vec<Option<T>> {
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| (!column.is_null(i)).then_some(v))
        .collect()
}

fn column_to_array(column: &Column) -> ArrayRef {
    match column.data() {
        ColumnData::Bool(v) => Arc::new(BooleanArray::from(with_validity(v, column))),
        ColumnData::U8(v) => Arc::new(UInt8Array::from(with_validity(v, column))),
        ColumnData::I16(v) => Arc::new(Int16Array::from(with_validity(v, column))),
        ColumnData::I32(v) => Arc::new(Int32Array::from(with_validity(v, column))),
        ColumnData::I64(v) => Arc::new(Int64Array::from(with_validity(v, column))),
        ColumnData::F64(v) => Arc::new(Float64Array::from(with_validity(v, column))),
        ColumnData::Date(v) => Arc::new(Date32Array::from(with_validity(v, column))),
        ColumnData::Time(v) => Arc::new(Time32MillisecondArray::from(with_validity(v, column))),
        ColumnData::Timestamp(v) => {
            Arc::new(TimestampMicrosecondArray::from(with_validity(v, column)))
        }
        ColumnData::Symbol(ids) => {
            let table = symbol::global().read();
            let strings: Vec<Option<&str>> = (0..ids.len())
                .map(|i| {
                    if column.is_null(i) {
                        None
                    } else {
                        table.resolve(ids.get(i)).map(|s| &**s)
                    }
                })
                .collect();
            Arc::new(StringArray::from(strings))
        }
    }
}

macro_rules! read_primitive {
    ($array:expr, $ty:ty, $variant:ident) => {{
        let arr = $array
            .as_any()
            .downcast_ref::<$ty>()
            .ok_or_else(|| TesseraError::type_error(stringify!($ty), format!("{:?}", $array.data_type())))?;
        ColumnData::$variant(
            (0..arr.len())
                .map(|i| if arr.is_null(i) { Default::default() } else { arr.value(i) })
                .collect(),
        )
    }};
}

fn array_to_column(array: &ArrayRef) -> Result<Column> {
    let data_type = DataType::from_arrow(array.data_type()).ok_or_else(|| {
        TesseraError::NotYetImplemented(format!("arrow type {:?}", array.data_type()))
    })?;
    let data = match data_type {
        DataType::Bool => read_primitive!(array, BooleanArray, Bool),
        DataType::U8 => read_primitive!(array, UInt8Array, U8),
        DataType::I16 => read_primitive!(array, Int16Array, I16),
        DataType::I32 => read_primitive!(array, Int32Array, I32),
        DataType::I64 => read_primitive!(array, Int64Array, I64),
        DataType::F64 => read_primitive!(array, Float64Array, F64),
        DataType::Date => read_primitive!(array, Date32Array, Date),
        DataType::Time => read_primitive!(array, Time32MillisecondArray, Time),
        DataType::Timestamp => read_primitive!(array, TimestampMicrosecondArray, Timestamp),
        DataType::Symbol => {
            let arr = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| TesseraError::type_error("Utf8", format!("{:?}", array.data_type())))?;
            let ids = symbol::intern_all(
                (0..arr.len()).map(|i| if arr.is_null(i) { "" } else { arr.value(i) }),
            );
            ColumnData::Symbol(SymIds::from_ids(&ids))
        }
    };
    let flags: Vec<bool> = (0..array.len()).map(|i| array.is_null(i)).collect();
    Column::new(data).with_nulls(NullMask::from_flags(&flags))
}

impl Table {
    /// Exports the selected rows as an Arrow record batch.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let indices = self.selection().map(|s| s.indices());
        let mut fields = Vec::with_capacity(self.ncols());
        let mut arrays = Vec::with_capacity(self.ncols());
        for (name, column) in self.names().iter().zip(self.columns()) {
            let flat = column.flatten()?;
            let flat = match &indices {
                Some(idx) => Arc::new(flat.gather(idx)),
                None => flat,
            };
            fields.push(Field::new(
                name.as_ref(),
                flat.data_type().to_arrow(),
                flat.has_nulls(),
            ));
            arrays.push(column_to_array(&flat));
        }
        let options = RecordBatchOptions::new().with_row_count(Some(self.selected_rows()));
        Ok(RecordBatch::try_new_with_options(
            Arc::new(Schema::new(fields)),
            arrays,
            &options,
        )?)
    }

    /// Imports an Arrow record batch as a table of flat columns.
    pub fn from_record_batch(batch: &RecordBatch) -> Result<Table> {
        let mut table = Table::new();
        for (field, array) in batch.schema().fields().iter().zip(batch.columns()) {
            table.add_column(field.name(), TableColumn::from(array_to_column(array)?))?;
        }
        Ok(table)
    }
}
