//! Storage module for in-memory columnar data.
//!
//! This module provides the data model the execution engines consume:
//! - Typed, reference-counted columns ([`Column`], [`ColumnRef`])
//! - Tables with flat, parted and constant-run columns ([`Table`])
//! - Lazily applied row selections ([`RowSelection`])
//! - The global symbol dictionary ([`symbol`])
//! - Byte-budgeted scratch memory ([`MemoryArena`])
//! - Arrow `RecordBatch` import/export ([`arrow_interop`])

mod arena;
mod column;
mod selection;
mod table;

pub mod arrow_interop;
pub mod symbol;

pub use arena::{MemoryArena, Reservation, ScratchVec};
pub use column::{Column, ColumnData, ColumnRef, NullMask, Primitive, SymIds, NO_ROW};
pub(crate) use column::{split_lens, CellsMut};
pub use selection::{BatchSelection, RowSelection, SegmentFlag};
pub use table::{MapCommon, PartedColumn, Table, TableColumn};
