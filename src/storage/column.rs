//! Typed columnar buffers.
//!
//! A [`Column`] owns one contiguous typed buffer plus an optional null mask.
//! Columns are immutable once published and shared through [`ColumnRef`]
//! (an `Arc`), so retain/release is a clone/drop of the handle.

use std::sync::Arc;

use crate::error::{Result, TesseraError};
use crate::storage::symbol;
use crate::types::{DataType, Value};

/// Shared, immutable column handle.
pub type ColumnRef = Arc<Column>;

/// Row index used by gathers to mean "no source row"; gathers emit a null.
pub const NO_ROW: u32 = u32::MAX;

/// Element types stored in column buffers, with the conversions used by the
/// integer and floating-point working lanes.
pub trait Primitive: Copy + Default + Send + Sync + 'static {
    /// Widens the element to the integer lane.
    fn to_i64(self) -> i64;
    /// Widens the element to the floating-point lane.
    fn to_f64(self) -> f64;
}

macro_rules! impl_primitive {
    ($($t:ty),*) => {
        $(
            impl Primitive for $t {
                #[inline]
                #[allow(clippy::cast_possible_wrap, clippy::cast_lossless)]
                fn to_i64(self) -> i64 {
                    self as i64
                }

                #[inline]
                #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_primitive!(u8, u16, u32, u64, i16, i32, i64);

impl Primitive for bool {
    #[inline]
    fn to_i64(self) -> i64 {
        i64::from(self)
    }

    #[inline]
    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }
}

impl Primitive for f64 {
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn to_i64(self) -> i64 {
        self as i64
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}

/// Symbol ids stored at the narrowest width that holds the largest id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymIds {
    /// One-byte ids.
    W8(Vec<u8>),
    /// Two-byte ids.
    W16(Vec<u16>),
    /// Four-byte ids.
    W32(Vec<u32>),
    /// Eight-byte ids.
    W64(Vec<u64>),
}

impl SymIds {
    /// Packs ids at the narrowest sufficient width.
    #[must_use]
    pub fn from_ids(ids: &[u64]) -> Self {
        let max = ids.iter().copied().max().unwrap_or(0);
        if max <= u64::from(u8::MAX) {
            SymIds::W8(ids.iter().map(|&v| v as u8).collect())
        } else if max <= u64::from(u16::MAX) {
            SymIds::W16(ids.iter().map(|&v| v as u16).collect())
        } else if max <= u64::from(u32::MAX) {
            SymIds::W32(ids.iter().map(|&v| v as u32).collect())
        } else {
            SymIds::W64(ids.to_vec())
        }
    }

    /// Returns the id width in bytes.
    #[must_use]
    pub fn width(&self) -> usize {
        match self {
            SymIds::W8(_) => 1,
            SymIds::W16(_) => 2,
            SymIds::W32(_) => 4,
            SymIds::W64(_) => 8,
        }
    }

    /// Returns the number of ids.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            SymIds::W8(v) => v.len(),
            SymIds::W16(v) => v.len(),
            SymIds::W32(v) => v.len(),
            SymIds::W64(v) => v.len(),
        }
    }

    /// Returns true if there are no ids.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the id at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> u64 {
        match self {
            SymIds::W8(v) => u64::from(v[index]),
            SymIds::W16(v) => u64::from(v[index]),
            SymIds::W32(v) => u64::from(v[index]),
            SymIds::W64(v) => v[index],
        }
    }

    /// Widens every id to 64 bits.
    #[must_use]
    pub fn to_ids(&self) -> Vec<u64> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }
}

/// Physical buffer of a column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    /// Boolean values.
    Bool(Vec<bool>),
    /// 8-bit unsigned integers.
    U8(Vec<u8>),
    /// 16-bit signed integers.
    I16(Vec<i16>),
    /// 32-bit signed integers.
    I32(Vec<i32>),
    /// 64-bit signed integers.
    I64(Vec<i64>),
    /// 64-bit floats.
    F64(Vec<f64>),
    /// Symbol ids.
    Symbol(SymIds),
    /// Days since epoch.
    Date(Vec<i32>),
    /// Milliseconds since midnight.
    Time(Vec<i32>),
    /// Microseconds since epoch.
    Timestamp(Vec<i64>),
}

/// Runs `$body` with `$v` bound to the typed buffer, whatever its element type.
macro_rules! with_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ColumnData::Bool($v) => $body,
            ColumnData::U8($v) => $body,
            ColumnData::I16($v) => $body,
            ColumnData::I32($v) | ColumnData::Date($v) | ColumnData::Time($v) => $body,
            ColumnData::I64($v) | ColumnData::Timestamp($v) => $body,
            ColumnData::F64($v) => $body,
            ColumnData::Symbol(SymIds::W8($v)) => $body,
            ColumnData::Symbol(SymIds::W16($v)) => $body,
            ColumnData::Symbol(SymIds::W32($v)) => $body,
            ColumnData::Symbol(SymIds::W64($v)) => $body,
        }
    };
}

/// Builds a buffer of the same variant (and symbol width) from `$body`.
macro_rules! map_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ColumnData::Bool($v) => ColumnData::Bool($body),
            ColumnData::U8($v) => ColumnData::U8($body),
            ColumnData::I16($v) => ColumnData::I16($body),
            ColumnData::I32($v) => ColumnData::I32($body),
            ColumnData::I64($v) => ColumnData::I64($body),
            ColumnData::F64($v) => ColumnData::F64($body),
            ColumnData::Date($v) => ColumnData::Date($body),
            ColumnData::Time($v) => ColumnData::Time($body),
            ColumnData::Timestamp($v) => ColumnData::Timestamp($body),
            ColumnData::Symbol(SymIds::W8($v)) => ColumnData::Symbol(SymIds::W8($body)),
            ColumnData::Symbol(SymIds::W16($v)) => ColumnData::Symbol(SymIds::W16($body)),
            ColumnData::Symbol(SymIds::W32($v)) => ColumnData::Symbol(SymIds::W32($body)),
            ColumnData::Symbol(SymIds::W64($v)) => ColumnData::Symbol(SymIds::W64($body)),
        }
    };
}

/// A mutable window over a [`ColumnData`] buffer, by element type.
#[derive(Debug)]
pub(crate) enum CellsMut<'a> {
    Bool(&'a mut [bool]),
    U8(&'a mut [u8]),
    I16(&'a mut [i16]),
    U16(&'a mut [u16]),
    I32(&'a mut [i32]),
    U32(&'a mut [u32]),
    I64(&'a mut [i64]),
    U64(&'a mut [u64]),
    F64(&'a mut [f64]),
}

/// Splits `buf` into consecutive windows of `lens` elements.
pub(crate) fn split_lens<'a, T>(mut buf: &'a mut [T], lens: &[usize]) -> Vec<&'a mut [T]> {
    let mut windows = Vec::with_capacity(lens.len());
    for &len in lens {
        let len = len.min(buf.len());
        let (head, tail) = std::mem::take(&mut buf).split_at_mut(len);
        windows.push(head);
        buf = tail;
    }
    windows
}

impl ColumnData {
    /// A buffer of `len` default cells with the same physical layout.
    #[must_use]
    pub(crate) fn zeroed_like(&self, len: usize) -> Self {
        map_data!(self, _v => vec![Default::default(); len])
    }

    /// Splits the buffer into consecutive windows of `lens` cells.
    pub(crate) fn split_mut(&mut self, lens: &[usize]) -> Vec<CellsMut<'_>> {
        fn windows<'a, T>(
            buf: &'a mut [T],
            lens: &[usize],
            wrap: fn(&'a mut [T]) -> CellsMut<'a>,
        ) -> Vec<CellsMut<'a>> {
            split_lens(buf, lens).into_iter().map(wrap).collect()
        }
        match self {
            ColumnData::Bool(v) => windows(v, lens, CellsMut::Bool),
            ColumnData::U8(v) | ColumnData::Symbol(SymIds::W8(v)) => windows(v, lens, CellsMut::U8),
            ColumnData::I16(v) => windows(v, lens, CellsMut::I16),
            ColumnData::Symbol(SymIds::W16(v)) => windows(v, lens, CellsMut::U16),
            ColumnData::I32(v) | ColumnData::Date(v) | ColumnData::Time(v) => {
                windows(v, lens, CellsMut::I32)
            }
            ColumnData::Symbol(SymIds::W32(v)) => windows(v, lens, CellsMut::U32),
            ColumnData::I64(v) | ColumnData::Timestamp(v) => windows(v, lens, CellsMut::I64),
            ColumnData::Symbol(SymIds::W64(v)) => windows(v, lens, CellsMut::U64),
            ColumnData::F64(v) => windows(v, lens, CellsMut::F64),
        }
    }

    /// Creates an empty buffer of the given type.
    #[must_use]
    pub fn empty(data_type: DataType) -> Self {
        match data_type {
            DataType::Bool => ColumnData::Bool(Vec::new()),
            DataType::U8 => ColumnData::U8(Vec::new()),
            DataType::I16 => ColumnData::I16(Vec::new()),
            DataType::I32 => ColumnData::I32(Vec::new()),
            DataType::I64 => ColumnData::I64(Vec::new()),
            DataType::F64 => ColumnData::F64(Vec::new()),
            DataType::Symbol => ColumnData::Symbol(SymIds::W8(Vec::new())),
            DataType::Date => ColumnData::Date(Vec::new()),
            DataType::Time => ColumnData::Time(Vec::new()),
            DataType::Timestamp => ColumnData::Timestamp(Vec::new()),
        }
    }

    /// Narrows integer-lane values into a buffer of `data_type`.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn from_i64(data_type: DataType, values: Vec<i64>) -> Self {
        match data_type {
            DataType::I64 => ColumnData::I64(values),
            DataType::Timestamp => ColumnData::Timestamp(values),
            DataType::Bool => ColumnData::Bool(values.iter().map(|&v| v != 0).collect()),
            DataType::U8 => ColumnData::U8(values.iter().map(|&v| v as u8).collect()),
            DataType::I16 => ColumnData::I16(values.iter().map(|&v| v as i16).collect()),
            DataType::I32 => ColumnData::I32(values.iter().map(|&v| v as i32).collect()),
            DataType::Date => ColumnData::Date(values.iter().map(|&v| v as i32).collect()),
            DataType::Time => ColumnData::Time(values.iter().map(|&v| v as i32).collect()),
            DataType::F64 => ColumnData::F64(values.iter().map(|&v| v as f64).collect()),
            DataType::Symbol => {
                let ids: Vec<u64> = values.iter().map(|&v| v as u64).collect();
                ColumnData::Symbol(SymIds::from_ids(&ids))
            }
        }
    }

    /// Converts floating-lane values into a buffer of `data_type`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_f64(data_type: DataType, values: Vec<f64>) -> Self {
        match data_type {
            DataType::F64 => ColumnData::F64(values),
            other => ColumnData::from_i64(other, values.iter().map(|&v| v as i64).collect()),
        }
    }

    /// Returns the logical type of the buffer.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnData::Bool(_) => DataType::Bool,
            ColumnData::U8(_) => DataType::U8,
            ColumnData::I16(_) => DataType::I16,
            ColumnData::I32(_) => DataType::I32,
            ColumnData::I64(_) => DataType::I64,
            ColumnData::F64(_) => DataType::F64,
            ColumnData::Symbol(_) => DataType::Symbol,
            ColumnData::Date(_) => DataType::Date,
            ColumnData::Time(_) => DataType::Time,
            ColumnData::Timestamp(_) => DataType::Timestamp,
        }
    }

    /// Returns the number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        with_data!(self, v => v.len())
    }

    /// Returns true if the buffer has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the element size in bytes.
    #[must_use]
    pub fn element_size(&self) -> usize {
        match self {
            ColumnData::Symbol(ids) => ids.width(),
            other => other.data_type().byte_size().unwrap_or(8),
        }
    }

    /// Appends every element of `other`; both buffers must have the same type.
    ///
    /// Symbol buffers of different widths are re-packed at the wider width.
    pub fn append(&mut self, other: &ColumnData) -> Result<()> {
        match (self, other) {
            (ColumnData::Bool(a), ColumnData::Bool(b)) => a.extend_from_slice(b),
            (ColumnData::U8(a), ColumnData::U8(b)) => a.extend_from_slice(b),
            (ColumnData::I16(a), ColumnData::I16(b)) => a.extend_from_slice(b),
            (ColumnData::I32(a), ColumnData::I32(b))
            | (ColumnData::Date(a), ColumnData::Date(b))
            | (ColumnData::Time(a), ColumnData::Time(b)) => a.extend_from_slice(b),
            (ColumnData::I64(a), ColumnData::I64(b))
            | (ColumnData::Timestamp(a), ColumnData::Timestamp(b)) => a.extend_from_slice(b),
            (ColumnData::F64(a), ColumnData::F64(b)) => a.extend_from_slice(b),
            (ColumnData::Symbol(a), ColumnData::Symbol(b)) => match (&mut *a, b) {
                (SymIds::W8(x), SymIds::W8(y)) => x.extend_from_slice(y),
                (SymIds::W16(x), SymIds::W16(y)) => x.extend_from_slice(y),
                (SymIds::W32(x), SymIds::W32(y)) => x.extend_from_slice(y),
                (SymIds::W64(x), SymIds::W64(y)) => x.extend_from_slice(y),
                (x, y) => {
                    let mut ids = x.to_ids();
                    ids.extend(y.to_ids());
                    *x = SymIds::from_ids(&ids);
                }
            },
            (a, b) => {
                return Err(TesseraError::type_error(
                    a.data_type().name(),
                    b.data_type().name(),
                ))
            }
        }
        Ok(())
    }
}

/// Null mask: one bit per row, set when the row is null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullMask {
    words: Vec<u64>,
    len: usize,
}

impl NullMask {
    /// Creates a mask with every row valid.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Creates a mask from per-row null flags.
    #[must_use]
    pub fn from_flags(flags: &[bool]) -> Self {
        let mut mask = Self::new(flags.len());
        for (i, &null) in flags.iter().enumerate() {
            if null {
                mask.set_null(i);
            }
        }
        mask
    }

    /// Returns the number of rows covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mask covers no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if row `i` is null.
    #[inline]
    #[must_use]
    pub fn is_null(&self, i: usize) -> bool {
        (self.words[i >> 6] >> (i & 63)) & 1 == 1
    }

    /// Marks row `i` as null.
    #[inline]
    pub fn set_null(&mut self, i: usize) {
        self.words[i >> 6] |= 1 << (i & 63);
    }

    /// Returns the number of null rows.
    #[must_use]
    pub fn null_count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn slice(&self, start: usize, len: usize) -> Self {
        let mut out = Self::new(len);
        for i in (0..len).filter(|&i| self.is_null(start + i)) {
            out.set_null(i);
        }
        out
    }

    fn append(&mut self, other: &NullMask) {
        let base = self.len;
        self.len += other.len;
        self.words.resize(self.len.div_ceil(64), 0);
        for i in (0..other.len).filter(|&i| other.is_null(i)) {
            self.set_null(base + i);
        }
    }
}

/// An immutable typed column with an optional null mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    data: ColumnData,
    nulls: Option<NullMask>,
}

impl Column {
    /// Creates a column without nulls.
    #[must_use]
    pub fn new(data: ColumnData) -> Self {
        Self { data, nulls: None }
    }

    /// Attaches a null mask. A mask without any null row is dropped.
    pub fn with_nulls(mut self, nulls: NullMask) -> Result<Self> {
        if nulls.len() != self.len() {
            return Err(TesseraError::LengthMismatch {
                left: self.len(),
                right: nulls.len(),
            });
        }
        self.nulls = (nulls.null_count() > 0).then_some(nulls);
        Ok(self)
    }

    /// Creates an empty column of the given type.
    #[must_use]
    pub fn empty(data_type: DataType) -> Self {
        Self::new(ColumnData::empty(data_type))
    }

    /// Creates an I64 column.
    #[must_use]
    pub fn from_i64(values: Vec<i64>) -> Self {
        Self::new(ColumnData::I64(values))
    }

    /// Creates an I32 column.
    #[must_use]
    pub fn from_i32(values: Vec<i32>) -> Self {
        Self::new(ColumnData::I32(values))
    }

    /// Creates an F64 column.
    #[must_use]
    pub fn from_f64(values: Vec<f64>) -> Self {
        Self::new(ColumnData::F64(values))
    }

    /// Creates a Bool column.
    #[must_use]
    pub fn from_bool(values: Vec<bool>) -> Self {
        Self::new(ColumnData::Bool(values))
    }

    /// Creates a symbol column, interning every string.
    #[must_use]
    pub fn from_symbols<S: AsRef<str>>(values: &[S]) -> Self {
        let ids = symbol::intern_all(values.iter().map(AsRef::as_ref));
        Self::new(ColumnData::Symbol(SymIds::from_ids(&ids)))
    }

    /// Builds a column of `data_type` from scalar values; `Value::Null`
    /// becomes a null row.
    pub fn from_values(data_type: DataType, values: &[Value]) -> Result<Self> {
        let mut flags = vec![false; values.len()];
        let data = match data_type {
            DataType::F64 => {
                let mut out = Vec::with_capacity(values.len());
                for (i, v) in values.iter().enumerate() {
                    if v.is_null() {
                        flags[i] = true;
                        out.push(0.0);
                    } else {
                        out.push(
                            v.as_f64()
                                .ok_or_else(|| TesseraError::type_error("F64", format!("{v:?}")))?,
                        );
                    }
                }
                ColumnData::F64(out)
            }
            DataType::Symbol => {
                let mut out = Vec::with_capacity(values.len());
                for (i, v) in values.iter().enumerate() {
                    match v {
                        Value::Null => {
                            flags[i] = true;
                            out.push(0);
                        }
                        Value::Str(s) => out.push(symbol::intern(s)),
                        other => {
                            return Err(TesseraError::type_error("SYMBOL", format!("{other:?}")))
                        }
                    }
                }
                ColumnData::Symbol(SymIds::from_ids(&out))
            }
            other => {
                let mut out = Vec::with_capacity(values.len());
                for (i, v) in values.iter().enumerate() {
                    if v.is_null() {
                        flags[i] = true;
                        out.push(0);
                    } else {
                        out.push(v.as_i64().ok_or_else(|| {
                            TesseraError::type_error(other.name(), format!("{v:?}"))
                        })?);
                    }
                }
                ColumnData::from_i64(other, out)
            }
        };
        Column::new(data).with_nulls(NullMask::from_flags(&flags))
    }

    /// Returns the physical buffer.
    #[must_use]
    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    /// Returns the null mask, if any row is null.
    #[must_use]
    pub fn nulls(&self) -> Option<&NullMask> {
        self.nulls.as_ref()
    }

    /// Returns true if any row is null.
    #[must_use]
    pub fn has_nulls(&self) -> bool {
        self.nulls.is_some()
    }

    /// Returns true if row `i` is null.
    #[inline]
    #[must_use]
    pub fn is_null(&self, i: usize) -> bool {
        self.nulls.as_ref().is_some_and(|m| m.is_null(i))
    }

    /// Returns the logical type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the column has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the approximate buffer size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.len() * self.data.element_size() + self.len().div_ceil(8) * usize::from(self.has_nulls())
    }

    /// Reads row `i` as a scalar value.
    #[must_use]
    pub fn get(&self, i: usize) -> Value {
        if self.is_null(i) {
            return Value::Null;
        }
        match &self.data {
            ColumnData::Bool(v) => Value::Bool(v[i]),
            ColumnData::U8(v) => Value::U8(v[i]),
            ColumnData::I16(v) => Value::I16(v[i]),
            ColumnData::I32(v) => Value::I32(v[i]),
            ColumnData::I64(v) => Value::I64(v[i]),
            ColumnData::F64(v) => Value::F64(v[i]),
            ColumnData::Symbol(ids) => symbol::resolve(ids.get(i)).map_or(Value::Null, Value::Str),
            ColumnData::Date(v) => Value::Date(v[i]),
            ColumnData::Time(v) => Value::Time(v[i]),
            ColumnData::Timestamp(v) => Value::Timestamp(v[i]),
        }
    }

    /// Reads every row as scalar values.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    /// Reads row `i` in the integer lane.
    #[inline]
    #[must_use]
    pub fn i64_at(&self, i: usize) -> i64 {
        with_data!(&self.data, v => v[i].to_i64())
    }

    /// Reads row `i` in the floating-point lane.
    #[inline]
    #[must_use]
    pub fn f64_at(&self, i: usize) -> f64 {
        with_data!(&self.data, v => v[i].to_f64())
    }

    /// Borrows the buffer when it is already laid out as i64.
    #[must_use]
    pub fn as_i64_slice(&self) -> Option<&[i64]> {
        match &self.data {
            ColumnData::I64(v) | ColumnData::Timestamp(v) => Some(v),
            _ => None,
        }
    }

    /// Borrows the buffer when it is already laid out as f64.
    #[must_use]
    pub fn as_f64_slice(&self) -> Option<&[f64]> {
        match &self.data {
            ColumnData::F64(v) => Some(v),
            _ => None,
        }
    }

    /// Borrows the buffer when it is already laid out as bool.
    #[must_use]
    pub fn as_bool_slice(&self) -> Option<&[bool]> {
        match &self.data {
            ColumnData::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Converts rows `start..start + out.len()` into the integer lane.
    pub fn load_i64(&self, start: usize, out: &mut [i64]) {
        with_data!(&self.data, v => {
            for (o, x) in out.iter_mut().zip(&v[start..]) {
                *o = x.to_i64();
            }
        });
    }

    /// Converts rows `start..start + out.len()` into the floating-point lane.
    pub fn load_f64(&self, start: usize, out: &mut [f64]) {
        with_data!(&self.data, v => {
            for (o, x) in out.iter_mut().zip(&v[start..]) {
                *o = x.to_f64();
            }
        });
    }

    /// Converts rows `start..start + out.len()` into the boolean lane.
    pub fn load_bool(&self, start: usize, out: &mut [bool]) {
        if let ColumnData::Bool(v) = &self.data {
            out.copy_from_slice(&v[start..start + out.len()]);
            return;
        }
        with_data!(&self.data, v => {
            for (o, x) in out.iter_mut().zip(&v[start..]) {
                *o = x.to_f64() != 0.0;
            }
        });
    }

    /// Copies rows `start..start + len`.
    #[must_use]
    pub fn slice(&self, start: usize, len: usize) -> Column {
        Column {
            data: map_data!(&self.data, v => v[start..start + len].to_vec()),
            nulls: self
                .nulls
                .as_ref()
                .map(|m| m.slice(start, len))
                .filter(|m| m.null_count() > 0),
        }
    }

    /// Gathers rows by index. Every index must be in range.
    #[must_use]
    pub fn gather(&self, indices: &[u32]) -> Column {
        let data = map_data!(&self.data, v => indices.iter().map(|&i| v[i as usize]).collect());
        let nulls = self.nulls.as_ref().and_then(|m| {
            let flags: Vec<bool> = indices.iter().map(|&i| m.is_null(i as usize)).collect();
            let mask = NullMask::from_flags(&flags);
            (mask.null_count() > 0).then_some(mask)
        });
        Column { data, nulls }
    }

    /// Gathers rows by index, emitting a null for every [`NO_ROW`] index.
    #[must_use]
    pub fn gather_nullable(&self, indices: &[u32]) -> Column {
        let data = map_data!(&self.data, v => indices
            .iter()
            .map(|&i| if i == NO_ROW { Default::default() } else { v[i as usize] })
            .collect());
        let flags: Vec<bool> = indices
            .iter()
            .map(|&i| i == NO_ROW || self.is_null(i as usize))
            .collect();
        let mask = NullMask::from_flags(&flags);
        Column {
            data,
            nulls: (mask.null_count() > 0).then_some(mask),
        }
    }

    /// Writes rows `indices` into `out[at..]` and, when given, their null
    /// flags into `nulls[at..]`. [`NO_ROW`] indices leave the cell at its
    /// default and flag it null.
    pub(crate) fn gather_into(
        &self,
        indices: &[u32],
        out: &mut CellsMut<'_>,
        nulls: Option<&mut [bool]>,
        at: usize,
    ) -> Result<()> {
        #[inline]
        fn put<T: Copy>(src: &[T], dst: &mut [T], indices: &[u32]) {
            for (cell, &i) in dst.iter_mut().zip(indices) {
                if i != NO_ROW {
                    *cell = src[i as usize];
                }
            }
        }
        let end = at + indices.len();
        match (&self.data, out) {
            (ColumnData::Bool(s), CellsMut::Bool(d)) => put(s, &mut d[at..end], indices),
            (ColumnData::U8(s) | ColumnData::Symbol(SymIds::W8(s)), CellsMut::U8(d)) => {
                put(s, &mut d[at..end], indices);
            }
            (ColumnData::I16(s), CellsMut::I16(d)) => put(s, &mut d[at..end], indices),
            (ColumnData::Symbol(SymIds::W16(s)), CellsMut::U16(d)) => put(s, &mut d[at..end], indices),
            (ColumnData::I32(s) | ColumnData::Date(s) | ColumnData::Time(s), CellsMut::I32(d)) => {
                put(s, &mut d[at..end], indices);
            }
            (ColumnData::Symbol(SymIds::W32(s)), CellsMut::U32(d)) => put(s, &mut d[at..end], indices),
            (ColumnData::I64(s) | ColumnData::Timestamp(s), CellsMut::I64(d)) => {
                put(s, &mut d[at..end], indices);
            }
            (ColumnData::Symbol(SymIds::W64(s)), CellsMut::U64(d)) => put(s, &mut d[at..end], indices),
            (ColumnData::F64(s), CellsMut::F64(d)) => put(s, &mut d[at..end], indices),
            (data, _) => {
                return Err(TesseraError::type_error(
                    data.data_type().name(),
                    "a buffer of another layout",
                ))
            }
        }
        if let Some(nulls) = nulls {
            for (flag, &i) in nulls[at..end].iter_mut().zip(indices) {
                *flag = i == NO_ROW || self.is_null(i as usize);
            }
        }
        Ok(())
    }

    /// Concatenates columns of one type in order.
    pub fn concat(parts: &[&Column]) -> Result<Column> {
        let Some(first) = parts.first() else {
            return Err(TesseraError::DomainError(
                "cannot concatenate zero columns".to_string(),
            ));
        };
        let mut data = first.data.clone();
        let any_nulls = parts.iter().any(|c| c.has_nulls());
        let mut nulls = any_nulls.then(|| first.nulls.clone().unwrap_or_else(|| NullMask::new(first.len())));
        for part in &parts[1..] {
            data.append(&part.data)?;
            if let Some(mask) = nulls.as_mut() {
                match &part.nulls {
                    Some(m) => mask.append(m),
                    None => mask.append(&NullMask::new(part.len())),
                }
            }
        }
        Ok(Column { data, nulls })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_width_adapts() {
        assert_eq!(SymIds::from_ids(&[1, 200]).width(), 1);
        assert_eq!(SymIds::from_ids(&[1, 300]).width(), 2);
        assert_eq!(SymIds::from_ids(&[70_000]).width(), 4);
        assert_eq!(SymIds::from_ids(&[1 << 40]).width(), 8);
    }

    #[test]
    fn test_append_widens_symbols() {
        let mut a = ColumnData::Symbol(SymIds::from_ids(&[1, 2]));
        a.append(&ColumnData::Symbol(SymIds::from_ids(&[1000]))).unwrap();
        match a {
            ColumnData::Symbol(ids) => {
                assert_eq!(ids.width(), 2);
                assert_eq!(ids.to_ids(), vec![1, 2, 1000]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_append_type_mismatch() {
        let mut a = ColumnData::I64(vec![1]);
        assert!(a.append(&ColumnData::F64(vec![1.0])).is_err());
    }

    #[test]
    fn test_from_values_with_nulls() {
        let col = Column::from_values(
            DataType::I32,
            &[Value::I64(1), Value::Null, Value::I64(3)],
        )
        .unwrap();
        assert_eq!(col.data_type(), DataType::I32);
        assert!(col.is_null(1));
        assert_eq!(col.get(2), Value::I32(3));
        assert_eq!(col.nulls().map(NullMask::null_count), Some(1));
    }

    #[test]
    fn test_gather_nullable() {
        let col = Column::from_i64(vec![10, 20, 30]);
        let out = col.gather_nullable(&[2, NO_ROW, 0]);
        assert_eq!(out.values(), vec![Value::I64(30), Value::Null, Value::I64(10)]);
    }

    #[test]
    fn test_concat_merges_null_masks() {
        let a = Column::from_i64(vec![1, 2]);
        let b = Column::from_values(DataType::I64, &[Value::Null, Value::I64(4)]).unwrap();
        let out = Column::concat(&[&a, &b]).unwrap();
        assert_eq!(
            out.values(),
            vec![Value::I64(1), Value::I64(2), Value::Null, Value::I64(4)]
        );
    }

    #[test]
    fn test_load_conversions() {
        let col = Column::new(ColumnData::I16(vec![-3, 4, 5]));
        let mut ints = [0i64; 2];
        col.load_i64(1, &mut ints);
        assert_eq!(ints, [4, 5]);
        let mut floats = [0f64; 3];
        col.load_f64(0, &mut floats);
        assert_eq!(floats, [-3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_symbols_read_back_as_strings() {
        let col = Column::from_symbols(&["x", "y", "x"]);
        assert_eq!(col.get(0), col.get(2));
        assert_eq!(col.get(1), Value::str("y"));
    }
}
