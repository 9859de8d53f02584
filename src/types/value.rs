//! Value and `DataType` definitions for tessera.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Supported column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean.
    Bool,
    /// 8-bit unsigned integer.
    U8,
    /// 16-bit signed integer.
    I16,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 64-bit floating point.
    F64,
    /// Dictionary-encoded string (ids into the global symbol table).
    Symbol,
    /// Date (days since Unix epoch).
    Date,
    /// Time of day (milliseconds since midnight).
    Time,
    /// Timestamp (microseconds since Unix epoch).
    Timestamp,
}

impl DataType {
    /// Returns the display name of the data type.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Bool => "BOOL",
            DataType::U8 => "U8",
            DataType::I16 => "I16",
            DataType::I32 => "I32",
            DataType::I64 => "I64",
            DataType::F64 => "F64",
            DataType::Symbol => "SYMBOL",
            DataType::Date => "DATE",
            DataType::Time => "TIME",
            DataType::Timestamp => "TIMESTAMP",
        }
    }

    /// Returns the element byte size, or None for symbols whose width adapts
    /// to the largest id stored.
    #[must_use]
    pub fn byte_size(&self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::U8 => Some(1),
            DataType::I16 => Some(2),
            DataType::I32 | DataType::Date | DataType::Time => Some(4),
            DataType::I64 | DataType::F64 | DataType::Timestamp => Some(8),
            DataType::Symbol => None,
        }
    }

    /// Returns true for every type whose values are held as integers,
    /// including booleans, symbol ids and temporal types.
    #[must_use]
    pub fn is_integral(&self) -> bool {
        !matches!(self, DataType::F64)
    }

    /// Returns whether this type is numeric.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::U8 | DataType::I16 | DataType::I32 | DataType::I64 | DataType::F64
        )
    }

    /// Returns true for the temporal types.
    #[must_use]
    pub fn is_temporal(&self) -> bool {
        matches!(self, DataType::Date | DataType::Time | DataType::Timestamp)
    }

    /// Result type of arithmetic between two operands: F64 if either side is
    /// floating point, I64 otherwise.
    #[must_use]
    pub fn promote(a: DataType, b: DataType) -> DataType {
        if a == DataType::F64 || b == DataType::F64 {
            DataType::F64
        } else {
            DataType::I64
        }
    }

    /// Converts to an Arrow data type.
    #[must_use]
    pub fn to_arrow(&self) -> arrow::datatypes::DataType {
        use arrow::datatypes::{DataType as Arrow, TimeUnit};
        match self {
            DataType::Bool => Arrow::Boolean,
            DataType::U8 => Arrow::UInt8,
            DataType::I16 => Arrow::Int16,
            DataType::I32 => Arrow::Int32,
            DataType::I64 => Arrow::Int64,
            DataType::F64 => Arrow::Float64,
            DataType::Symbol => Arrow::Utf8,
            DataType::Date => Arrow::Date32,
            DataType::Time => Arrow::Time32(TimeUnit::Millisecond),
            DataType::Timestamp => Arrow::Timestamp(TimeUnit::Microsecond, None),
        }
    }

    /// Converts from an Arrow data type.
    ///
    /// Returns None for unsupported Arrow types.
    #[must_use]
    pub fn from_arrow(arrow_type: &arrow::datatypes::DataType) -> Option<Self> {
        use arrow::datatypes::{DataType as Arrow, TimeUnit};
        match arrow_type {
            Arrow::Boolean => Some(DataType::Bool),
            Arrow::UInt8 => Some(DataType::U8),
            Arrow::Int16 => Some(DataType::I16),
            Arrow::Int32 => Some(DataType::I32),
            Arrow::Int64 => Some(DataType::I64),
            Arrow::Float64 => Some(DataType::F64),
            Arrow::Utf8 => Some(DataType::Symbol),
            Arrow::Date32 => Some(DataType::Date),
            Arrow::Time32(TimeUnit::Millisecond) => Some(DataType::Time),
            Arrow::Timestamp(TimeUnit::Microsecond, None) => Some(DataType::Timestamp),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single scalar value: graph literals, reduction results and cell reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 8-bit unsigned integer value.
    U8(u8),
    /// 16-bit signed integer value.
    I16(i16),
    /// 32-bit signed integer value.
    I32(i32),
    /// 64-bit signed integer value.
    I64(i64),
    /// 64-bit floating point value.
    F64(f64),
    /// String value; symbol cells read back as strings.
    Str(Arc<str>),
    /// Date value (days since Unix epoch).
    Date(i32),
    /// Time value (milliseconds since midnight).
    Time(i32),
    /// Timestamp value (microseconds since Unix epoch).
    Timestamp(i64),
}

impl Value {
    /// Creates a string value.
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    /// Returns true if this value is null.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the data type of this value, or None for Null.
    #[must_use]
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(DataType::Bool),
            Value::U8(_) => Some(DataType::U8),
            Value::I16(_) => Some(DataType::I16),
            Value::I32(_) => Some(DataType::I32),
            Value::I64(_) => Some(DataType::I64),
            Value::F64(_) => Some(DataType::F64),
            Value::Str(_) => Some(DataType::Symbol),
            Value::Date(_) => Some(DataType::Date),
            Value::Time(_) => Some(DataType::Time),
            Value::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    /// Returns the value as an i64 for every integral variant.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::U8(v) => Some(i64::from(*v)),
            Value::I16(v) => Some(i64::from(*v)),
            Value::I32(v) | Value::Date(v) | Value::Time(v) => Some(i64::from(*v)),
            Value::I64(v) | Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as an f64 for every numeric variant.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(f) => Some(*f),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// Attempts to extract a bool value.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Attempts to extract a string reference.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Compares two values using SQL null semantics.
    ///
    /// Numeric variants compare across widths; returns None if either value
    /// is null or the kinds are incomparable.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::F64(_), _) | (_, Value::F64(_)) => {
                self.as_f64()?.partial_cmp(&other.as_f64()?)
            }
            _ => Some(self.as_i64()?.cmp(&other.as_i64()?)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
            Value::Date(days) => {
                match chrono::NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
                {
                    Some(date) => write!(f, "{}", date.format("%Y-%m-%d")),
                    None => write!(f, "date({days})"),
                }
            }
            Value::Time(ms) => {
                let secs = ms.div_euclid(1000) as u32;
                let nanos = ms.rem_euclid(1000) as u32 * 1_000_000;
                match chrono::NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos) {
                    Some(time) => write!(f, "{}", time.format("%H:%M:%S%.3f")),
                    None => write!(f, "time({ms})"),
                }
            }
            Value::Timestamp(us) => match chrono::DateTime::from_timestamp_micros(*us) {
                Some(ts) => write!(f, "{}", ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f")),
                None => write!(f, "timestamp({us})"),
            },
        }
    }
}

/// Days from 0001-01-01 to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promote() {
        assert_eq!(DataType::promote(DataType::I32, DataType::U8), DataType::I64);
        assert_eq!(DataType::promote(DataType::I64, DataType::F64), DataType::F64);
    }

    #[test]
    fn test_compare_mixed_numeric() {
        assert_eq!(Value::I32(3).compare(&Value::F64(2.5)), Some(Ordering::Greater));
        assert_eq!(Value::I64(1).compare(&Value::Null), None);
        assert_eq!(Value::str("a").compare(&Value::str("b")), Some(Ordering::Less));
    }

    #[test]
    fn test_temporal_display() {
        assert_eq!(Value::Date(0).to_string(), "1970-01-01");
        assert_eq!(Value::Time(3_723_004).to_string(), "01:02:03.004");
        assert_eq!(Value::Timestamp(0).to_string(), "1970-01-01 00:00:00.000000");
    }

    #[test]
    fn test_arrow_round_trip_types() {
        for dt in [DataType::I64, DataType::Symbol, DataType::Time, DataType::Timestamp] {
            assert_eq!(DataType::from_arrow(&dt.to_arrow()), Some(dt));
        }
    }
}
