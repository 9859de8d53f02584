//! Scalar types and values.

mod value;

pub use value::{DataType, Value};
