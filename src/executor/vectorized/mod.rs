//! Vectorized expression execution.
//!
//! Elementwise sub-trees are compiled into flat register programs and
//! evaluated one morsel at a time, each worker owning its own scratch
//! registers.

mod batch;
mod compiler;
pub(crate) mod evaluator;
pub(crate) mod kernels;

pub use compiler::{compile, Program, MAX_INSTRUCTIONS, MAX_REGISTERS};
