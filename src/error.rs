//! Error types for tessera execution.

use thiserror::Error;

/// Result type alias using [`TesseraError`].
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Error types raised while executing an operator graph.
#[derive(Debug, Error)]
pub enum TesseraError {
    /// An allocation failed, either in the allocator itself or against the
    /// arena's byte budget.
    #[error("Out of memory: could not allocate {requested} bytes for {context}")]
    OutOfMemory {
        requested: usize,
        context: &'static str,
    },

    /// The configured memory limit would be exceeded.
    #[error("Memory limit exceeded: {used} bytes used, limit is {limit} bytes")]
    MemoryLimitExceeded { used: usize, limit: usize },

    /// Referenced column absent or input of the wrong shape.
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// Type mismatch errors.
    #[error("Type error: expected {expected}, got {actual}")]
    TypeError { expected: String, actual: String },

    /// Binary operation over two non-scalar vectors of unequal length.
    #[error("Length mismatch: left has {left} rows, right has {right} rows")]
    LengthMismatch { left: usize, right: usize },

    /// Invalid argument to an operator.
    #[error("Domain error: {0}")]
    DomainError(String),

    /// Opcode/type combination without an execution path.
    #[error("Not yet implemented: {0}")]
    NotYetImplemented(String),

    /// Cooperative cancellation was requested.
    #[error("Query cancelled")]
    Cancelled,

    /// Invalid executor configuration.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Arrow conversion errors.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Worker pool construction failed.
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

impl TesseraError {
    /// Creates an out-of-memory error for a failed allocation.
    #[must_use]
    pub fn oom(requested: usize, context: &'static str) -> Self {
        TesseraError::OutOfMemory { requested, context }
    }

    /// Creates a type error from an expected and actual description.
    pub fn type_error(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        TesseraError::TypeError {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Returns true if the caller may retry the same request.
    ///
    /// Only cancellation is retryable; every other error is terminal for the
    /// given graph and input.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, TesseraError::Cancelled)
    }

    /// Returns true for allocation failures, which several engines recover
    /// from locally by switching strategy.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            TesseraError::OutOfMemory { .. } | TesseraError::MemoryLimitExceeded { .. }
        )
    }
}
