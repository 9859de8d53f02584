//! Borrowed runtime handed to every engine.

use std::sync::Arc;

use crate::error::{Result, TesseraError};
use crate::pool::WorkerPool;
use crate::storage::MemoryArena;

use super::{CancelToken, ExecutorConfig};

#[derive(Clone, Copy)]
pub(crate) struct ExecContext<'a> {
    pub(crate) config: &'a ExecutorConfig,
    pub(crate) pool: &'a WorkerPool,
    pub(crate) arena: &'a Arc<MemoryArena>,
    pub(crate) cancel: &'a CancelToken,
}

impl ExecContext<'_> {
    /// Number of workers to split `rows` rows over.
    pub(crate) fn workers_for(&self, rows: usize) -> usize {
        if rows < self.config.parallel_threshold {
            1
        } else {
            self.pool.total_workers()
        }
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(TesseraError::Cancelled)
        } else {
            Ok(())
        }
    }
}
