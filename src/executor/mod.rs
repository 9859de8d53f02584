//! Executor module for operator-graph execution.
//!
//! This module owns the runtime pieces shared by every engine: the worker
//! pool, the scratch memory arena and the cancellation flag. The engines
//! themselves (expression evaluation, sort, GROUP BY, join) live in the
//! submodules and are reached through [`Executor::execute`].

pub(crate) mod context;
mod dispatch;
pub(crate) mod elementwise;
pub(crate) mod gather;
pub mod group;
mod hash;
pub mod join;
pub mod sort;
pub mod vectorized;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TesseraError};
use crate::graph::{Graph, NodeId};
use crate::pool::{WorkerPool, PARALLEL_THRESHOLD};
use crate::storage::{ColumnRef, MemoryArena, Table};
use crate::types::Value;

use self::context::ExecContext;
use self::gather::materialize_selection;

/// Forces a GROUP BY strategy instead of the automatic choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GroupStrategy {
    /// Pick the cheapest eligible path.
    #[default]
    Auto,
    /// Dense-array accumulation when eligible.
    Direct,
    /// Radix-partitioned parallel hash aggregation.
    Hashed,
    /// Single-threaded hash aggregation.
    Sequential,
}

/// Forces a sort algorithm instead of the automatic choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortStrategy {
    /// Pick by row count, limit and key encodability.
    #[default]
    Auto,
    Insertion,
    Radix,
    Merge,
    /// Bounded heaps per worker; requires a limit.
    TopN,
}

/// Configuration for the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker threads (None = available parallelism).
    pub num_workers: Option<usize>,
    /// Scratch memory limit in bytes (0 = unlimited).
    pub memory_limit: usize,
    /// Row count at which engines start using more than one worker.
    pub parallel_threshold: usize,
    /// Largest composite slot count the direct GROUP BY path accepts.
    pub direct_array_max_slots: usize,
    /// Accumulator bytes one worker may use on the direct path.
    pub direct_array_worker_bytes: usize,
    /// Accumulator bytes all workers together may use on the direct path.
    pub direct_array_total_bytes: usize,
    /// Relative cost of a MIN/MAX accumulator against a SUM accumulator when
    /// sizing the direct path.
    pub minmax_cost_weight: usize,
    /// Largest LIMIT served by per-worker top-N heaps.
    pub topn_heap_cap: usize,
    /// Segments merged per incremental batch on parted tables.
    pub segment_batch: usize,
    pub group_strategy: GroupStrategy,
    pub sort_strategy: SortStrategy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_workers: None,
            memory_limit: 0,
            parallel_threshold: PARALLEL_THRESHOLD,
            direct_array_max_slots: 262_144,
            direct_array_worker_bytes: 6 << 20,
            direct_array_total_bytes: 256 << 20,
            minmax_cost_weight: 2,
            topn_heap_cap: 8192,
            segment_batch: 8,
            group_strategy: GroupStrategy::Auto,
            sort_strategy: SortStrategy::Auto,
        }
    }
}

impl ExecutorConfig {
    /// Creates a new executor configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    /// Sets the memory limit in bytes.
    #[must_use]
    pub fn with_memory_limit(mut self, memory_limit: usize) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    /// Sets the row count at which engines go parallel.
    #[must_use]
    pub fn with_parallel_threshold(mut self, rows: usize) -> Self {
        self.parallel_threshold = rows;
        self
    }

    /// Sets the direct-array slot ceiling.
    #[must_use]
    pub fn with_direct_array_max_slots(mut self, slots: usize) -> Self {
        self.direct_array_max_slots = slots;
        self
    }

    /// Sets the direct-array per-worker and total byte budgets.
    #[must_use]
    pub fn with_direct_array_budget(mut self, worker_bytes: usize, total_bytes: usize) -> Self {
        self.direct_array_worker_bytes = worker_bytes;
        self.direct_array_total_bytes = total_bytes;
        self
    }

    /// Sets the MIN/MAX cost weight used when sizing the direct path.
    #[must_use]
    pub fn with_minmax_cost_weight(mut self, weight: usize) -> Self {
        self.minmax_cost_weight = weight;
        self
    }

    /// Sets the largest LIMIT served by top-N heaps.
    #[must_use]
    pub fn with_topn_heap_cap(mut self, cap: usize) -> Self {
        self.topn_heap_cap = cap;
        self
    }

    /// Sets the number of segments merged per batch.
    #[must_use]
    pub fn with_segment_batch(mut self, segments: usize) -> Self {
        self.segment_batch = segments;
        self
    }

    /// Pins the GROUP BY strategy.
    #[must_use]
    pub fn with_group_strategy(mut self, strategy: GroupStrategy) -> Self {
        self.group_strategy = strategy;
        self
    }

    /// Pins the sort algorithm.
    #[must_use]
    pub fn with_sort_strategy(mut self, strategy: SortStrategy) -> Self {
        self.sort_strategy = strategy;
        self
    }

    /// Checks the configuration for values no engine can run with.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TesseraError::ValidationError(msg.to_string()));
        if self.num_workers == Some(0) {
            return invalid("num_workers must be at least 1");
        }
        if self.parallel_threshold == 0 {
            return invalid("parallel_threshold must be at least 1");
        }
        if self.direct_array_max_slots == 0 {
            return invalid("direct_array_max_slots must be at least 1");
        }
        if self.direct_array_worker_bytes > self.direct_array_total_bytes {
            return invalid("direct_array_worker_bytes exceeds direct_array_total_bytes");
        }
        if self.minmax_cost_weight == 0 {
            return invalid("minmax_cost_weight must be at least 1");
        }
        if self.topn_heap_cap == 0 {
            return invalid("topn_heap_cap must be at least 1");
        }
        if self.segment_batch == 0 {
            return invalid("segment_batch must be at least 1");
        }
        Ok(())
    }
}

/// Cooperative cancellation flag shared between a caller and an executor.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an untripped token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the running and every later execution.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Clears a previous cancellation request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Result of evaluating a graph node.
#[derive(Debug, Clone)]
pub enum Datum {
    Table(Table),
    Vector(ColumnRef),
    Atom(Value),
}

impl Datum {
    /// Returns a short name of the variant for error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Datum::Table(_) => "table",
            Datum::Vector(_) => "vector",
            Datum::Atom(_) => "atom",
        }
    }

    /// Returns the table, if this is one.
    #[must_use]
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Datum::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Returns the vector, if this is one.
    #[must_use]
    pub fn as_vector(&self) -> Option<&ColumnRef> {
        match self {
            Datum::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the atom, if this is one.
    #[must_use]
    pub fn as_atom(&self) -> Option<&Value> {
        match self {
            Datum::Atom(v) => Some(v),
            _ => None,
        }
    }

    /// Unwraps a table result.
    ///
    /// # Errors
    ///
    /// Returns a schema error for vectors and atoms.
    pub fn into_table(self) -> Result<Table> {
        match self {
            Datum::Table(t) => Ok(t),
            other => Err(TesseraError::SchemaError(format!(
                "expected a table, got a {}",
                other.kind()
            ))),
        }
    }

    /// Unwraps a vector result.
    ///
    /// # Errors
    ///
    /// Returns a schema error for tables and atoms.
    pub fn into_vector(self) -> Result<ColumnRef> {
        match self {
            Datum::Vector(v) => Ok(v),
            other => Err(TesseraError::SchemaError(format!(
                "expected a vector, got a {}",
                other.kind()
            ))),
        }
    }
}

/// Executes operator graphs on a worker pool.
pub struct Executor {
    config: ExecutorConfig,
    pool: WorkerPool,
    arena: Arc<MemoryArena>,
    cancel: CancelToken,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for an invalid configuration and
    /// `ThreadPool` if the worker threads cannot be started.
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.num_workers)?;
        let arena = MemoryArena::for_pool(config.memory_limit, pool.region_flag());
        debug!(
            workers = pool.total_workers(),
            memory_limit = config.memory_limit,
            "executor started"
        );
        Ok(Self {
            config,
            pool,
            arena,
            cancel: CancelToken::new(),
        })
    }

    /// Creates an executor with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `ThreadPool` if the worker threads cannot be started.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ExecutorConfig::default())
    }

    /// Returns the executor configuration.
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Returns the worker pool.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Returns the scratch memory arena.
    #[must_use]
    pub fn arena(&self) -> &Arc<MemoryArena> {
        &self.arena
    }

    /// Returns a handle that cancels this executor's work.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub(crate) fn context(&self) -> ExecContext<'_> {
        ExecContext {
            config: &self.config,
            pool: &self.pool,
            arena: &self.arena,
            cancel: &self.cancel,
        }
    }

    /// Evaluates `root` and returns a table, vector or atom.
    ///
    /// A table result has any pending row selection compacted away.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by any node; `Cancelled` if the
    /// cancel token trips.
    pub fn execute(&self, graph: &Graph, root: NodeId) -> Result<Datum> {
        let ctx = self.context();
        ctx.check_cancelled()?;
        match dispatch::exec_node(&ctx, graph, root, None)? {
            Datum::Table(t) => Ok(Datum::Table(materialize_selection(&ctx, &t)?)),
            other => Ok(other),
        }
    }

    /// Evaluates one node without compacting its result.
    ///
    /// Free-standing scans resolve against the graph's bound table.
    ///
    /// # Errors
    ///
    /// Same as [`Executor::execute`].
    pub fn exec_node(&self, graph: &Graph, node: NodeId) -> Result<Datum> {
        dispatch::exec_node(&self.context(), graph, node, None)
    }

    /// Compacts a table's pending row selection into dense columns.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or an allocation error.
    pub fn materialize(&self, table: &Table) -> Result<Table> {
        materialize_selection(&self.context(), table)
    }
}
