//! Fork-join worker pool for morsel-driven execution.
//!
//! Wraps a `rayon` thread pool behind the dispatch primitives the engines
//! use. Every call blocks until all of its tasks complete; that barrier is
//! the only synchronization point between workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{Result, TesseraError};

/// Rows per morsel: the unit of vectorized evaluation and scheduling.
pub const MORSEL_SIZE: usize = 1024;

/// Row count below which engines stay single-threaded.
pub const PARALLEL_THRESHOLD: usize = 64 * MORSEL_SIZE;

/// Morsels per chunk handed out by [`WorkerPool::dispatch`].
pub const DISPATCH_MORSELS: usize = 8;

/// Splits `0..total` into at most `parts` contiguous ranges whose boundaries
/// are multiples of `align`. Always returns at least one (possibly empty)
/// range.
#[must_use]
pub fn split_ranges(total: usize, parts: usize, align: usize) -> Vec<(usize, usize)> {
    let parts = parts.max(1);
    let align = align.max(1);
    let units = total.div_ceil(align);
    let per_part = units.div_ceil(parts).max(1) * align;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    while start < total {
        let end = (start + per_part).min(total);
        ranges.push((start, end));
        start = end;
    }
    if ranges.is_empty() {
        ranges.push((0, 0));
    }
    ranges
}

/// Shared view of a pool's "parallel region running" state.
#[derive(Debug, Clone, Default)]
pub struct RegionFlag(Arc<AtomicUsize>);

impl RegionFlag {
    /// Returns true while any region of the owning pool is running.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire) > 0
    }

    fn enter(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    fn leave(&self) {
        self.0.fetch_sub(1, Ordering::Release);
    }
}

/// Fixed-size worker pool.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
    active_regions: RegionFlag,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("in_parallel", &self.in_parallel())
            .finish_non_exhaustive()
    }
}

/// Marks a parallel region for as long as it lives.
struct RegionGuard<'a>(&'a RegionFlag);

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}

impl WorkerPool {
    /// Creates a pool with `num_workers` threads (None = available parallelism).
    pub fn new(num_workers: Option<usize>) -> Result<Self> {
        let workers = num_workers
            .or_else(|| std::thread::available_parallelism().ok().map(usize::from))
            .unwrap_or(1)
            .max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("tessera-worker-{i}"))
            .build()
            .map_err(|e| TesseraError::ThreadPool(e.to_string()))?;
        Ok(Self {
            pool,
            workers,
            active_regions: RegionFlag::default(),
        })
    }

    /// Returns the number of worker threads.
    #[must_use]
    pub fn total_workers(&self) -> usize {
        self.workers
    }

    /// Returns true while any dispatch of this pool is running.
    ///
    /// Allocator paths that reclaim memory across threads must stay disabled
    /// while this is set.
    #[must_use]
    pub fn in_parallel(&self) -> bool {
        self.active_regions.is_raised()
    }

    /// Returns a handle that observes this pool's parallel regions.
    #[must_use]
    pub fn region_flag(&self) -> RegionFlag {
        self.active_regions.clone()
    }

    fn region(&self) -> RegionGuard<'_> {
        self.active_regions.enter();
        RegionGuard(&self.active_regions)
    }

    /// Runs `f` inside the pool as one parallel region.
    pub fn install<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        let _region = self.region();
        self.pool.install(f)
    }

    fn worker_id() -> usize {
        rayon::current_thread_index().unwrap_or(0)
    }

    /// Splits `0..total` into morsel-aligned chunks and calls
    /// `f(worker, start, end)` once per chunk.
    pub fn dispatch<F>(&self, total: usize, f: F)
    where
        F: Fn(usize, usize, usize) + Sync + Send,
    {
        let chunk = MORSEL_SIZE * DISPATCH_MORSELS;
        let n_chunks = total.div_ceil(chunk);
        self.install(|| {
            (0..n_chunks).into_par_iter().for_each(|c| {
                let start = c * chunk;
                f(Self::worker_id(), start, (start + chunk).min(total));
            });
        });
    }

    /// Calls `f(worker, task)` once per task index in `0..n`.
    pub fn dispatch_n<F>(&self, n: usize, f: F)
    where
        F: Fn(usize, usize) + Sync + Send,
    {
        self.install(|| {
            (0..n)
                .into_par_iter()
                .for_each(|task| f(Self::worker_id(), task));
        });
    }

    /// Splits `0..total` into `parts` contiguous morsel-aligned ranges and
    /// calls `f(part, start, end)` for each, returning the results in part
    /// order. A single part runs on the calling thread.
    pub fn map_ranges<R, F>(&self, total: usize, parts: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize, usize, usize) -> R + Sync + Send,
    {
        let ranges = split_ranges(total, parts, MORSEL_SIZE);
        if ranges.len() == 1 {
            let (start, end) = ranges[0];
            return vec![f(0, start, end)];
        }
        self.install(|| {
            ranges
                .into_par_iter()
                .enumerate()
                .map(|(part, (start, end))| f(part, start, end))
                .collect()
        })
    }

    /// Calls `f(task)` for every task in `0..n`, returning results in task
    /// order.
    pub fn map_tasks<R, F>(&self, n: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize) -> R + Sync + Send,
    {
        self.install(|| (0..n).into_par_iter().map(&f).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_split_ranges_aligned() {
        let ranges = split_ranges(10_000, 4, MORSEL_SIZE);
        assert_eq!(ranges.first().map(|r| r.0), Some(0));
        assert_eq!(ranges.last().map(|r| r.1), Some(10_000));
        for w in ranges.windows(2) {
            assert_eq!(w[0].1, w[1].0);
            assert_eq!(w[0].1 % MORSEL_SIZE, 0);
        }
        assert!(ranges.len() <= 4);
    }

    #[test]
    fn test_split_ranges_empty() {
        assert_eq!(split_ranges(0, 8, MORSEL_SIZE), vec![(0, 0)]);
    }

    #[test]
    fn test_dispatch_covers_every_row() {
        let pool = WorkerPool::new(Some(4)).unwrap();
        let sum = AtomicU64::new(0);
        let total = 100_003;
        pool.dispatch(total, |worker, start, end| {
            assert!(worker < 4);
            let s: u64 = (start as u64..end as u64).sum();
            sum.fetch_add(s, Ordering::Relaxed);
        });
        let expected: u64 = (0..total as u64).sum();
        assert_eq!(sum.load(Ordering::Relaxed), expected);
        assert!(!pool.in_parallel());
    }

    #[test]
    fn test_dispatch_n_runs_every_task() {
        let pool = WorkerPool::new(Some(3)).unwrap();
        let hits: Vec<AtomicU64> = (0..10).map(|_| AtomicU64::new(0)).collect();
        pool.dispatch_n(10, |worker, task| {
            assert!(worker < 3);
            hits[task].fetch_add(1, Ordering::Relaxed);
        });
        assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_map_ranges_preserves_order() {
        let pool = WorkerPool::new(Some(3)).unwrap();
        let parts = pool.map_ranges(50_000, 3, |part, start, end| (part, start, end));
        for (i, (part, _, _)) in parts.iter().enumerate() {
            assert_eq!(*part, i);
        }
        assert_eq!(parts.last().map(|p| p.2), Some(50_000));
    }

    #[test]
    fn test_in_parallel_flag() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        let seen = pool.map_tasks(4, |_| pool.in_parallel());
        assert!(seen.iter().all(|&s| s));
        assert!(!pool.in_parallel());
    }
}
