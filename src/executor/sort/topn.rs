//! Bounded-heap selection of the first `limit` rows.

use std::collections::BinaryHeap;

use crate::executor::context::ExecContext;

fn offer(heap: &mut BinaryHeap<(u64, u32)>, limit: usize, item: (u64, u32)) {
    if heap.len() < limit {
        heap.push(item);
    } else if heap.peek().is_some_and(|top| item < *top) {
        heap.pop();
        heap.push(item);
    }
}

/// Returns the row indices of the `limit` smallest `(code, row)` pairs in
/// ascending order, where `encode(row)` yields each row's code as the heaps
/// consume it. Every worker keeps its own max-heap; the survivors are
/// merged into one heap and heap-sorted.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn top_n<F>(ctx: &ExecContext<'_>, nrows: usize, limit: usize, encode: F) -> Vec<u32>
where
    F: Fn(usize) -> u64 + Sync + Send,
{
    if limit == 0 {
        return Vec::new();
    }
    let workers = ctx.workers_for(nrows);
    let heaps = ctx.pool.map_ranges(nrows, workers, |_, start, end| {
        let mut heap = BinaryHeap::with_capacity(limit.min(end - start) + 1);
        for row in start..end {
            offer(&mut heap, limit, (encode(row), row as u32));
        }
        heap
    });
    let mut merged = BinaryHeap::with_capacity(limit + 1);
    for heap in heaps {
        for item in heap {
            offer(&mut merged, limit, item);
        }
    }
    merged.into_sorted_vec().into_iter().map(|(_, row)| row).collect()
}
