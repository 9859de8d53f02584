//! Comparator sorts for keys that do not pack into one word.

use std::cmp::Ordering;

use rayon::prelude::*;

use crate::executor::context::ExecContext;

/// Runs shorter than this are sorted by insertion.
pub(crate) const INSERTION_THRESHOLD: usize = 64;

/// Stable insertion sort.
pub(crate) fn insertion_sort<F>(v: &mut [u32], cmp: &F)
where
    F: Fn(u32, u32) -> Ordering,
{
    for i in 1..v.len() {
        let item = v[i];
        let mut j = i;
        while j > 0 && cmp(v[j - 1], item) == Ordering::Greater {
            v[j] = v[j - 1];
            j -= 1;
        }
        v[j] = item;
    }
}

/// Merges two sorted runs into `out`, taking from `left` on ties.
fn merge_runs<F>(left: &[u32], right: &[u32], out: &mut [u32], cmp: &F)
where
    F: Fn(u32, u32) -> Ordering,
{
    let (mut i, mut j) = (0, 0);
    for slot in out.iter_mut() {
        let take_left = j == right.len()
            || (i < left.len() && cmp(right[j], left[i]) != Ordering::Less);
        if take_left {
            *slot = left[i];
            i += 1;
        } else {
            *slot = right[j];
            j += 1;
        }
    }
}

fn merge_pass<F>(src: &[u32], dst: &mut [u32], width: usize, cmp: &F)
where
    F: Fn(u32, u32) -> Ordering,
{
    let mid = width.min(src.len());
    merge_runs(&src[..mid], &src[mid..], dst, cmp);
}

/// Bottom-up merge sort of `0..n`. Runs are seeded by insertion sort; each
/// pass doubles the run length and merges independent run pairs in
/// parallel.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn merge_sort<F>(ctx: &ExecContext<'_>, n: usize, cmp: &F) -> Vec<u32>
where
    F: Fn(u32, u32) -> Ordering + Sync,
{
    let mut src: Vec<u32> = (0..n as u32).collect();
    let mut dst = vec![0u32; n];
    let parallel = ctx.workers_for(n) > 1;

    if parallel {
        ctx.pool.install(|| {
            src.par_chunks_mut(INSERTION_THRESHOLD)
                .for_each(|run| insertion_sort(run, cmp));
        });
    } else {
        for run in src.chunks_mut(INSERTION_THRESHOLD) {
            insertion_sort(run, cmp);
        }
    }

    let mut width = INSERTION_THRESHOLD;
    while width < n {
        let pair = width * 2;
        if parallel {
            ctx.pool.install(|| {
                dst.par_chunks_mut(pair)
                    .zip(src.par_chunks(pair))
                    .for_each(|(out, input)| merge_pass(input, out, width, cmp));
            });
        } else {
            for (out, input) in dst.chunks_mut(pair).zip(src.chunks(pair)) {
                merge_pass(input, out, width, cmp);
            }
        }
        std::mem::swap(&mut src, &mut dst);
        width = pair;
    }
    src
}
