//! Stable LSB radix sort over composite `u64` keys.
//!
//! Up to eight byte passes. Each pass builds one histogram per worker range,
//! turns them into per-worker bucket offsets (bucket-major, worker-minor),
//! and scatters every range into disjoint output slots. Passes over bytes
//! that are constant across all rows are skipped.

use crate::error::Result;
use crate::executor::context::ExecContext;
use crate::pool::{split_ranges, MORSEL_SIZE};

type Histogram = [usize; 256];

#[inline]
#[allow(clippy::cast_possible_truncation)]
fn digit(key: u64, shift: u32) -> usize {
    ((key >> shift) & 0xff) as usize
}

fn histogram(keys: &[u64], shift: u32) -> Histogram {
    let mut h = [0usize; 256];
    for &k in keys {
        h[digit(k, shift)] += 1;
    }
    h
}

/// Raw output pointers shared by the scatter workers.
struct ScatterTarget {
    keys: *mut u64,
    rows: *mut u32,
    len: usize,
}

// SAFETY: workers write through the pointers only at offsets derived from
// disjoint prefix-sum ranges, and the owning buffers outlive the scatter.
#[allow(unsafe_code)]
unsafe impl Send for ScatterTarget {}
#[allow(unsafe_code)]
unsafe impl Sync for ScatterTarget {}

impl ScatterTarget {
    /// # Safety
    ///
    /// `pos < self.len` and no other thread writes `pos` concurrently.
    #[allow(unsafe_code)]
    #[inline]
    unsafe fn write(&self, pos: usize, key: u64, row: u32) {
        debug_assert!(pos < self.len);
        // SAFETY: upheld by the caller.
        unsafe {
            self.keys.add(pos).write(key);
            self.rows.add(pos).write(row);
        }
    }
}

fn scatter_serial(
    src_keys: &[u64],
    src_rows: &[u32],
    dst_keys: &mut [u64],
    dst_rows: &mut [u32],
    hist: &Histogram,
    shift: u32,
) {
    let mut offsets = [0usize; 256];
    let mut running = 0;
    for (o, &count) in offsets.iter_mut().zip(hist) {
        *o = running;
        running += count;
    }
    for (&k, &r) in src_keys.iter().zip(src_rows) {
        let d = digit(k, shift);
        dst_keys[offsets[d]] = k;
        dst_rows[offsets[d]] = r;
        offsets[d] += 1;
    }
}

/// Sorts row indices `0..codes.len()` by `codes`, ties in row order.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn radix_sort(ctx: &ExecContext<'_>, codes: &[u64]) -> Result<Vec<u32>> {
    let n = codes.len();
    let mut keys = ctx.arena.alloc(n, 0u64, "radix sort keys")?;
    keys.copy_from_slice(codes);
    let mut rows = ctx.arena.alloc(n, 0u32, "radix sort rows")?;
    for (i, r) in rows.iter_mut().enumerate() {
        *r = i as u32;
    }
    let mut tmp_keys = ctx.arena.alloc(n, 0u64, "radix sort keys")?;
    let mut tmp_rows = ctx.arena.alloc(n, 0u32, "radix sort rows")?;

    let max = codes.iter().copied().max().unwrap_or(0);
    let bytes = (64 - max.leading_zeros()).div_ceil(8);
    let workers = ctx.workers_for(n);
    let ranges = split_ranges(n, workers, MORSEL_SIZE);

    for pass in 0..bytes {
        ctx.check_cancelled()?;
        let shift = pass * 8;
        let hists: Vec<Histogram> = if ranges.len() == 1 {
            vec![histogram(&keys, shift)]
        } else {
            ctx.pool
                .map_ranges(n, workers, |_, s, e| histogram(&keys[s..e], shift))
        };
        let mut totals = [0usize; 256];
        for h in &hists {
            for (t, c) in totals.iter_mut().zip(h) {
                *t += c;
            }
        }
        if totals.iter().any(|&t| t == n) {
            continue;
        }

        if hists.len() == 1 {
            scatter_serial(&keys, &rows, &mut tmp_keys, &mut tmp_rows, &hists[0], shift);
        } else {
            let mut offsets = vec![[0usize; 256]; hists.len()];
            let mut running = 0;
            for bucket in 0..256 {
                for (w, h) in hists.iter().enumerate() {
                    offsets[w][bucket] = running;
                    running += h[bucket];
                }
            }
            let target = ScatterTarget {
                keys: tmp_keys.as_mut_ptr(),
                rows: tmp_rows.as_mut_ptr(),
                len: n,
            };
            let (src_keys, src_rows) = (&keys[..], &rows[..]);
            ctx.pool.map_ranges(n, workers, |w, s, e| {
                let mut offs = offsets[w];
                for i in s..e {
                    let k = src_keys[i];
                    let d = digit(k, shift);
                    #[allow(unsafe_code)]
                    // SAFETY: offsets[w][d] walks worker w's private slice of
                    // bucket d, whose extent was counted by hists[w]; the
                    // slices of all (bucket, worker) pairs partition 0..n.
                    unsafe {
                        target.write(offs[d], k, src_rows[i]);
                    }
                    offs[d] += 1;
                }
            });
        }
        std::mem::swap(&mut keys, &mut tmp_keys);
        std::mem::swap(&mut rows, &mut tmp_rows);
    }
    Ok(rows.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ExecutorConfig};

    fn check(workers: usize, codes: &[u64]) {
        let exec = Executor::new(
            ExecutorConfig::new()
                .with_num_workers(workers)
                .with_parallel_threshold(1024),
        )
        .unwrap();
        let rows = radix_sort(&exec.context(), codes).unwrap();
        let mut expected: Vec<u32> = (0..codes.len() as u32).collect();
        expected.sort_by_key(|&r| (codes[r as usize], r));
        assert_eq!(rows, expected);
    }

    #[test]
    fn test_small_input() {
        check(1, &[5, 3, 9, 3, 0, u64::MAX, 1 << 40]);
    }

    #[test]
    fn test_empty_and_constant() {
        check(1, &[]);
        check(1, &[7; 100]);
    }

    #[test]
    fn test_parallel_matches_reference() {
        let codes: Vec<u64> = (0..50_000u64)
            .map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 20)
            .collect();
        check(4, &codes);
    }

    #[test]
    fn test_parallel_is_stable() {
        let codes: Vec<u64> = (0..30_000u64).map(|i| i % 7).collect();
        check(3, &codes);
    }
}
