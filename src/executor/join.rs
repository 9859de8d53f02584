//! Parallel hash equi-join.
//!
//! The right relation is built into a chained table: one atomic head per
//! bucket and one `next` link per row, with rows prepended to their chain
//! by compare-and-swap. The left relation is matched in two passes over fixed
//! morsels: the first counts output rows per morsel, a prefix sum turns the
//! counts into disjoint output ranges, and the second writes the
//! `(left, right)` index pairs into those ranges.
//!
//! Chain order depends on scheduling, so the matches of each left row are
//! sorted by right row before they are written.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Result, TesseraError};
use crate::graph::JoinType;
use crate::pool::MORSEL_SIZE;
use crate::storage::{ColumnRef, Table, TableColumn, NO_ROW};

use super::context::ExecContext;
use super::gather::gather_columns;
use super::hash::{hasher, key_words, row_hash, KeyDomain};

/// Maximum number of join key pairs.
pub const MAX_JOIN_KEYS: usize = 8;

/// Suffix given to a right column whose name is already taken.
const RIGHT_SUFFIX: &str = "_right";

/// Key words of one side and which rows hold a null key.
struct KeySide {
    words: Vec<Vec<u64>>,
    nulls: Vec<bool>,
}

impl KeySide {
    fn new(keys: &[ColumnRef], domains: &[KeyDomain], nrows: usize) -> Self {
        let words = keys
            .iter()
            .zip(domains)
            .map(|(k, &d)| key_words(k, d))
            .collect();
        let nulls = (0..nrows)
            .map(|row| keys.iter().any(|k| k.is_null(row)))
            .collect();
        Self { words, nulls }
    }

    /// A side none of whose rows can match.
    fn unmatched(nrows: usize) -> Self {
        Self {
            words: Vec::new(),
            nulls: vec![true; nrows],
        }
    }

    #[inline]
    fn eq(&self, row: usize, other: &KeySide, other_row: usize) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .all(|(a, b)| a[row] == b[other_row])
    }
}

/// Chained hash table over the right relation.
struct BuildTable {
    heads: Vec<AtomicU32>,
    next: Vec<AtomicU32>,
    hashes: Vec<u64>,
    mask: usize,
}

impl BuildTable {
    fn build(ctx: &ExecContext<'_>, keys: &KeySide, state: &RandomState, nrows: usize) -> Self {
        let buckets = (nrows * 10 / 3).next_power_of_two().max(16);
        let workers = ctx.workers_for(nrows);
        let hashes: Vec<u64> = ctx
            .pool
            .map_ranges(nrows, workers, |_, start, end| {
                (start..end)
                    .map(|row| row_hash(state, &keys.words, row))
                    .collect::<Vec<_>>()
            })
            .concat();
        let table = Self {
            heads: (0..buckets).map(|_| AtomicU32::new(NO_ROW)).collect(),
            next: (0..nrows).map(|_| AtomicU32::new(NO_ROW)).collect(),
            hashes,
            mask: buckets - 1,
        };
        let insert_range = |start: usize, end: usize| {
            for row in (start..end).filter(|&row| !keys.nulls[row]) {
                table.insert(row);
            }
        };
        if workers > 1 {
            ctx.pool.dispatch(nrows, |_, start, end| insert_range(start, end));
        } else {
            insert_range(0, nrows);
        }
        table
    }

    /// Prepends `row` onto its bucket's chain. Only the head is shared; the
    /// row's own link is written by this thread alone.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn insert(&self, row: usize) {
        let bucket = &self.heads[self.bucket(self.hashes[row])];
        let mut head = bucket.load(Ordering::Relaxed);
        loop {
            self.next[row].store(head, Ordering::Relaxed);
            match bucket.compare_exchange_weak(head, row as u32, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn bucket(&self, hash: u64) -> usize {
        (hash as usize) & self.mask
    }

    /// Appends every right row matching left `row` to `out`, ascending.
    fn matches(
        &self,
        left: &KeySide,
        row: usize,
        hash: u64,
        right: &KeySide,
        out: &mut Vec<u32>,
    ) {
        out.clear();
        if left.nulls[row] {
            return;
        }
        let mut r = self.heads[self.bucket(hash)].load(Ordering::Acquire);
        while r != NO_ROW {
            let ri = r as usize;
            if self.hashes[ri] == hash && left.eq(row, right, ri) {
                out.push(r);
            }
            r = self.next[ri].load(Ordering::Relaxed);
        }
        out.sort_unstable();
    }
}

fn validate(left: &Table, left_keys: &[ColumnRef], right: &Table, right_keys: &[ColumnRef]) -> Result<()> {
    if left_keys.len() != right_keys.len() || left_keys.is_empty() || left_keys.len() > MAX_JOIN_KEYS {
        return Err(TesseraError::DomainError(format!(
            "join takes 1 to {MAX_JOIN_KEYS} key pairs, got {} left and {} right keys",
            left_keys.len(),
            right_keys.len()
        )));
    }
    for (table, keys) in [(left, left_keys), (right, right_keys)] {
        if table.nrows() >= NO_ROW as usize {
            return Err(TesseraError::DomainError(format!(
                "join input of {} rows exceeds the row index range",
                table.nrows()
            )));
        }
        for key in keys {
            if key.len() != table.nrows() {
                return Err(TesseraError::LengthMismatch {
                    left: table.nrows(),
                    right: key.len(),
                });
            }
        }
    }
    Ok(())
}

/// Index pairs of the join result.
struct Pairs {
    left: Vec<u32>,
    right: Vec<u32>,
}

#[allow(clippy::cast_possible_truncation)]
fn match_left(
    ctx: &ExecContext<'_>,
    build: &BuildTable,
    left: &KeySide,
    right: &KeySide,
    state: &RandomState,
    nleft: usize,
    join_type: JoinType,
) -> Result<Pairs> {
    let outer = join_type != JoinType::Inner;
    let morsels = nleft.div_ceil(MORSEL_SIZE);
    let range = |m: usize| m * MORSEL_SIZE..((m + 1) * MORSEL_SIZE).min(nleft);
    let hash_of = |row: usize| row_hash(state, &left.words, row);

    let counted: Vec<AtomicUsize> = (0..morsels).map(|_| AtomicUsize::new(0)).collect();
    ctx.pool.dispatch_n(morsels, |_, m| {
        let mut scratch = Vec::new();
        let count: usize = range(m)
            .map(|row| {
                build.matches(left, row, hash_of(row), right, &mut scratch);
                if outer {
                    scratch.len().max(1)
                } else {
                    scratch.len()
                }
            })
            .sum();
        counted[m].store(count, Ordering::Relaxed);
    });
    let counts: Vec<usize> = counted.into_iter().map(AtomicUsize::into_inner).collect();
    let total: usize = counts.iter().sum();
    ctx.check_cancelled()?;

    let mut lefts = ctx.arena.alloc(total, 0u32, "join output")?;
    let mut rights = ctx.arena.alloc(total, 0u32, "join output")?;
    let mut slices = Vec::with_capacity(morsels);
    let (mut lrest, mut rrest) = (&mut lefts[..], &mut rights[..]);
    for &count in &counts {
        let (l, lr) = std::mem::take(&mut lrest).split_at_mut(count);
        let (r, rr) = std::mem::take(&mut rrest).split_at_mut(count);
        slices.push((l, r));
        lrest = lr;
        rrest = rr;
    }

    let matched: Vec<AtomicBool> = if join_type == JoinType::FullOuter {
        (0..right.nulls.len()).map(|_| AtomicBool::new(false)).collect()
    } else {
        Vec::new()
    };
    ctx.pool.install(|| {
        slices.into_par_iter().enumerate().for_each(|(m, (lout, rout))| {
            let mut scratch = Vec::new();
            let mut at = 0;
            for row in range(m) {
                build.matches(left, row, hash_of(row), right, &mut scratch);
                if scratch.is_empty() && outer {
                    lout[at] = row as u32;
                    rout[at] = NO_ROW;
                    at += 1;
                }
                for &r in &scratch {
                    lout[at] = row as u32;
                    rout[at] = r;
                    at += 1;
                    if let Some(flag) = matched.get(r as usize) {
                        flag.store(true, Ordering::Relaxed);
                    }
                }
            }
        });
    });

    let mut left_rows = lefts.into_vec();
    let mut right_rows = rights.into_vec();
    if join_type == JoinType::FullOuter {
        for (r, flag) in matched.iter().enumerate() {
            if !flag.load(Ordering::Relaxed) {
                left_rows.push(NO_ROW);
                right_rows.push(r as u32);
            }
        }
    }
    Ok(Pairs {
        left: left_rows,
        right: right_rows,
    })
}

/// Equi-joins `left` and `right` on pairwise-equal key columns.
///
/// Output holds every left column then every right column; a right column
/// whose name is taken is renamed `<name>_right`. Rows come in left row
/// order, the matches of one left row in right row order, and for full
/// outer joins the unmatched right rows follow in right row order. Null
/// keys never match, nor do symbol keys against non-symbol keys.
pub(crate) fn hash_join(
    ctx: &ExecContext<'_>,
    left: &Table,
    left_keys: &[ColumnRef],
    right: &Table,
    right_keys: &[ColumnRef],
    join_type: JoinType,
) -> Result<Table> {
    ctx.check_cancelled()?;
    validate(left, left_keys, right, right_keys)?;
    let (nleft, nright) = (left.nrows(), right.nrows());

    let domains: Option<Vec<KeyDomain>> = left_keys
        .iter()
        .zip(right_keys)
        .map(|(l, r)| KeyDomain::common(l.data_type(), r.data_type()))
        .collect();
    let (lside, rside) = match domains {
        Some(domains) => (
            KeySide::new(left_keys, &domains, nleft),
            KeySide::new(right_keys, &domains, nright),
        ),
        None => {
            debug!("join keys of incompatible domains, nothing matches");
            (KeySide::unmatched(nleft), KeySide::unmatched(nright))
        }
    };
    let state = hasher();
    let build = BuildTable::build(ctx, &rside, &state, nright);
    ctx.check_cancelled()?;
    let pairs = match_left(ctx, &build, &lside, &rside, &state, nleft, join_type)?;
    debug!(
        left = nleft,
        right = nright,
        rows = pairs.left.len(),
        ?join_type,
        "hash join"
    );

    let flatten = |t: &Table| -> Result<Vec<ColumnRef>> {
        t.columns().iter().map(TableColumn::flatten).collect()
    };
    let left_cols = gather_columns(
        ctx,
        &flatten(left)?,
        &pairs.left,
        join_type == JoinType::FullOuter,
    )?;
    let right_cols = gather_columns(ctx, &flatten(right)?, &pairs.right, join_type != JoinType::Inner)?;

    let mut out = Table::new();
    for (name, column) in left.names().iter().zip(left_cols) {
        out.add_column(name, TableColumn::Flat(Arc::new(column)))?;
    }
    for (name, column) in right.names().iter().zip(right_cols) {
        let mut name = name.to_string();
        while out.column_index(&name).is_some() {
            name.push_str(RIGHT_SUFFIX);
        }
        out.add_column(&name, TableColumn::Flat(Arc::new(column)))?;
    }
    Ok(out)
}
