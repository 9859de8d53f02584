//! Hash GROUP BY.
//!
//! The parallel build runs in three phases:
//! 1. every worker packs one fixed-stride entry per selected row (hash, key
//!    words, aggregate input words) into its private buffer for one of 256
//!    partitions chosen by the low hash bits;
//! 2. every partition builds its own open-addressed table over its entries
//!    only, accumulating in place;
//! 3. every partition finishes its groups and the results are concatenated
//!    in partition order.
//!
//! If any buffer or table cannot grow, or a partition exhausts the 24-bit
//! group space, the build is abandoned and the whole input is aggregated
//! again by one thread with 64-bit slots.

use std::sync::Arc;

use ahash::RandomState;
use tracing::warn;

use crate::error::{Result, TesseraError};
use crate::executor::context::ExecContext;
use crate::executor::hash::{
    column_from_words, combine, hasher, key_words, row_hash, KeyDomain,
};
use crate::storage::{Column, MemoryArena, ScratchVec};
use crate::types::DataType;

use super::accum::AccSet;
use super::{try_for_each_row, GroupKey, Grouped, Input, MAX_AGGREGATES, MAX_GROUP_KEYS};

const PARTITIONS: usize = 256;

/// Longest entry: hash, key null bits, keys, aggregate inputs, aggregate
/// null bits.
const MAX_ENTRY: usize = 3 + MAX_GROUP_KEYS + MAX_AGGREGATES;

/// A hash-table slot packing a salt with a group id.
pub(super) trait Slot: Copy + Eq + Send + Sync {
    const EMPTY: Self;
    const MAX_GROUPS: usize;
    fn pack(hash: u64, gid: usize) -> Self;
    fn gid(self) -> usize;
    fn salt_matches(self, hash: u64) -> bool;
}

/// 8-bit salt, 24-bit group id.
impl Slot for u32 {
    const EMPTY: Self = u32::MAX;
    const MAX_GROUPS: usize = (1 << 24) - 1;

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn pack(hash: u64, gid: usize) -> Self {
        (((hash >> 56) as u32) << 24) | gid as u32
    }

    #[inline]
    fn gid(self) -> usize {
        (self & 0x00ff_ffff) as usize
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn salt_matches(self, hash: u64) -> bool {
        self >> 24 == (hash >> 56) as u32
    }
}

/// 16-bit salt, 48-bit group id.
impl Slot for u64 {
    const EMPTY: Self = u64::MAX;
    const MAX_GROUPS: usize = (1 << 48) - 1;

    #[inline]
    fn pack(hash: u64, gid: usize) -> Self {
        (hash & !((1 << 48) - 1)) | gid as u64
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn gid(self) -> usize {
        (self & ((1 << 48) - 1)) as usize
    }

    #[inline]
    fn salt_matches(self, hash: u64) -> bool {
        self >> 48 == hash >> 48
    }
}

/// Open-addressed table from key tuples to dense group ids. Each group's
/// key row is `[null bits, key words...]`.
#[derive(Debug)]
pub(super) struct GroupTable<S> {
    slots: ScratchVec<S>,
    hashes: ScratchVec<u64>,
    keys: ScratchVec<u64>,
    width: usize,
}

impl<S: Slot> GroupTable<S> {
    pub(super) fn new(arena: &Arc<MemoryArena>, width: usize, expected: usize) -> Result<Self> {
        let capacity = (expected * 2).next_power_of_two().max(16);
        Ok(Self {
            slots: arena.alloc(capacity, S::EMPTY, "group hash table")?,
            hashes: arena.alloc_with_capacity(expected, "group hash table")?,
            keys: arena.alloc_with_capacity(expected * width, "group hash table")?,
            width,
        })
    }

    pub(super) fn groups(&self) -> usize {
        self.hashes.len()
    }

    #[inline]
    fn home(&self, hash: u64) -> usize {
        ((hash >> 8) as usize) & (self.slots.len() - 1)
    }

    fn grow(&mut self) -> Result<()> {
        let capacity = self.slots.len() * 2;
        self.slots.try_resize(capacity, S::EMPTY)?;
        self.slots.fill(S::EMPTY);
        let mask = capacity - 1;
        for (gid, &hash) in self.hashes.iter().enumerate() {
            let mut i = ((hash >> 8) as usize) & mask;
            while self.slots[i] != S::EMPTY {
                i = (i + 1) & mask;
            }
            self.slots[i] = S::pack(hash, gid);
        }
        Ok(())
    }

    /// Returns the group id of `key`, inserting it if new. `None` means the
    /// group id space is exhausted.
    pub(super) fn find_or_insert(&mut self, hash: u64, key: &[u64]) -> Result<Option<usize>> {
        if (self.groups() + 1) * 2 > self.slots.len() {
            self.grow()?;
        }
        let mask = self.slots.len() - 1;
        let mut i = self.home(hash);
        loop {
            let slot = self.slots[i];
            if slot == S::EMPTY {
                let gid = self.groups();
                if gid >= S::MAX_GROUPS {
                    return Ok(None);
                }
                self.keys.try_extend_from_slice(key)?;
                self.hashes.try_push(hash)?;
                self.slots[i] = S::pack(hash, gid);
                return Ok(Some(gid));
            }
            if slot.salt_matches(hash) {
                let gid = slot.gid();
                if self.keys[gid * self.width..(gid + 1) * self.width] == *key {
                    return Ok(Some(gid));
                }
            }
            i = (i + 1) & mask;
        }
    }

    /// Returns spare hash and key capacity to the arena.
    fn shrink_to_fit(&mut self) {
        self.hashes.shrink_to_fit();
        self.keys.shrink_to_fit();
    }

    /// Rebuilds the key columns of every group in id order.
    pub(super) fn key_columns(&self, types: &[DataType]) -> Result<Vec<Column>> {
        let groups = self.groups();
        let rows = |g: usize| &self.keys[g * self.width..(g + 1) * self.width];
        types
            .iter()
            .enumerate()
            .map(|(i, &data_type)| {
                let words = (0..groups).map(|g| rows(g)[1 + i]).collect();
                let nulls: Vec<bool> = (0..groups).map(|g| rows(g)[0] >> i & 1 == 1).collect();
                column_from_words(data_type, words, &nulls)
            })
            .collect()
    }
}

/// Key words of every row, with null cells zeroed.
struct KeyRows<'a> {
    words: Vec<Vec<u64>>,
    columns: Vec<&'a Column>,
    types: Vec<DataType>,
    state: RandomState,
}

impl<'a> KeyRows<'a> {
    fn new(keys: &'a [GroupKey]) -> Self {
        let columns: Vec<&Column> = keys.iter().map(|k| k.column.as_ref()).collect();
        let words = columns
            .iter()
            .map(|c| {
                let mut words = key_words(c, KeyDomain::of(c.data_type()));
                if c.has_nulls() {
                    for (i, w) in words.iter_mut().enumerate() {
                        if c.is_null(i) {
                            *w = 0;
                        }
                    }
                }
                words
            })
            .collect();
        Self {
            words,
            types: columns.iter().map(|c| c.data_type()).collect(),
            columns,
            state: hasher(),
        }
    }

    fn width(&self) -> usize {
        1 + self.words.len()
    }

    /// Writes `[null bits, key words...]` of `row` into `out` and returns
    /// the row's hash.
    #[inline]
    fn fill(&self, row: usize, out: &mut [u64]) -> u64 {
        let mut nulls = 0u64;
        for (i, (words, column)) in self.words.iter().zip(&self.columns).enumerate() {
            out[1 + i] = words[row];
            nulls |= u64::from(column.is_null(row)) << i;
        }
        out[0] = nulls;
        let hash = row_hash(&self.state, &self.words, row);
        if nulls == 0 {
            hash
        } else {
            combine(hash, self.state.hash_one(nulls))
        }
    }
}

fn finish(table: &GroupTable<impl Slot>, set: &AccSet, rows: &KeyRows<'_>, input: &Input<'_>) -> Result<Grouped> {
    let groups: Vec<u32> = (0..table.groups())
        .map(|g| u32::try_from(g).map_err(|_| group_space_exhausted()))
        .collect::<Result<_>>()?;
    Ok(Grouped {
        keys: table.key_columns(&rows.types)?,
        aggs: set.finish(&input.plans, &groups)?,
    })
}

fn group_space_exhausted() -> TesseraError {
    TesseraError::DomainError("group by produced more groups than ids available".to_string())
}

#[inline]
fn accumulate(set: &mut AccSet, g: usize, input: &Input<'_>, row: usize) -> Result<()> {
    set.ensure(g + 1)?;
    set.add_row(g);
    for (j, agg) in input.aggs.iter().enumerate() {
        let (word, null) = agg.word(row);
        set.update(g, j, word, null);
    }
    Ok(())
}

fn sequential_with(ctx: &ExecContext<'_>, input: &Input<'_>, rows: &KeyRows<'_>) -> Result<Grouped> {
    let width = rows.width();
    let mut table = GroupTable::<u64>::new(ctx.arena, width, input.nrows.min(1024))?;
    let mut set = AccSet::new(ctx.arena, &input.plans, 0)?;
    let mut key = [0u64; 1 + MAX_GROUP_KEYS];
    try_for_each_row(input.selection, 0, input.nrows, |row| {
        let hash = rows.fill(row, &mut key[..width]);
        let g = table
            .find_or_insert(hash, &key[..width])?
            .ok_or_else(group_space_exhausted)?;
        accumulate(&mut set, g, input, row)
    })?;
    table.shrink_to_fit();
    finish(&table, &set, rows, input)
}

/// Single-threaded hash aggregation with 64-bit slots.
pub(super) fn sequential(ctx: &ExecContext<'_>, input: &Input<'_>) -> Result<Grouped> {
    sequential_with(ctx, input, &KeyRows::new(input.keys))
}

type Buffers = Vec<ScratchVec<u64>>;

/// Phase 1: per-worker, per-partition entry buffers.
fn scatter(ctx: &ExecContext<'_>, input: &Input<'_>, rows: &KeyRows<'_>) -> Result<Vec<Buffers>> {
    let k = rows.width() - 1;
    let a = input.aggs.len();
    let stride = 3 + k + a;
    let workers = ctx.workers_for(input.nrows);
    ctx.pool
        .map_ranges(input.nrows, workers, |_, start, end| -> Result<Buffers> {
            let mut buffers: Buffers = (0..PARTITIONS)
                .map(|_| ctx.arena.alloc_with_capacity(0, "group partitions"))
                .collect::<Result<_>>()?;
            let mut entry = [0u64; MAX_ENTRY];
            try_for_each_row(input.selection, start, end, |row| {
                let hash = rows.fill(row, &mut entry[1..2 + k]);
                entry[0] = hash;
                let mut agg_nulls = 0u64;
                for (j, agg) in input.aggs.iter().enumerate() {
                    let (word, null) = agg.word(row);
                    entry[2 + k + j] = word;
                    agg_nulls |= u64::from(null) << j;
                }
                entry[stride - 1] = agg_nulls;
                buffers[(hash as usize) & (PARTITIONS - 1)].try_extend_from_slice(&entry[..stride])
            })?;
            Ok(buffers)
        })
        .into_iter()
        .collect()
}

/// Phase 2: one table per partition over that partition's entries.
fn build_partition<S: Slot>(
    ctx: &ExecContext<'_>,
    input: &Input<'_>,
    scattered: &[Buffers],
    partition: usize,
    k: usize,
) -> Result<Option<(GroupTable<S>, AccSet)>> {
    let stride = 3 + k + input.aggs.len();
    let entries: usize = scattered.iter().map(|w| w[partition].len() / stride).sum();
    let mut table = GroupTable::<S>::new(ctx.arena, 1 + k, entries)?;
    let mut set = AccSet::new(ctx.arena, &input.plans, 0)?;
    for worker in scattered {
        for entry in worker[partition].chunks_exact(stride) {
            let Some(g) = table.find_or_insert(entry[0], &entry[1..2 + k])? else {
                return Ok(None);
            };
            set.ensure(g + 1)?;
            set.add_row(g);
            let nulls = entry[stride - 1];
            for j in 0..input.aggs.len() {
                set.update(g, j, entry[2 + k + j], nulls >> j & 1 == 1);
            }
        }
    }
    Ok(Some((table, set)))
}

fn partitioned_build<S: Slot>(
    ctx: &ExecContext<'_>,
    input: &Input<'_>,
    rows: &KeyRows<'_>,
) -> Result<Option<Grouped>> {
    let k = rows.width() - 1;
    let scattered = scatter(ctx, input, rows)?;
    ctx.check_cancelled()?;
    let built = ctx
        .pool
        .map_tasks(PARTITIONS, |p| build_partition::<S>(ctx, input, &scattered, p, k));
    drop(scattered);
    let mut tables = Vec::with_capacity(PARTITIONS);
    for partition in built {
        match partition? {
            Some(table) => tables.push(table),
            None => return Ok(None),
        }
    }
    let finished = ctx
        .pool
        .map_tasks(tables.len(), |p| finish(&tables[p].0, &tables[p].1, rows, input))
        .into_iter()
        .collect::<Result<Vec<Grouped>>>()?;
    let keys: Vec<&[Column]> = finished.iter().map(|g| g.keys.as_slice()).collect();
    let aggs: Vec<&[Column]> = finished.iter().map(|g| g.aggs.as_slice()).collect();
    Ok(Some(Grouped {
        keys: concat_parts(&keys, k)?,
        aggs: concat_parts(&aggs, input.aggs.len())?,
    }))
}

/// Concatenates column `c` of every part, for each `c` in `0..count`.
fn concat_parts(parts: &[&[Column]], count: usize) -> Result<Vec<Column>> {
    (0..count)
        .map(|c| Column::concat(&parts.iter().map(|p| &p[c]).collect::<Vec<_>>()))
        .collect()
}

/// Radix-partitioned parallel hash aggregation.
pub(super) fn partitioned(ctx: &ExecContext<'_>, input: &Input<'_>) -> Result<Grouped> {
    partitioned_with::<u32>(ctx, input)
}

fn partitioned_with<S: Slot>(ctx: &ExecContext<'_>, input: &Input<'_>) -> Result<Grouped> {
    let rows = KeyRows::new(input.keys);
    match partitioned_build::<S>(ctx, input, &rows) {
        Ok(Some(grouped)) => Ok(grouped),
        Ok(None) => {
            warn!("partition exhausted its group ids, regrouping single-threaded");
            sequential_with(ctx, input, &rows)
        }
        Err(e) if e.is_out_of_memory() => {
            warn!(error = %e, "partitioned group by out of memory, regrouping single-threaded");
            sequential_with(ctx, input, &rows)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::group::{GroupAgg, Measure};
    use crate::executor::{Executor, ExecutorConfig, GroupStrategy};
    use crate::storage::ColumnRef;
    use crate::types::Value;

    #[test]
    fn test_slot_packing() {
        let hash = 0xab00_0000_0000_1234u64;
        let s = <u32 as Slot>::pack(hash, 77);
        assert_eq!(s.gid(), 77);
        assert!(s.salt_matches(hash));
        assert!(!s.salt_matches(0x1200_0000_0000_1234));
        assert_ne!(s, <u32 as Slot>::EMPTY);
        let w = <u64 as Slot>::pack(hash, 1 << 40);
        assert_eq!(w.gid(), 1 << 40);
        assert!(w.salt_matches(hash));
    }

    #[test]
    fn test_table_grows_and_finds() {
        let arena = MemoryArena::unlimited();
        let mut table = GroupTable::<u32>::new(&arena, 2, 1).unwrap();
        let state = hasher();
        for round in 0..2 {
            for v in 0..1000u64 {
                let g = table
                    .find_or_insert(state.hash_one(v), &[0, v])
                    .unwrap()
                    .unwrap();
                assert_eq!(g, v as usize, "round {round}");
            }
        }
        assert_eq!(table.groups(), 1000);
        let cols = table.key_columns(&[DataType::I64]).unwrap();
        assert_eq!(cols[0].len(), 1000);
    }

    /// 24-bit slots capped at four groups per partition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Narrow(u32);

    impl Slot for Narrow {
        const EMPTY: Self = Narrow(u32::MAX);
        const MAX_GROUPS: usize = 4;

        fn pack(hash: u64, gid: usize) -> Self {
            Narrow(<u32 as Slot>::pack(hash, gid))
        }

        fn gid(self) -> usize {
            self.0.gid()
        }

        fn salt_matches(self, hash: u64) -> bool {
            self.0.salt_matches(hash)
        }
    }

    fn executor(workers: usize, memory_limit: usize) -> Executor {
        Executor::new(
            ExecutorConfig::new()
                .with_num_workers(workers)
                .with_parallel_threshold(1024)
                .with_group_strategy(GroupStrategy::Hashed)
                .with_memory_limit(memory_limit),
        )
        .unwrap()
    }

    fn sorted_rows(grouped: Grouped) -> Vec<Vec<Value>> {
        let columns: Vec<&Column> = grouped.keys.iter().chain(&grouped.aggs).collect();
        let mut rows: Vec<Vec<Value>> = (0..columns[0].len())
            .map(|r| columns.iter().map(|c| c.get(r)).collect())
            .collect();
        rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        rows
    }

    fn inputs(n: i64, cardinality: i64) -> ([GroupKey; 1], [GroupAgg; 2]) {
        let v: ColumnRef = Arc::new(Column::from_i64((0..n).collect()));
        let key = GroupKey {
            name: Arc::from("k"),
            column: Arc::new(Column::from_i64((0..n).map(|i| i % cardinality).collect())),
        };
        let agg = |measure, name: &str| GroupAgg {
            measure,
            name: Arc::from(name),
            column: Arc::clone(&v),
        };
        ([key], [agg(Measure::Sum, "v_sum"), agg(Measure::Max, "v_max")])
    }

    #[test]
    fn test_partition_out_of_memory_regroups_sequentially() {
        let n = 100_000;
        let (keys, aggs) = inputs(n, 10);
        let input = Input::new(&keys, &aggs, None, n as usize).unwrap();

        let limited = executor(4, 1 << 20);
        let ctx = limited.context();
        let rows = KeyRows::new(&keys);
        let err = partitioned_build::<u32>(&ctx, &input, &rows).unwrap_err();
        assert!(err.is_out_of_memory());

        let got = partitioned(&ctx, &input).unwrap();
        let unconstrained = executor(4, 0);
        let expected = partitioned(&unconstrained.context(), &input).unwrap();
        let got = sorted_rows(got);
        assert_eq!(got.len(), 10);
        assert_eq!(got, sorted_rows(expected));
    }

    #[test]
    fn test_exhausted_group_ids_regroup_sequentially() {
        let n = 20_000;
        let (keys, aggs) = inputs(n, 5000);
        let input = Input::new(&keys, &aggs, None, n as usize).unwrap();
        let exec = executor(4, 0);
        let ctx = exec.context();
        let rows = KeyRows::new(&keys);
        assert!(partitioned_build::<Narrow>(&ctx, &input, &rows).unwrap().is_none());

        let got = sorted_rows(partitioned_with::<Narrow>(&ctx, &input).unwrap());
        assert_eq!(got.len(), 5000);
        assert_eq!(got, sorted_rows(sequential(&ctx, &input).unwrap()));
    }

    #[test]
    fn test_sequential_hands_back_spare_capacity() {
        let n = 2000;
        let (keys, aggs) = inputs(n, 3);
        let input = Input::new(&keys, &aggs, None, n as usize).unwrap();
        let exec = executor(1, 0);
        let ctx = exec.context();
        let rows = KeyRows::new(&keys);
        let mut table = GroupTable::<u64>::new(ctx.arena, rows.width(), 1024).unwrap();
        let before = ctx.arena.in_use();
        let mut key = [0u64; 2];
        for row in 0..3 {
            let hash = rows.fill(row, &mut key);
            table.find_or_insert(hash, &key).unwrap();
        }
        table.shrink_to_fit();
        assert!(ctx.arena.in_use() < before);
        assert_eq!(sorted_rows(sequential(&ctx, &input).unwrap()).len(), 3);
    }

    #[test]
    fn test_budget_failure_is_oom() {
        let arena = MemoryArena::new(64);
        let err = GroupTable::<u32>::new(&arena, 2, 1000).unwrap_err();
        assert!(err.is_out_of_memory());
    }
}
