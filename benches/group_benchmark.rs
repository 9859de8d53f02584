//! GROUP BY benchmarks.
//!
//! Benchmarks:
//! - Low-cardinality keys (dense arrays) against the hash paths
//! - High-cardinality keys (partitioned hashing)
//! - Parted tables (per-segment partials)

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera::{
    AggregateFunction, Column, Executor, ExecutorConfig, Graph, GroupStrategy, NodeId,
    PartedColumn, Table, TableColumn,
};

/// Helper: `n` rows with keys drawn from `0..cardinality` and a float measure.
fn setup_columns(n: usize, cardinality: i64) -> (Column, Column) {
    let mut rng = StdRng::seed_from_u64(7);
    let keys: Vec<i64> = (0..n).map(|_| rng.gen_range(0..cardinality)).collect();
    let values: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..100.0)).collect();
    (Column::from_i64(keys), Column::from_f64(values))
}

fn group_graph(table: Table) -> (Graph, NodeId) {
    let mut graph = Graph::with_table(table);
    let input = graph.table_node().unwrap();
    let (k, v) = (graph.scan("k"), graph.scan("v"));
    let root = graph.group(
        input,
        &[k],
        &[
            (AggregateFunction::Sum, v),
            (AggregateFunction::Max, v),
            (AggregateFunction::Avg, v),
        ],
    );
    (graph, root)
}

/// Benchmark each strategy across key cardinalities.
fn bench_group_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_by");
    let size = 1_000_000;
    group.throughput(Throughput::Elements(size as u64));

    for cardinality in [16, 10_000, 500_000] {
        let (k, v) = setup_columns(size, cardinality);
        let table = Table::from_columns(vec![("k", k), ("v", v)]).unwrap();
        let (graph, root) = group_graph(table);
        for strategy in [
            GroupStrategy::Auto,
            GroupStrategy::Direct,
            GroupStrategy::Hashed,
            GroupStrategy::Sequential,
        ] {
            let exec = Executor::new(ExecutorConfig::new().with_group_strategy(strategy)).unwrap();
            group.bench_with_input(
                BenchmarkId::new(format!("{strategy:?}"), cardinality),
                &cardinality,
                |b, _| b.iter(|| exec.execute(black_box(&graph), root).unwrap()),
            );
        }
    }
    group.finish();
}

/// Benchmark a parted table with few groups per segment.
fn bench_group_parted(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_by_parted");
    let segments = 64;
    let rows = 16_384;
    group.throughput(Throughput::Elements((segments * rows) as u64));

    let mut keys = Vec::with_capacity(segments);
    let mut values = Vec::with_capacity(segments);
    for _ in 0..segments {
        let (k, v) = setup_columns(rows, 100);
        keys.push(Arc::new(k));
        values.push(Arc::new(v));
    }
    let mut table = Table::new();
    table
        .add_column("k", TableColumn::Parted(PartedColumn::new(keys).unwrap()))
        .unwrap();
    table
        .add_column("v", TableColumn::Parted(PartedColumn::new(values).unwrap()))
        .unwrap();
    let flat = table.flatten().unwrap();

    for (label, table) in [("parted", table), ("flat", flat)] {
        let (graph, root) = group_graph(table);
        let exec = Executor::with_defaults().unwrap();
        group.bench_function(label, |b| {
            b.iter(|| exec.execute(black_box(&graph), root).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_group_strategies, bench_group_parted);
criterion_main!(benches);
