//! Sort benchmarks.
//!
//! Benchmarks:
//! - Full sort of one integer key per strategy
//! - Two-key sort (symbol, float)
//! - Top-N against a full sort with LIMIT

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera::{Column, Executor, ExecutorConfig, Graph, NodeId, SortKey, SortStrategy, Table};

/// Helper: a table of `n` rows with an integer, a symbol and a float column.
fn setup_table(n: usize) -> Table {
    let mut rng = StdRng::seed_from_u64(42);
    let ints: Vec<i64> = (0..n).map(|_| rng.gen_range(-1_000_000..1_000_000)).collect();
    let floats: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
    let names: Vec<String> = (0..n).map(|_| format!("city{}", rng.gen_range(0..200))).collect();
    Table::from_columns(vec![
        ("id", Column::from_i64(ints)),
        ("city", Column::from_symbols(&names)),
        ("score", Column::from_f64(floats)),
    ])
    .unwrap()
}

fn sort_graph(table: Table, columns: &[&str], limit: Option<usize>) -> (Graph, NodeId) {
    let mut graph = Graph::with_table(table);
    let input = graph.table_node().unwrap();
    let keys: Vec<SortKey> = columns.iter().map(|c| SortKey::asc(graph.scan(c))).collect();
    let root = match limit {
        Some(n) => graph.sort_limit(input, keys, n),
        None => graph.sort(input, keys),
    };
    (graph, root)
}

/// Benchmark one integer key across strategies.
fn bench_sort_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_single_key");

    for size in [1_000, 100_000, 1_000_000].iter() {
        let (graph, root) = sort_graph(setup_table(*size), &["id"], None);
        group.throughput(Throughput::Elements(*size as u64));
        for strategy in [SortStrategy::Auto, SortStrategy::Radix, SortStrategy::Merge] {
            let exec = Executor::new(ExecutorConfig::new().with_sort_strategy(strategy)).unwrap();
            group.bench_with_input(
                BenchmarkId::new(format!("{strategy:?}"), size),
                size,
                |b, _| b.iter(|| exec.execute(black_box(&graph), root).unwrap()),
            );
        }
    }
    group.finish();
}

/// Benchmark a composite symbol + float key.
fn bench_sort_two_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_two_keys");

    for size in [10_000, 500_000].iter() {
        let (graph, root) = sort_graph(setup_table(*size), &["city", "score"], None);
        let exec = Executor::with_defaults().unwrap();
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| exec.execute(black_box(&graph), root).unwrap());
        });
    }
    group.finish();
}

/// Benchmark LIMIT 10 through the heap path and the full-sort path.
fn bench_top_n(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_limit_10");
    let size = 1_000_000;
    let (graph, root) = sort_graph(setup_table(size), &["id"], Some(10));
    group.throughput(Throughput::Elements(size as u64));

    for strategy in [SortStrategy::TopN, SortStrategy::Radix] {
        let exec = Executor::new(ExecutorConfig::new().with_sort_strategy(strategy)).unwrap();
        group.bench_function(format!("{strategy:?}"), |b| {
            b.iter(|| exec.execute(black_box(&graph), root).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sort_strategies, bench_sort_two_keys, bench_top_n);
criterion_main!(benches);
