//! Contract tests: properties every execution path must uphold.

use proptest::prelude::*;
use tessera::{
    AggregateFunction, Column, DataType, Executor, ExecutorConfig, Graph, GroupStrategy, JoinType,
    NodeId, SortKey, SortStrategy, Table, Value,
};

fn nullable(values: &[Option<i64>]) -> Column {
    let cells: Vec<Value> = values
        .iter()
        .map(|v| v.map_or(Value::Null, Value::I64))
        .collect();
    Column::from_values(DataType::I64, &cells).expect("nullable column")
}

fn run_table(config: ExecutorConfig, graph: &Graph, root: NodeId) -> Table {
    Executor::new(config)
        .expect("start executor")
        .execute(graph, root)
        .expect("execute graph")
        .into_table()
        .expect("table result")
}

fn sorted_rows(table: &Table) -> Vec<Vec<Value>> {
    let mut rows = table.rows().expect("read rows");
    rows.sort_by_key(|r| format!("{r:?}"));
    rows
}

// =============================================================================
// Sort contracts
// =============================================================================

mod sort_contracts {
    use super::*;
    use std::cmp::Ordering;

    fn key_order(a: Option<i64>, b: Option<i64>, descending: bool, nulls_first: bool) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => {
                if nulls_first {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (Some(_), None) => {
                if nulls_first {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (Some(x), Some(y)) if descending => y.cmp(&x),
            (Some(x), Some(y)) => x.cmp(&y),
        }
    }

    fn sort_graph(a: &[Option<i64>], b: &[i64], desc: bool, nulls_first: bool, limit: Option<usize>) -> (Graph, NodeId) {
        let table = Table::from_columns(vec![
            ("a", nullable(a)),
            ("b", Column::from_i64(b.to_vec())),
            ("row", Column::from_i64((0..a.len() as i64).collect())),
        ])
        .expect("build table");
        let mut g = Graph::with_table(table);
        let t = g.table_node().expect("table node");
        let (ka, kb) = (g.scan("a"), g.scan("b"));
        let keys = vec![
            SortKey {
                expr: ka,
                descending: desc,
                nulls_first,
            },
            SortKey::asc(kb),
        ];
        let root = match limit {
            Some(n) => g.sort_limit(t, keys, n),
            None => g.sort(t, keys),
        };
        (g, root)
    }

    fn rows_column(table: &Table) -> Vec<i64> {
        table
            .column_values("row")
            .expect("row column")
            .iter()
            .filter_map(Value::as_i64)
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(40))]

        /// Property: every strategy yields the stable reference permutation.
        #[test]
        fn test_every_strategy_matches_reference(
            rows in proptest::collection::vec((proptest::option::of(-50i64..50), -3i64..3), 0..300),
            desc in any::<bool>(),
            nulls_first in any::<bool>(),
        ) {
            let a: Vec<Option<i64>> = rows.iter().map(|r| r.0).collect();
            let b: Vec<i64> = rows.iter().map(|r| r.1).collect();
            let mut expected: Vec<i64> = (0..a.len() as i64).collect();
            expected.sort_by(|&x, &y| {
                let (x, y) = (x as usize, y as usize);
                key_order(a[x], a[y], desc, nulls_first).then(b[x].cmp(&b[y]))
            });

            let (g, root) = sort_graph(&a, &b, desc, nulls_first, None);
            for strategy in [SortStrategy::Auto, SortStrategy::Insertion, SortStrategy::Radix, SortStrategy::Merge] {
                let out = run_table(ExecutorConfig::new().with_sort_strategy(strategy), &g, root);
                prop_assert_eq!(rows_column(&out), expected.clone(), "{:?}", strategy);
            }
        }

        /// Property: a limited sort is a prefix of the full sort.
        #[test]
        fn test_limit_is_prefix(
            a in proptest::collection::vec(proptest::option::of(-1000i64..1000), 0..400),
            limit in 0usize..40,
        ) {
            let b = vec![0; a.len()];
            let (g, full) = sort_graph(&a, &b, false, false, None);
            let all = rows_column(&run_table(ExecutorConfig::new(), &g, full));
            let (g, top) = sort_graph(&a, &b, false, false, Some(limit));
            for strategy in [SortStrategy::Auto, SortStrategy::TopN] {
                let out = rows_column(&run_table(ExecutorConfig::new().with_sort_strategy(strategy), &g, top));
                prop_assert_eq!(&out[..], &all[..limit.min(all.len())]);
            }
        }
    }
}

// =============================================================================
// GROUP BY contracts
// =============================================================================

mod group_contracts {
    use super::*;

    fn group_graph(keys: &[i64], syms: &[u8], vals: &[Option<i64>]) -> (Graph, NodeId) {
        let names: Vec<String> = syms.iter().map(|s| format!("s{s}")).collect();
        let table = Table::from_columns(vec![
            ("k", Column::from_i64(keys.to_vec())),
            ("s", Column::from_symbols(&names)),
            ("v", nullable(vals)),
        ])
        .expect("build table");
        let mut g = Graph::with_table(table);
        let t = g.table_node().expect("table node");
        let (k, s, v) = (g.scan("k"), g.scan("s"), g.scan("v"));
        let root = g.group(
            t,
            &[k, s],
            &[
                (AggregateFunction::Sum, v),
                (AggregateFunction::Count, v),
                (AggregateFunction::Min, v),
                (AggregateFunction::Max, v),
                (AggregateFunction::First, v),
                (AggregateFunction::Last, v),
            ],
        );
        (g, root)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(30))]

        /// Property: every GROUP BY path yields the same set of rows.
        #[test]
        fn test_paths_are_equivalent(
            rows in proptest::collection::vec((-20i64..20, 0u8..4, proptest::option::of(-100i64..100)), 0..3000),
        ) {
            let keys: Vec<i64> = rows.iter().map(|r| r.0).collect();
            let syms: Vec<u8> = rows.iter().map(|r| r.1).collect();
            let vals: Vec<Option<i64>> = rows.iter().map(|r| r.2).collect();
            let (g, root) = group_graph(&keys, &syms, &vals);
            let base = ExecutorConfig::new().with_num_workers(3).with_parallel_threshold(1024);
            let reference = sorted_rows(&run_table(base.clone().with_group_strategy(GroupStrategy::Sequential), &g, root));
            for strategy in [GroupStrategy::Auto, GroupStrategy::Direct, GroupStrategy::Hashed] {
                let out = run_table(base.clone().with_group_strategy(strategy), &g, root);
                prop_assert_eq!(sorted_rows(&out), reference.clone(), "{:?}", strategy);
            }
        }

        /// Property: group counts add up to the number of rows.
        #[test]
        fn test_counts_cover_every_row(keys in proptest::collection::vec(0i64..50, 0..2000)) {
            let mut g = Graph::with_table(
                Table::from_columns(vec![("k", Column::from_i64(keys.clone()))]).expect("build table"),
            );
            let t = g.table_node().expect("table node");
            let k = g.scan("k");
            let root = g.group(t, &[k], &[(AggregateFunction::Count, k)]);
            let out = run_table(ExecutorConfig::new(), &g, root);
            let total: i64 = out
                .column_values("k_count")
                .expect("counts")
                .iter()
                .filter_map(Value::as_i64)
                .sum();
            prop_assert_eq!(total, keys.len() as i64);
        }
    }
}

// =============================================================================
// Join contracts
// =============================================================================

mod join_contracts {
    use super::*;
    use std::collections::HashSet;

    fn join_rows(left: &[Option<i64>], right: &[Option<i64>], join_type: JoinType) -> Vec<Vec<Value>> {
        let side = |keys: &[Option<i64>]| {
            Table::from_columns(vec![
                ("k", nullable(keys)),
                ("id", Column::from_i64((0..keys.len() as i64).collect())),
            ])
            .expect("build table")
        };
        let mut g = Graph::new();
        let l = g.const_table(side(left));
        let r = g.const_table(side(right));
        let k = g.scan("k");
        let root = g.join(l, r, &[k], &[k], join_type);
        run_table(ExecutorConfig::new(), &g, root)
            .rows()
            .expect("rows")
    }

    fn ids(rows: &[Vec<Value>], col: usize) -> HashSet<i64> {
        rows.iter().filter_map(|r| r[col].as_i64()).collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(40))]

        /// Property: inner rows match on keys; outer joins keep their sides.
        #[test]
        fn test_join_completeness(
            left in proptest::collection::vec(proptest::option::of(0i64..12), 0..120),
            right in proptest::collection::vec(proptest::option::of(0i64..12), 0..120),
        ) {
            // Columns: k, id, k_right, id_right.
            let inner = join_rows(&left, &right, JoinType::Inner);
            for row in &inner {
                prop_assert!(!row[0].is_null());
                prop_assert_eq!(&row[0], &row[2]);
            }
            let expected: usize = left
                .iter()
                .flatten()
                .map(|l| right.iter().flatten().filter(|r| *r == l).count())
                .sum();
            prop_assert_eq!(inner.len(), expected);

            let all_left: HashSet<i64> = (0..left.len() as i64).collect();
            let all_right: HashSet<i64> = (0..right.len() as i64).collect();
            let outer = join_rows(&left, &right, JoinType::LeftOuter);
            prop_assert_eq!(ids(&outer, 1), all_left.clone());
            for row in outer.iter().filter(|r| r[3].is_null()) {
                prop_assert!(row[2].is_null());
            }

            let full = join_rows(&left, &right, JoinType::FullOuter);
            prop_assert_eq!(ids(&full, 1), all_left);
            prop_assert_eq!(ids(&full, 3), all_right);
        }
    }
}
