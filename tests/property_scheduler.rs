// tests/property_scheduler.rs

mod common;
use crate::common::simulated::{simulate, simulated_workers, KillPlan};
use crate::common::STRATEGIES;

use proptest::prelude::*;
use serde_json::json;

use distdag::dag::{get_sync, KeySpec, Nested, TaskExpr, TaskGraph};
use distdag::functions::FunctionRegistry;
use distdag::scheduler::SchedulerOptions;

/// A random graph: key i is a literal when it has no dependencies, otherwise
/// `inc(sum([deps...]))` over keys < i.
fn graph_strategy(max_keys: usize) -> impl Strategy<Value = (TaskGraph, KeySpec)> {
    (2..=max_keys).prop_flat_map(|n| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n),
            proptest::collection::vec(0..n, 1..4),
        )
            .prop_map(move |(raw_deps, wanted)| {
                let mut graph = TaskGraph::new();
                for (i, ds) in raw_deps.into_iter().enumerate() {
                    let mut deps: Vec<usize> = if i == 0 {
                        Vec::new()
                    } else {
                        ds.into_iter().map(|d| d % i).collect()
                    };
                    deps.sort_unstable();
                    deps.dedup();
                    let expr = if deps.is_empty() {
                        TaskExpr::literal(json!(i))
                    } else {
                        let args = deps.iter().map(|d| TaskExpr::key(name(*d))).collect();
                        TaskExpr::apply(
                            "inc",
                            vec![TaskExpr::apply("sum", vec![TaskExpr::List(args)])],
                        )
                    };
                    graph.insert(name(i).into(), expr);
                }
                let request = Nested::list(wanted.into_iter().map(|w| Nested::key(name(w))).collect());
                (graph, request)
            })
    })
}

fn name(i: usize) -> String {
    format!("k{i}")
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn distributed_get_matches_the_local_evaluator(
        (graph, request) in graph_strategy(12),
        cores in proptest::collection::vec(1..3usize, 1..4),
    ) {
        let expected = get_sync(&graph, &request, &FunctionRegistry::with_builtins()).unwrap();
        let workers = simulated_workers(&cores);
        for strategy in STRATEGIES {
            let options = SchedulerOptions { strategy, validate: true, ..SchedulerOptions::default() };
            let run = runtime()
                .block_on(simulate(&graph, &request, &workers, &options, &[], None))
                .unwrap();
            prop_assert_eq!(&run.values, &expected);

            // Only the requested keys remain on the workers.
            prop_assert!(run.stores.keys().is_subset(&request.key_set()));

            // Without failures nothing is computed twice.
            let keys: Vec<_> = run.dispatched.iter().map(|(_, key)| key).collect();
            let distinct: std::collections::BTreeSet<_> = keys.iter().collect();
            prop_assert_eq!(distinct.len(), keys.len());
        }
    }

    #[test]
    fn losing_a_worker_does_not_change_the_answer(
        (graph, request) in graph_strategy(12),
        extra_cores in proptest::collection::vec(1..3usize, 1..3),
        kill_after in 1..8usize,
    ) {
        let expected = get_sync(&graph, &request, &FunctionRegistry::with_builtins()).unwrap();
        let mut cores = vec![1];
        cores.extend(extra_cores);
        let workers = simulated_workers(&cores);
        for strategy in STRATEGIES {
            let options = SchedulerOptions { strategy, validate: true, ..SchedulerOptions::default() };
            let victim = workers[0].0.clone();
            let kill = KillPlan { worker: victim.clone(), after: kill_after };
            let run = runtime()
                .block_on(simulate(&graph, &request, &workers, &options, &[], Some(kill)))
                .unwrap();
            prop_assert_eq!(&run.values, &expected);

            // A dead worker is never handed work again.
            prop_assert!(run.dispatched.iter().skip(kill_after).all(|(worker, _)| *worker != victim));
        }
    }
}
