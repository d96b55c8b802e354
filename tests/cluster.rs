// tests/cluster.rs

mod common;
use crate::common::builders::{scheduler_graph, scheduler_request, slow_chains, GraphBuilder};
use crate::common::{init_tracing, set, start_cluster, with_timeout, STRATEGIES};

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::json;

use distdag::coordinator::CoordinatorClient;
use distdag::dag::{Key, Nested, TaskExpr};
use distdag::errors::DistError;
use distdag::gather::gather;
use distdag::protocol::Address;
use distdag::scheduler::{get, GetOutput};
use distdag::types::Strategy;
use distdag::worker::client::{terminate, update_data};

/// Every key held by any worker, according to the coordinator.
async fn keys_on_workers(coordinator: &Address) -> BTreeSet<Key> {
    let mut client = CoordinatorClient::connect(coordinator).await.unwrap();
    client
        .has_what(None)
        .await
        .unwrap()
        .into_values()
        .flatten()
        .collect()
}

async fn workers_of(coordinator: &Address) -> BTreeSet<Address> {
    let mut client = CoordinatorClient::connect(coordinator).await.unwrap();
    client.ncores().await.unwrap().into_keys().collect()
}

#[tokio::test]
async fn get_leaves_only_the_requested_keys_behind() {
    init_tracing();
    with_timeout(async {
        for strategy in STRATEGIES {
            let cluster = start_cluster(&[2, 1], strategy).await;
            let request = scheduler_request();

            let output = cluster
                .get(&scheduler_graph(), &request, false)
                .await
                .unwrap();
            let GetOutput::Remote(remote) = output else {
                panic!("expected remote data, got {output:?}");
            };
            let located: BTreeSet<Key> = remote.leaves().into_iter().map(|r| r.key.clone()).collect();
            assert_eq!(located, set(&["total", "c", "z"]));
            assert!(remote.leaves().iter().all(|r| !r.holders.is_empty()));

            let values = gather(cluster.coordinator_address(), &request).await.unwrap();
            assert_eq!(serde_json::to_value(&values).unwrap(), json!([232, 200, [32]]));

            assert_eq!(
                keys_on_workers(cluster.coordinator_address()).await,
                set(&["total", "c", "z"])
            );
            cluster.shutdown().await.unwrap();
        }
    })
    .await;
}

#[tokio::test]
async fn get_with_gather_returns_values() {
    init_tracing();
    with_timeout(async {
        let cluster = start_cluster(&[1, 1], Strategy::Adaptive).await;
        let graph = GraphBuilder::new()
            .literal("x", 1)
            .call("y", "inc", &["x"])
            .build();

        let output = cluster.get(&graph, &Nested::key("y"), true).await.unwrap();
        assert_eq!(output, GetOutput::Values(Nested::One(json!(2))));
        cluster.shutdown().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn task_errors_surface_with_their_category() {
    init_tracing();
    with_timeout(async {
        for strategy in STRATEGIES {
            let cluster = start_cluster(&[1, 1], strategy).await;
            let graph = GraphBuilder::new()
                .literal("x", 1)
                .literal("y", 0)
                .call("z", "div", &["x", "y"])
                .build();

            let err = cluster
                .get(&graph, &Nested::key("z"), true)
                .await
                .unwrap_err();
            match err {
                DistError::TaskExecution { key, category, .. } => {
                    assert_eq!(key, Key::from("z"));
                    assert_eq!(category, "ZeroDivisionError");
                }
                other => panic!("expected a task error, got {other:?}"),
            }

            // Nothing this failed request produced is left behind.
            assert!(keys_on_workers(cluster.coordinator_address()).await.is_empty());
            cluster.shutdown().await.unwrap();
        }
    })
    .await;
}

#[tokio::test]
async fn values_already_on_workers_are_not_recomputed() {
    init_tracing();
    with_timeout(async {
        let cluster = start_cluster(&[1, 1], Strategy::Adaptive).await;
        let holder = cluster.worker_addresses()[0].clone();
        update_data(&holder, [(Key::from("y"), json!(1))].into_iter().collect())
            .await
            .unwrap();

        // Computing x would raise; y is already in memory so x is never run.
        let graph = GraphBuilder::new()
            .task("x", TaskExpr::apply("fail", vec![]))
            .call("y", "inc", &["x"])
            .call("z", "inc", &["y"])
            .build();
        let output = cluster.get(&graph, &Nested::key("z"), true).await.unwrap();
        assert_eq!(output, GetOutput::Values(Nested::One(json!(2))));

        // y was not produced by this request, so it stays.
        assert_eq!(
            keys_on_workers(cluster.coordinator_address()).await,
            set(&["y", "z"])
        );
        cluster.shutdown().await.unwrap();
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_survives_a_worker_dying_mid_request() {
    init_tracing();
    with_timeout(async {
        let mut cluster = start_cluster(&[1, 2], Strategy::Adaptive).await;
        let coordinator = cluster.coordinator_address().clone();
        let options = cluster.options();

        let running = tokio::spawn(async move {
            get(&coordinator, &slow_chains(10), &Nested::key("z"), &options, true).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cluster.kill_worker(0).await.unwrap();

        let output = running.await.unwrap().unwrap();
        assert_eq!(output, GetOutput::Values(Nested::One(json!(96))));
        cluster.shutdown().await.unwrap();
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoning_a_request_removes_its_data() {
    init_tracing();
    with_timeout(async {
        let cluster = start_cluster(&[1, 2], Strategy::Adaptive).await;
        let coordinator = cluster.coordinator_address().clone();
        let options = cluster.options();

        let request_coordinator = coordinator.clone();
        let running = tokio::spawn(async move {
            get(&request_coordinator, &slow_chains(10), &Nested::key("z"), &options, true).await
        });
        while keys_on_workers(&coordinator).await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());

        // The request's own task deletes what it computed.
        while !keys_on_workers(&coordinator).await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Nothing arrives afterwards from computes that were in flight.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(keys_on_workers(&coordinator).await.is_empty());
        cluster.shutdown().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn membership_follows_workers_coming_and_going() {
    init_tracing();
    with_timeout(async {
        let mut cluster = start_cluster(&[1, 2, 1], Strategy::Adaptive).await;
        let coordinator = cluster.coordinator_address().clone();
        let all: BTreeSet<Address> = cluster.worker_addresses().into_iter().collect();
        assert_eq!(workers_of(&coordinator).await, all);

        let mut client = CoordinatorClient::connect(&coordinator).await.unwrap();
        let ncores = client.ncores().await.unwrap();
        assert_eq!(ncores.values().sum::<usize>(), 4);

        let killed = cluster.worker_addresses()[0].clone();
        cluster.kill_worker(0).await.unwrap();
        // A stopped worker has already unregistered.
        assert!(!workers_of(&coordinator).await.contains(&killed));
        let terminated = cluster.worker_addresses()[0].clone();
        terminate(&terminated, true).await.unwrap();

        // Both leave once their registration connections close.
        loop {
            let live = workers_of(&coordinator).await;
            if !live.contains(&killed) && !live.contains(&terminated) {
                assert_eq!(live.len(), 1);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(cluster.kill_worker(0).await.is_err());
        cluster.shutdown().await.unwrap();
    })
    .await;
}
