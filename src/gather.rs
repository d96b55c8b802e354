// src/gather.rs

//! Result gathering: turn a nested request of keys into the values the
//! workers hold, in the same shape.
//!
//! Holders of a key are tried in address order. A holder that drops the
//! connection is skipped for the rest of the gather and the next holder is
//! tried; only when every holder of some key has failed does the gather fail.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;

use tracing::{debug, warn};

use crate::coordinator::CoordinatorClient;
use crate::dag::keys::{KeySpec, Nested};
use crate::dag::task::{Key, Value};
use crate::errors::{DistError, Result};
use crate::protocol::Address;
use crate::registry::Registry;
use crate::worker::client::get_data;

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<BTreeMap<Key, Value>>> + Send + 'a>>;

/// Where gathered values come from.
pub trait DataFetcher: Send + Sync {
    /// Values of `keys` held by `worker`. Keys the worker does not hold are
    /// absent from the map.
    fn fetch<'a>(&'a self, worker: &'a Address, keys: Vec<Key>) -> FetchFuture<'a>;
}

/// Fetches over the worker data API.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFetcher;

impl DataFetcher for TcpFetcher {
    fn fetch<'a>(&'a self, worker: &'a Address, keys: Vec<Key>) -> FetchFuture<'a> {
        Box::pin(get_data(worker, keys))
    }
}

/// Gather `request` using the placement recorded in `registry`.
pub async fn gather_from_registry(
    registry: &Registry,
    request: &KeySpec,
    fetcher: &dyn DataFetcher,
) -> Result<Nested<Value>> {
    let mut values: BTreeMap<Key, Value> = BTreeMap::new();
    let mut pending = request.key_set();
    let mut dead: BTreeSet<Address> = BTreeSet::new();
    // (key, holder) pairs where the holder answered without the value.
    let mut absent: BTreeSet<(Key, Address)> = BTreeSet::new();

    while !pending.is_empty() {
        let mut plan: BTreeMap<Address, Vec<Key>> = BTreeMap::new();
        for key in &pending {
            let holders = registry.holders(key);
            if holders.is_empty() {
                return Err(DistError::KeyNotFound(key.clone()));
            }
            let next = holders
                .iter()
                .find(|h| !dead.contains(*h) && !absent.contains(&(key.clone(), (*h).clone())));
            match next {
                Some(holder) => plan.entry(holder.clone()).or_default().push(key.clone()),
                None => {
                    return Err(match holders.into_iter().find(|h| dead.contains(h)) {
                        Some(holder) => DistError::WorkerUnavailable(holder),
                        None => DistError::KeyNotFound(key.clone()),
                    });
                }
            }
        }

        for (worker, keys) in plan {
            debug!(worker = %worker, keys = keys.len(), "gathering");
            match fetcher.fetch(&worker, keys.clone()).await {
                Ok(mut data) => {
                    for key in keys {
                        match data.remove(&key) {
                            Some(value) => {
                                pending.remove(&key);
                                values.insert(key, value);
                            }
                            None => {
                                warn!(key = %key, worker = %worker, "holder no longer has key");
                                absent.insert((key, worker.clone()));
                            }
                        }
                    }
                }
                Err(e) if e.is_connection_loss() => {
                    warn!(worker = %worker, error = %e, "holder unavailable; trying others");
                    dead.insert(worker);
                }
                Err(e) => return Err(e),
            }
        }
    }

    request.try_map(&mut |key| {
        values
            .get(key)
            .cloned()
            .ok_or_else(|| DistError::KeyNotFound(key.clone()))
    })
}

/// Gather `request` from the cluster behind `coordinator`.
pub async fn gather(coordinator: &Address, request: &KeySpec) -> Result<Nested<Value>> {
    let mut client = CoordinatorClient::connect(coordinator).await?;
    let keys: Vec<Key> = request.key_set().into_iter().collect();
    let who_has = client.who_has(Some(keys)).await?;
    let ncores = client.ncores().await?;
    let registry = Registry::from_snapshot(ncores, who_has);
    gather_from_registry(&registry, request, &TcpFetcher).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// In-memory workers; addresses listed in `down` refuse connections.
    #[derive(Default)]
    struct FakeFetcher {
        stores: BTreeMap<Address, BTreeMap<Key, Value>>,
        down: BTreeSet<Address>,
        calls: Mutex<Vec<Address>>,
    }

    impl FakeFetcher {
        fn holding(mut self, worker: &str, key: &str, value: Value) -> Self {
            self.stores
                .entry(Address::from(worker))
                .or_default()
                .insert(Key::from(key), value);
            self
        }

        fn down(mut self, worker: &str) -> Self {
            self.down.insert(Address::from(worker));
            self
        }
    }

    impl DataFetcher for FakeFetcher {
        fn fetch<'a>(&'a self, worker: &'a Address, keys: Vec<Key>) -> FetchFuture<'a> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(worker.clone());
                if self.down.contains(worker) {
                    return Err(DistError::WorkerUnavailable(worker.clone()));
                }
                let store = self.stores.get(worker).cloned().unwrap_or_default();
                Ok(keys
                    .into_iter()
                    .filter_map(|k| store.get(&k).cloned().map(|v| (k, v)))
                    .collect())
            })
        }
    }

    fn registry(placement: &[(&str, &str)]) -> Registry {
        let mut r = Registry::new();
        for (worker, key) in placement {
            let worker = Address::from(*worker);
            if !r.contains_worker(&worker) {
                r.add_worker(worker.clone(), 1);
            }
            r.add_keys(&worker, [Key::from(*key)]).unwrap();
        }
        r
    }

    #[tokio::test]
    async fn gathers_in_the_shape_of_the_request() {
        let reg = registry(&[("a:1", "x"), ("b:1", "y")]);
        let fetcher = FakeFetcher::default()
            .holding("a:1", "x", json!(1))
            .holding("b:1", "y", json!(2));
        let request: KeySpec = serde_json::from_value(json!(["x", ["y", "x"]])).unwrap();

        let out = gather_from_registry(&reg, &request, &fetcher).await.unwrap();
        assert_eq!(serde_json::to_value(&out).unwrap(), json!([1, [2, 1]]));
    }

    #[tokio::test]
    async fn falls_through_to_the_next_holder() {
        let reg = registry(&[("a:1", "x"), ("b:1", "x")]);
        let fetcher = FakeFetcher::default()
            .down("a:1")
            .holding("b:1", "x", json!(7));

        let out = gather_from_registry(&reg, &Nested::key("x"), &fetcher)
            .await
            .unwrap();
        assert_eq!(out, Nested::One(json!(7)));
        assert_eq!(
            *fetcher.calls.lock().unwrap(),
            vec![Address::from("a:1"), Address::from("b:1")]
        );
    }

    #[tokio::test]
    async fn missing_key_is_key_not_found() {
        let reg = registry(&[("a:1", "x")]);
        let fetcher = FakeFetcher::default().holding("a:1", "x", json!(1));
        let err = gather_from_registry(&reg, &Nested::key("nope"), &fetcher)
            .await
            .unwrap_err();
        assert!(matches!(err, DistError::KeyNotFound(ref k) if k.as_str() == "nope"));
    }

    #[tokio::test]
    async fn every_holder_down_is_worker_unavailable() {
        let reg = registry(&[("a:1", "x")]);
        let fetcher = FakeFetcher::default().down("a:1");
        let err = gather_from_registry(&reg, &Nested::key("x"), &fetcher)
            .await
            .unwrap_err();
        assert!(matches!(err, DistError::WorkerUnavailable(ref w) if w.as_str() == "a:1"));
    }
}
