// src/worker/store.rs

//! The worker's value store and the task that owns it.
//!
//! Only the store task touches the values. Every change is reported to the
//! coordinator before the caller is acknowledged, so a value is registered by
//! the time anyone learns it was computed.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::CoordinatorClient;
use crate::dag::task::{Key, Value};
use crate::errors::{DistError, Result};
use crate::protocol::Address;

/// Plain key/value storage.
#[derive(Debug, Default)]
pub struct ValueStore {
    values: BTreeMap<Key, Value>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values for the requested keys that are present; absent keys are
    /// skipped.
    pub fn get_many<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) -> BTreeMap<Key, Value> {
        keys.into_iter()
            .filter_map(|k| self.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub fn insert_many(&mut self, data: BTreeMap<Key, Value>) -> Vec<Key> {
        let keys: Vec<Key> = data.keys().cloned().collect();
        self.values.extend(data);
        keys
    }

    /// Remove keys; returns the ones that were actually present.
    pub fn remove_many<'a>(&mut self, keys: impl IntoIterator<Item = &'a Key>) -> Vec<Key> {
        keys.into_iter()
            .filter(|k| self.values.remove(*k).is_some())
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> BTreeSet<Key> {
        self.values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug)]
enum StoreCommand {
    Get {
        keys: Vec<Key>,
        reply: oneshot::Sender<BTreeMap<Key, Value>>,
    },
    Put {
        data: BTreeMap<Key, Value>,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        keys: Vec<Key>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable access to the store task.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

fn store_gone() -> DistError {
    DistError::Protocol("worker store has stopped".to_string())
}

impl StoreHandle {
    pub async fn get(&self, keys: Vec<Key>) -> Result<BTreeMap<Key, Value>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Get { keys, reply })
            .await
            .map_err(|_| store_gone())?;
        rx.await.map_err(|_| store_gone())
    }

    pub async fn put(&self, data: BTreeMap<Key, Value>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Put { data, reply })
            .await
            .map_err(|_| store_gone())?;
        rx.await.map_err(|_| store_gone())?
    }

    pub async fn delete(&self, keys: Vec<Key>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Delete { keys, reply })
            .await
            .map_err(|_| store_gone())?;
        rx.await.map_err(|_| store_gone())?
    }
}

/// Spawn the store task.
///
/// `coordinator` is the worker's registration connection; the task owns it.
/// Once every [`StoreHandle`] is dropped the task unregisters the worker and
/// closes the connection. `None` runs the store detached from any
/// coordinator.
pub fn spawn_store(
    address: Address,
    coordinator: Option<CoordinatorClient>,
) -> (StoreHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(run_store(address, ValueStore::new(), coordinator, rx));
    (StoreHandle { tx }, task)
}

async fn run_store(
    address: Address,
    mut store: ValueStore,
    mut coordinator: Option<CoordinatorClient>,
    mut rx: mpsc::Receiver<StoreCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            StoreCommand::Get { keys, reply } => {
                let _ = reply.send(store.get_many(keys.iter()));
            }
            StoreCommand::Put { data, reply } => {
                let keys = store.insert_many(data);
                debug!(worker = %address, keys = ?keys, "stored values");
                let result = match coordinator.as_mut() {
                    Some(client) => client.add_keys(&address, keys).await,
                    None => Ok(()),
                };
                if let Err(e) = &result {
                    error!(worker = %address, error = %e, "failed to register values with coordinator");
                }
                let _ = reply.send(result);
            }
            StoreCommand::Delete { keys, reply } => {
                let removed = store.remove_many(keys.iter());
                debug!(worker = %address, keys = ?removed, "deleted values");
                let result = match coordinator.as_mut() {
                    Some(client) if !removed.is_empty() => {
                        client.remove_keys(&address, removed).await
                    }
                    _ => Ok(()),
                };
                if let Err(e) = &result {
                    error!(worker = %address, error = %e, "failed to unregister values with coordinator");
                }
                let _ = reply.send(result);
            }
        }
    }
    if let Some(client) = coordinator.as_mut() {
        if let Err(e) = client.unregister(&address).await {
            warn!(worker = %address, error = %e, "could not unregister from coordinator");
        }
    }
    info!(worker = %address, values = store.len(), "worker store stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remove_reports_only_present_keys() {
        let mut store = ValueStore::new();
        store.insert_many([(Key::from("x"), json!(1))].into_iter().collect());
        let removed = store.remove_many([&Key::from("x"), &Key::from("y")]);
        assert_eq!(removed, vec![Key::from("x")]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn detached_store_round_trips_values() {
        let (handle, task) = spawn_store(Address::from("w:1"), None);
        handle
            .put([(Key::from("x"), json!(1))].into_iter().collect())
            .await
            .unwrap();
        let got = handle
            .get(vec![Key::from("x"), Key::from("missing")])
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[&Key::from("x")], json!(1));

        drop(handle);
        task.await.unwrap();
    }
}
