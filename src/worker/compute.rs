// src/worker/compute.rs

//! Executing one `compute` request.
//!
//! Inputs come from the local store or are fetched from the peers listed in
//! the request. The function itself runs on the blocking pool, at most
//! `ncores` at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::dag::task::{Key, TaskExpr, Value};
use crate::errors::{DistError, Result, TaskError};
use crate::functions::FunctionRegistry;
use crate::protocol::{Address, ComputeStatus};

use super::client::get_data;
use super::store::StoreHandle;

/// Everything a compute request needs from its worker.
#[derive(Debug, Clone)]
pub struct ComputeContext {
    pub address: Address,
    pub store: StoreHandle,
    pub functions: Arc<FunctionRegistry>,
    pub slots: Arc<Semaphore>,
}

impl ComputeContext {
    pub fn new(address: Address, store: StoreHandle, functions: Arc<FunctionRegistry>, ncores: usize) -> Self {
        Self {
            address,
            store,
            functions,
            slots: Arc::new(Semaphore::new(ncores.max(1))),
        }
    }
}

/// Compute `task`, store the value under `key` and report the outcome.
///
/// `Err` is reserved for failures of the worker itself (its store or
/// coordinator connection); task failures are `ComputeStatus::Error`.
pub async fn compute(
    ctx: &ComputeContext,
    key: Key,
    task: TaskExpr,
    who_has: BTreeMap<Key, Vec<Address>>,
) -> Result<ComputeStatus> {
    let references = task.references();
    let mut inputs = ctx.store.get(references.iter().cloned().collect()).await?;

    let wanted: BTreeSet<Key> = references
        .into_iter()
        .filter(|k| !inputs.contains_key(k))
        .collect();
    if !wanted.is_empty() {
        let gathered = fetch_dependencies(&ctx.address, wanted, &who_has).await?;
        if !gathered.missing.is_empty() {
            warn!(
                key = %key,
                missing = ?gathered.missing,
                unreachable = ?gathered.unreachable,
                "could not gather dependencies"
            );
            return Ok(ComputeStatus::MissingData {
                missing: gathered.missing,
                unreachable: gathered.unreachable.into_iter().collect(),
            });
        }
        inputs.extend(gathered.fetched);
    }

    let permit = ctx
        .slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| DistError::Other(e.into()))?;
    let functions = Arc::clone(&ctx.functions);

    debug!(key = %key, worker = %ctx.address, "computing");
    // The permit travels with the closure: an abandoned request keeps its
    // slot until the function actually returns.
    let outcome = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        task.evaluate(&inputs, &functions)
    })
    .await
    .unwrap_or_else(|join_err| {
        Err(TaskError::new(
            "RuntimeError",
            format!("task panicked: {join_err}"),
        ))
    });

    match outcome {
        Ok(value) => {
            ctx.store.put([(key.clone(), value)].into_iter().collect()).await?;
            debug!(key = %key, worker = %ctx.address, "computed");
            Ok(ComputeStatus::Success)
        }
        Err(err) => {
            debug!(key = %key, worker = %ctx.address, error = %err, "task raised");
            Ok(err.into())
        }
    }
}

/// Result of [`fetch_dependencies`].
#[derive(Debug, Default)]
struct Gathered {
    fetched: BTreeMap<Key, Value>,
    /// For keys no holder could serve, every `(key, holder)` pair tried.
    missing: Vec<(Key, Address)>,
    /// Holders that could not be contacted.
    unreachable: BTreeSet<Address>,
}

/// Fetch `wanted` from peers, trying the listed holders of each key in order.
///
/// A holder that answers without the key is only missing that key; a holder
/// whose connection fails is unreachable for every key. Keys without any
/// listed holder are left to the evaluator, which reports them as `KeyError`.
async fn fetch_dependencies(
    own: &Address,
    wanted: BTreeSet<Key>,
    who_has: &BTreeMap<Key, Vec<Address>>,
) -> Result<Gathered> {
    let mut fetched = BTreeMap::new();
    let mut failed: BTreeMap<Key, Vec<Address>> = BTreeMap::new();
    let mut dead: BTreeSet<Address> = BTreeSet::new();
    let mut remaining = wanted;

    loop {
        // Next untried holder for every remaining key, batched per peer.
        let mut batches: BTreeMap<Address, Vec<Key>> = BTreeMap::new();
        for key in &remaining {
            let tried = failed.get(key);
            let next = who_has.get(key).and_then(|holders| {
                holders.iter().find(|h| {
                    *h != own && !dead.contains(*h) && !tried.is_some_and(|t| t.contains(*h))
                })
            });
            if let Some(peer) = next {
                batches.entry(peer.clone()).or_default().push(key.clone());
            }
        }
        if batches.is_empty() {
            break;
        }

        for (peer, keys) in batches {
            match get_data(&peer, keys.clone()).await {
                Ok(data) => {
                    for key in keys {
                        match data.get(&key) {
                            Some(value) => {
                                remaining.remove(&key);
                                fetched.insert(key, value.clone());
                            }
                            None => failed.entry(key).or_default().push(peer.clone()),
                        }
                    }
                }
                Err(e) if e.is_connection_loss() => {
                    warn!(peer = %peer, error = %e, "peer unreachable while gathering dependencies");
                    dead.insert(peer.clone());
                    for key in keys {
                        failed.entry(key).or_default().push(peer.clone());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    let missing = remaining
        .into_iter()
        .flat_map(|key| {
            let mut peers = failed.remove(&key).unwrap_or_default();
            // Peers found dead while serving other keys also count.
            if let Some(holders) = who_has.get(&key) {
                peers.extend(holders.iter().filter(|h| dead.contains(*h)).cloned());
            }
            peers.sort();
            peers.dedup();
            peers.into_iter().map(move |p| (key.clone(), p))
        })
        .collect();

    Ok(Gathered {
        fetched,
        missing,
        unreachable: dead,
    })
}
