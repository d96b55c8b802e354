//! Drive the scheduling runtime against in-process workers.
//!
//! `SimulatedBackend` evaluates every dispatched assignment on the spot and
//! reports the outcome through the runtime's event channel, so a whole
//! request runs without sockets. It can also kill a worker after a given
//! number of dispatches to exercise recovery.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use distdag::dag::{Key, KeySpec, Nested, TaskGraph, Value};
use distdag::errors::{DistError, Result};
use distdag::functions::FunctionRegistry;
use distdag::gather::{gather_from_registry, DataFetcher, FetchFuture};
use distdag::protocol::Address;
use distdag::registry::Registry;
use distdag::scheduler::{
    Assignment, BackendFuture, EventSender, SchedulerCore, SchedulerEvent, SchedulerOptions,
    SchedulerRuntime, TaskOutcome, WorkerBackend,
};
use tokio::sync::mpsc;

/// Value stores of every simulated worker.
#[derive(Debug, Clone, Default)]
pub struct SimulatedStores(Arc<Mutex<BTreeMap<Address, BTreeMap<Key, Value>>>>);

impl SimulatedStores {
    pub fn insert(&self, worker: &Address, key: Key, value: Value) {
        self.0
            .lock()
            .unwrap()
            .entry(worker.clone())
            .or_default()
            .insert(key, value);
    }

    pub fn get(&self, worker: &Address, key: &Key) -> Option<Value> {
        self.0.lock().unwrap().get(worker)?.get(key).cloned()
    }

    pub fn remove(&self, worker: &Address, keys: &[Key]) {
        if let Some(store) = self.0.lock().unwrap().get_mut(worker) {
            for key in keys {
                store.remove(key);
            }
        }
    }

    pub fn wipe(&self, worker: &Address) {
        self.0.lock().unwrap().remove(worker);
    }

    /// Every key held by any worker.
    pub fn keys(&self) -> BTreeSet<Key> {
        self.0
            .lock()
            .unwrap()
            .values()
            .flat_map(|store| store.keys().cloned())
            .collect()
    }
}

impl DataFetcher for SimulatedStores {
    fn fetch<'a>(&'a self, worker: &'a Address, keys: Vec<Key>) -> FetchFuture<'a> {
        Box::pin(async move {
            Ok(keys
                .into_iter()
                .filter_map(|k| self.get(worker, &k).map(|v| (k, v)))
                .collect())
        })
    }
}

/// `worker` dies when the `after`-th dispatch (counting from 1) arrives.
#[derive(Debug, Clone)]
pub struct KillPlan {
    pub worker: Address,
    pub after: usize,
}

pub struct SimulatedBackend {
    events: EventSender,
    functions: Arc<FunctionRegistry>,
    stores: SimulatedStores,
    connected: BTreeSet<Address>,
    dead: BTreeSet<Address>,
    dispatched: Arc<Mutex<Vec<(Address, Key)>>>,
    kill: Option<KillPlan>,
}

impl SimulatedBackend {
    pub fn new(events: EventSender, functions: Arc<FunctionRegistry>, stores: SimulatedStores) -> Self {
        Self {
            events,
            functions,
            stores,
            connected: BTreeSet::new(),
            dead: BTreeSet::new(),
            dispatched: Arc::new(Mutex::new(Vec::new())),
            kill: None,
        }
    }

    pub fn with_kill(mut self, plan: KillPlan) -> Self {
        self.kill = Some(plan);
        self
    }

    /// Shared log of every `(worker, key)` dispatched so far.
    pub fn dispatched(&self) -> Arc<Mutex<Vec<(Address, Key)>>> {
        Arc::clone(&self.dispatched)
    }

    fn send(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    fn run(&self, assignment: &Assignment) -> TaskOutcome {
        let mut inputs = BTreeMap::new();
        let mut missing = Vec::new();
        let mut unreachable = BTreeSet::new();
        for (dep, holders) in &assignment.who_has {
            match holders.iter().find_map(|h| self.stores.get(h, dep)) {
                Some(value) => {
                    inputs.insert(dep.clone(), value);
                }
                None => {
                    missing.extend(holders.iter().map(|h| (dep.clone(), h.clone())));
                    unreachable.extend(holders.iter().filter(|h| self.dead.contains(*h)).cloned());
                }
            }
        }
        if !missing.is_empty() {
            return TaskOutcome::MissingData {
                missing,
                unreachable: unreachable.into_iter().collect(),
            };
        }
        match assignment.task.evaluate(&inputs, &self.functions) {
            Ok(value) => {
                self.stores
                    .insert(&assignment.worker, assignment.key.clone(), value);
                TaskOutcome::Success
            }
            Err(err) => TaskOutcome::Failed(err),
        }
    }
}

impl WorkerBackend for SimulatedBackend {
    fn connect_worker(&mut self, worker: Address, _ncores: usize) -> BackendFuture<'_> {
        if !self.dead.contains(&worker) {
            self.connected.insert(worker);
        }
        Box::pin(async { Ok(()) })
    }

    fn disconnect_worker(&mut self, worker: &Address) -> BackendFuture<'_> {
        self.connected.remove(worker);
        Box::pin(async { Ok(()) })
    }

    fn dispatch(&mut self, assignment: Assignment) -> BackendFuture<'_> {
        let worker = assignment.worker.clone();
        if !self.connected.contains(&worker) {
            self.send(SchedulerEvent::WorkerLost { worker });
            return Box::pin(async { Ok(()) });
        }

        let count = {
            let mut log = self.dispatched.lock().unwrap();
            log.push((worker.clone(), assignment.key.clone()));
            log.len()
        };

        // The planned victim dies as this assignment arrives, before it runs.
        if let Some(plan) = self.kill.take_if(|p| p.after == count) {
            self.stores.wipe(&plan.worker);
            self.connected.remove(&plan.worker);
            self.dead.insert(plan.worker.clone());
            self.send(SchedulerEvent::WorkerLost {
                worker: plan.worker,
            });
        }
        if !self.connected.contains(&worker) {
            return Box::pin(async { Ok(()) });
        }

        let outcome = self.run(&assignment);
        self.send(SchedulerEvent::TaskFinished {
            key: assignment.key,
            worker,
            outcome,
        });
        Box::pin(async { Ok(()) })
    }

    fn delete_data(&mut self, worker: Address, keys: Vec<Key>) -> BackendFuture<'_> {
        self.stores.remove(&worker, &keys);
        Box::pin(async { Ok(()) })
    }
}

/// Outcome of [`simulate`].
#[derive(Debug)]
pub struct SimulatedRun {
    pub values: Nested<Value>,
    pub stores: SimulatedStores,
    pub dispatched: Vec<(Address, Key)>,
}

/// Workers `w0:1`, `w1:1`, ... with the given core counts.
pub fn simulated_workers(ncores: &[usize]) -> Vec<(Address, usize)> {
    ncores
        .iter()
        .enumerate()
        .map(|(i, &n)| (Address::from(format!("w{i}:1")), n))
        .collect()
}

/// Run `request` on simulated workers and gather the values.
///
/// `preloaded` values are placed on the given workers before the request
/// starts, as if an earlier request had left them there.
pub async fn simulate(
    graph: &TaskGraph,
    request: &KeySpec,
    workers: &[(Address, usize)],
    options: &SchedulerOptions,
    preloaded: &[(Address, Key, Value)],
    kill: Option<KillPlan>,
) -> Result<SimulatedRun> {
    let stores = SimulatedStores::default();
    let mut registry = Registry::new();
    for (worker, ncores) in workers {
        registry.add_worker(worker.clone(), *ncores);
    }
    for (worker, key, value) in preloaded {
        stores.insert(worker, key.clone(), value.clone());
        registry.add_keys(worker, [key.clone()])?;
    }

    let core = SchedulerCore::new(graph, request.clone(), registry, options)?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut backend = SimulatedBackend::new(
        events_tx,
        Arc::new(FunctionRegistry::with_builtins()),
        stores.clone(),
    );
    if let Some(plan) = kill {
        backend = backend.with_kill(plan);
    }
    let dispatched = backend.dispatched();

    let core = SchedulerRuntime::new(core, events_rx, backend).run().await?;
    let values = gather_from_registry(core.registry(), request, &stores).await?;
    let dispatched = dispatched
        .lock()
        .map_err(|_| DistError::Protocol("dispatch log poisoned".to_string()))?
        .clone();
    Ok(SimulatedRun {
        values,
        stores,
        dispatched,
    })
}
