// src/scheduler/core.rs

//! Pure scheduling core.
//!
//! `SchedulerCore` owns everything one request needs (the culled graph, its
//! dependency index, the [`SchedulerState`], a request-local [`Registry`] and
//! the placement policy), consumes [`SchedulerEvent`]s and returns
//! [`SchedulerCommand`]s for the IO shell. It performs no IO and can be
//! driven step by step from tests.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::dag::graph::{cull, DependencyIndex};
use crate::dag::keys::{KeySpec, Nested};
use crate::dag::state::SchedulerState;
use crate::dag::task::{Key, TaskGraph};
use crate::errors::{DistError, Result, TaskError};
use crate::protocol::Address;
use crate::registry::Registry;

use super::events::{Assignment, SchedulerCommand, SchedulerEvent, SchedulerStep, TaskOutcome};
use super::placement::Placement;
use super::SchedulerOptions;

/// Location of a finished key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteData {
    pub key: Key,
    pub holders: Vec<Address>,
}

#[derive(Debug)]
pub struct SchedulerCore {
    graph: TaskGraph,
    index: DependencyIndex,
    request: KeySpec,
    requested: BTreeSet<Key>,
    state: SchedulerState,
    registry: Registry,
    placement: Placement,
    validate: bool,
    /// Ready keys in the order they became ready; used as a stack.
    ready: Vec<Key>,
    /// Keys whose values this request produced. Only these are ever deleted.
    computed_here: BTreeSet<Key>,
}

impl SchedulerCore {
    /// Cull `graph` to what `request` needs and heal an initial state from
    /// the values `registry` already knows about.
    pub fn new(
        graph: &TaskGraph,
        request: KeySpec,
        registry: Registry,
        options: &SchedulerOptions,
    ) -> Result<Self> {
        let requested = request.key_set();
        let culled = cull(graph, &requested)?;
        let index = DependencyIndex::from_graph(&culled)?;
        let state = SchedulerState::initial(&index, &requested, registry.keys_in_memory());
        let ready = state.ready_keys().into_iter().collect();

        info!(
            keys = index.len(),
            requested = requested.len(),
            workers = registry.ncores().len(),
            strategy = %options.strategy,
            "scheduling request"
        );

        Ok(Self {
            graph: culled,
            index,
            request,
            requested,
            state,
            registry,
            placement: Placement::new(options.strategy, options.locality_tie_break),
            validate: options.validate,
            ready,
            computed_here: BTreeSet::new(),
        })
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished(&self.requested)
    }

    /// Connect the known workers and hand out the first keys.
    pub fn start(&mut self) -> Result<SchedulerStep> {
        if self.is_finished() {
            info!("every requested key is already in memory");
            return Ok(SchedulerStep {
                commands: Vec::new(),
                keep_running: false,
            });
        }
        if self.registry.is_empty() {
            return Err(DistError::NoWorkers);
        }

        let mut commands: Vec<SchedulerCommand> = self
            .registry
            .ncores()
            .iter()
            .map(|(worker, &ncores)| SchedulerCommand::ConnectWorker {
                worker: worker.clone(),
                ncores,
            })
            .collect();
        self.finish_step(&mut commands)?;
        Ok(SchedulerStep {
            commands,
            keep_running: !self.is_finished(),
        })
    }

    /// Handle one event.
    ///
    /// `Err` ends the request: a task failed, every worker is gone, or (with
    /// validation on) an invariant broke.
    pub fn step(&mut self, event: SchedulerEvent) -> Result<SchedulerStep> {
        let mut commands = Vec::new();
        match event {
            SchedulerEvent::TaskFinished {
                key,
                worker,
                outcome,
            } => match outcome {
                TaskOutcome::Success => self.on_success(key, worker, &mut commands)?,
                TaskOutcome::Failed(err) => self.on_failure(key, worker, err)?,
                TaskOutcome::MissingData {
                    missing,
                    unreachable,
                } => self.on_missing_data(key, worker, missing, unreachable, &mut commands)?,
            },
            SchedulerEvent::WorkerJoined { worker, ncores } => {
                self.on_worker_joined(worker, ncores, &mut commands)
            }
            SchedulerEvent::WorkerLost { worker } => self.on_worker_lost(worker, &mut commands)?,
        }

        if !self.is_finished() {
            self.finish_step(&mut commands)?;
        }
        Ok(SchedulerStep {
            commands,
            keep_running: !self.is_finished(),
        })
    }

    fn on_success(
        &mut self,
        key: Key,
        worker: Address,
        commands: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        if !self.registry.contains_worker(&worker) {
            warn!(key = %key, worker = %worker, "ignoring completion from lost worker");
            return Ok(());
        }
        self.registry.add_keys(&worker, [key.clone()])?;
        self.computed_here.insert(key.clone());
        let was_processing = self.state.stop_processing(&worker, &key);

        if self.state.in_memory.contains(&key) {
            debug!(key = %key, worker = %worker, "duplicate completion");
            return Ok(());
        }
        if self.state.released.contains(&key) || !self.index.contains(&key) {
            debug!(key = %key, worker = %worker, "completion for a key nobody needs");
            self.delete_everywhere(&key, commands);
            return Ok(());
        }

        debug!(key = %key, worker = %worker, "key in memory");
        let newly_ready = self.state.mark_in_memory(&key);
        if was_processing {
            self.ready.extend(newly_ready);
        } else {
            warn!(key = %key, worker = %worker, "late completion; rehealing");
            self.reheal();
        }

        self.release_dependencies(&key, commands);
        Ok(())
    }

    fn on_failure(&mut self, key: Key, worker: Address, err: TaskError) -> Result<()> {
        if !self.registry.contains_worker(&worker) {
            warn!(key = %key, worker = %worker, "ignoring failure from lost worker");
            return Ok(());
        }
        if self.state.released.contains(&key) {
            debug!(key = %key, "ignoring failure of a key nobody needs");
            self.state.stop_processing(&worker, &key);
            return Ok(());
        }
        error!(key = %key, worker = %worker, error = %err, "task failed");
        Err(err.into_dist_error(key))
    }

    fn on_missing_data(
        &mut self,
        key: Key,
        worker: Address,
        missing: Vec<(Key, Address)>,
        unreachable: Vec<Address>,
        commands: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        if !self.registry.contains_worker(&worker) {
            return Ok(());
        }
        self.state.stop_processing(&worker, &key);
        warn!(
            key = %key,
            worker = %worker,
            missing = ?missing,
            unreachable = ?unreachable,
            "dependencies could not be gathered"
        );

        for peer in &unreachable {
            self.lose_worker(peer, commands);
        }
        // A peer that answered without the value only lost that one copy.
        let mut gone = Vec::new();
        for (dep, peer) in missing {
            if unreachable.contains(&peer) || !self.registry.contains_worker(&peer) {
                continue;
            }
            self.registry.remove_keys(&peer, [&dep]);
            if self.registry.holders(&dep).is_empty() {
                gone.push(dep);
            }
        }
        self.state.forget(&gone);

        self.reheal();
        self.ensure_workers_left()
    }

    fn on_worker_joined(
        &mut self,
        worker: Address,
        ncores: usize,
        commands: &mut Vec<SchedulerCommand>,
    ) {
        if self.registry.contains_worker(&worker) {
            return;
        }
        self.registry.add_worker(worker.clone(), ncores);
        commands.push(SchedulerCommand::ConnectWorker { worker, ncores });
    }

    fn on_worker_lost(
        &mut self,
        worker: Address,
        commands: &mut Vec<SchedulerCommand>,
    ) -> Result<()> {
        if !self.registry.contains_worker(&worker) {
            return Ok(());
        }
        self.lose_worker(&worker, commands);
        self.reheal();
        self.ensure_workers_left()
    }

    /// Forget a worker and whatever only it held. Callers reheal afterwards.
    fn lose_worker(&mut self, worker: &Address, commands: &mut Vec<SchedulerCommand>) {
        if !self.registry.contains_worker(worker) {
            return;
        }
        let lost = self.registry.remove_worker(worker);
        let unassigned = self.state.remove_worker(worker);
        self.state.forget(&lost);
        warn!(
            worker = %worker,
            lost = ?lost,
            unassigned = ?unassigned,
            "worker lost; recovering"
        );
        commands.push(SchedulerCommand::DisconnectWorker {
            worker: worker.clone(),
        });
    }

    fn ensure_workers_left(&self) -> Result<()> {
        if self.registry.is_empty() && !self.is_finished() {
            error!("no workers left with work outstanding");
            return Err(DistError::WorkerLost(
                "every worker was lost before the request finished".to_string(),
            ));
        }
        Ok(())
    }

    fn reheal(&mut self) {
        self.state = self.state.reheal(&self.index);
        self.ready = self.state.ready_keys().into_iter().collect();
    }

    /// Delete dependencies of `key` that this request computed and that no
    /// pending key or output needs any more.
    fn release_dependencies(&mut self, key: &Key, commands: &mut Vec<SchedulerCommand>) {
        for dep in self.state.releasable_dependencies(key) {
            if !self.computed_here.contains(&dep) {
                continue;
            }
            debug!(key = %dep, "releasing intermediate value");
            self.delete_everywhere(&dep, commands);
            self.state.release(&dep);
        }
    }

    fn delete_everywhere(&mut self, key: &Key, commands: &mut Vec<SchedulerCommand>) {
        for holder in self.registry.holders(key) {
            self.registry.remove_keys(&holder, [key]);
            commands.push(SchedulerCommand::DeleteData {
                worker: holder,
                keys: vec![key.clone()],
            });
        }
    }

    /// Assign what can run, then check the state if asked to.
    fn finish_step(&mut self, commands: &mut Vec<SchedulerCommand>) -> Result<()> {
        let started = self
            .placement
            .assign(&mut self.state, &self.registry, &mut self.ready);
        for (worker, key) in started {
            commands.push(SchedulerCommand::Dispatch(self.assignment(worker, key)?));
        }

        if self.validate {
            self.state.validate()?;
            if !self.registry.is_consistent() {
                return Err(DistError::InvariantViolation(
                    "registry who_has/has_what out of sync".to_string(),
                ));
            }
        }

        if !self.is_finished() && !self.state.has_assigned_work() && !self.registry.is_empty() {
            return Err(DistError::InvariantViolation(
                "scheduler stalled: nothing running, nothing ready, request unfinished"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn assignment(&self, worker: Address, key: Key) -> Result<Assignment> {
        let who_has: BTreeMap<Key, Vec<Address>> = self
            .index
            .dependencies_of(&key)
            .iter()
            .map(|dep| (dep.clone(), self.registry.holders(dep)))
            .collect();
        let task = self.graph.get(&key).cloned().ok_or_else(|| {
            DistError::InvariantViolation(format!("assigned key '{key}' is not in the graph"))
        })?;
        debug!(key = %key, worker = %worker, "dispatching");
        Ok(Assignment {
            worker,
            key,
            task,
            who_has,
        })
    }

    /// Commands to run once the request is over, however it ended.
    ///
    /// Every worker is disconnected first, abandoning in-flight work. Then
    /// the values this request computed are deleted: after success the
    /// requested keys survive, otherwise nothing does. Keys still processing
    /// are deleted too, since their value may have been stored before the
    /// connection closed.
    pub fn cleanup(&mut self, success: bool) -> Vec<SchedulerCommand> {
        let mut commands: Vec<SchedulerCommand> = self
            .registry
            .workers()
            .map(|worker| SchedulerCommand::DisconnectWorker {
                worker: worker.clone(),
            })
            .collect();

        let mut per_worker: BTreeMap<Address, BTreeSet<Key>> = BTreeMap::new();
        for (worker, keys) in std::mem::take(&mut self.state.processing) {
            if !keys.is_empty() {
                per_worker.entry(worker).or_default().extend(keys);
            }
        }
        let keys: Vec<Key> = self.computed_here.iter().cloned().collect();
        for key in keys {
            if success && self.requested.contains(&key) {
                continue;
            }
            for holder in self.registry.holders(&key) {
                self.registry.remove_keys(&holder, [&key]);
                per_worker.entry(holder).or_default().insert(key.clone());
            }
        }

        commands.extend(
            per_worker
                .into_iter()
                .map(|(worker, keys)| SchedulerCommand::DeleteData {
                    worker,
                    keys: keys.into_iter().collect(),
                }),
        );
        commands
    }

    /// Where each requested key lives, in the shape of the request.
    pub fn output(&self) -> Result<Nested<RemoteData>> {
        self.request.try_map(&mut |key| {
            let holders = self.registry.holders(key);
            if holders.is_empty() {
                return Err(DistError::KeyNotFound(key.clone()));
            }
            Ok(RemoteData {
                key: key.clone(),
                holders,
            })
        })
    }
}
