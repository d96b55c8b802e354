// src/dag/state.rs

//! Scheduler state: the status partition of every key of one request, and
//! the `heal` reconciliation that rebuilds it from a possibly stale snapshot.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::dag::graph::DependencyIndex;
use crate::dag::task::Key;
use crate::protocol::Address;

/// Per-worker LIFO stacks of assigned-but-not-started keys.
pub type Stacks = BTreeMap<Address, Vec<Key>>;

/// Per-worker sets of keys currently executing.
pub type Processing = BTreeMap<Address, BTreeSet<Key>>;

/// Where a key currently sits in the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStatus {
    /// Waiting on the listed dependencies.
    Waiting(BTreeSet<Key>),
    /// All dependencies in memory, not yet placed.
    Ready,
    Stacked(Address),
    Processing(Address),
    InMemory,
    Released,
    /// Not a key of this graph.
    Unknown,
}

/// Status partition of every key of a request.
///
/// Every key is in exactly one of `waiting` (ready keys have an empty set),
/// `stacks`, `processing`, `in_memory` or `released`. `validate` checks this
/// and the related arithmetic rules.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchedulerState {
    pub dependencies: BTreeMap<Key, BTreeSet<Key>>,
    pub dependents: BTreeMap<Key, BTreeSet<Key>>,
    /// Graph sinks plus requested keys: values that must outlive the request.
    pub outputs: BTreeSet<Key>,
    pub in_memory: BTreeSet<Key>,
    pub stacks: Stacks,
    pub processing: Processing,
    pub waiting: BTreeMap<Key, BTreeSet<Key>>,
    pub waiting_data: BTreeMap<Key, BTreeSet<Key>>,
    pub released: BTreeSet<Key>,
    pub finished_results: BTreeSet<Key>,
}

/// Rebuild a consistent state from `in_memory` (trusted) and `stacks` /
/// `processing` (advisory).
///
/// `requested` keys are kept alive in addition to the graph's sinks. Keys of
/// the snapshot that the graph does not know are dropped.
pub fn heal(
    index: &DependencyIndex,
    requested: &BTreeSet<Key>,
    in_memory: BTreeSet<Key>,
    stacks: Stacks,
    processing: Processing,
) -> SchedulerState {
    let in_memory: BTreeSet<Key> = in_memory
        .into_iter()
        .filter(|k| index.contains(k))
        .collect();

    let mut outputs = index.sinks();
    outputs.extend(requested.iter().filter(|k| index.contains(k)).cloned());

    // Walk up from the outputs, stopping at values already in memory.
    // Whatever the walk never reaches is not needed by anyone.
    let mut accessible: BTreeSet<Key> = BTreeSet::new();
    let mut waiting: BTreeMap<Key, BTreeSet<Key>> = BTreeMap::new();
    let mut worklist: Vec<Key> = outputs.iter().cloned().collect();

    while let Some(key) = worklist.pop() {
        if !accessible.insert(key.clone()) {
            continue;
        }
        if in_memory.contains(&key) {
            continue;
        }
        let deps = index.dependencies_of(&key);
        waiting.insert(key.clone(), deps.difference(&in_memory).cloned().collect());
        worklist.extend(deps.iter().cloned());
    }

    // Values in memory are never released, even when nothing needs them.
    let released: BTreeSet<Key> = index
        .keys()
        .filter(|k| !accessible.contains(*k) && !in_memory.contains(*k))
        .cloned()
        .collect();

    let waiting_data: BTreeMap<Key, BTreeSet<Key>> = accessible
        .iter()
        .map(|key| {
            let pending = index
                .dependents_of(key)
                .iter()
                .filter(|d| !released.contains(*d) && !in_memory.contains(*d))
                .cloned()
                .collect();
            (key.clone(), pending)
        })
        .collect();

    // An assignment is only trusted if its inputs are actually available.
    let runnable = |key: &Key| {
        accessible.contains(key)
            && !in_memory.contains(key)
            && index.dependencies_of(key).is_subset(&in_memory)
    };

    let mut placed: BTreeSet<Key> = BTreeSet::new();

    let mut kept_processing = Processing::new();
    for (worker, keys) in processing {
        let entry = kept_processing.entry(worker.clone()).or_default();
        for key in keys {
            if runnable(&key) && placed.insert(key.clone()) {
                entry.insert(key);
            } else {
                debug!(key = %key, worker = %worker, "heal: dropping processing entry");
            }
        }
    }

    let mut kept_stacks = Stacks::new();
    for (worker, keys) in stacks {
        let entry = kept_stacks.entry(worker.clone()).or_default();
        for key in keys {
            if runnable(&key) && placed.insert(key.clone()) {
                entry.push(key);
            } else {
                debug!(key = %key, worker = %worker, "heal: dropping stacked entry");
            }
        }
    }

    for key in &placed {
        waiting.remove(key);
    }

    let finished_results = outputs.intersection(&in_memory).cloned().collect();

    SchedulerState {
        dependencies: index.dependencies(),
        dependents: index.dependents(),
        outputs,
        in_memory,
        stacks: kept_stacks,
        processing: kept_processing,
        waiting,
        waiting_data,
        released,
        finished_results,
    }
}

impl SchedulerState {
    /// `heal` from empty placement: the state at the start of a request.
    pub fn initial(
        index: &DependencyIndex,
        requested: &BTreeSet<Key>,
        in_memory: BTreeSet<Key>,
    ) -> Self {
        heal(index, requested, in_memory, Stacks::new(), Processing::new())
    }

    /// Re-run `heal` on this state's own snapshot.
    pub fn reheal(&self, index: &DependencyIndex) -> Self {
        heal(
            index,
            &self.outputs,
            self.in_memory.clone(),
            self.stacks.clone(),
            self.processing.clone(),
        )
    }

    /// Keys that can run now but are not placed anywhere.
    pub fn ready_keys(&self) -> BTreeSet<Key> {
        self.waiting
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn is_ready(&self, key: &Key) -> bool {
        self.waiting.get(key).is_some_and(|deps| deps.is_empty())
    }

    pub fn status_of(&self, key: &Key) -> KeyStatus {
        if self.in_memory.contains(key) {
            return KeyStatus::InMemory;
        }
        if self.released.contains(key) {
            return KeyStatus::Released;
        }
        if let Some(deps) = self.waiting.get(key) {
            return if deps.is_empty() {
                KeyStatus::Ready
            } else {
                KeyStatus::Waiting(deps.clone())
            };
        }
        if let Some(worker) = self.worker_processing(key) {
            return KeyStatus::Processing(worker.clone());
        }
        if let Some(worker) = self.worker_stacking(key) {
            return KeyStatus::Stacked(worker.clone());
        }
        KeyStatus::Unknown
    }

    pub fn worker_processing(&self, key: &Key) -> Option<&Address> {
        self.processing
            .iter()
            .find(|(_, keys)| keys.contains(key))
            .map(|(w, _)| w)
    }

    pub fn worker_stacking(&self, key: &Key) -> Option<&Address> {
        self.stacks
            .iter()
            .find(|(_, keys)| keys.contains(key))
            .map(|(w, _)| w)
    }

    /// Number of keys assigned to `worker` (stacked or running).
    pub fn load_of(&self, worker: &Address) -> usize {
        self.stacks.get(worker).map_or(0, Vec::len)
            + self.processing.get(worker).map_or(0, BTreeSet::len)
    }

    pub fn running_on(&self, worker: &Address) -> usize {
        self.processing.get(worker).map_or(0, BTreeSet::len)
    }

    /// Whether every key of `keys` has been reported finished.
    pub fn is_finished(&self, keys: &BTreeSet<Key>) -> bool {
        keys.is_subset(&self.finished_results)
    }

    /// Whether anything is still stacked or running.
    pub fn has_assigned_work(&self) -> bool {
        self.stacks.values().any(|s| !s.is_empty())
            || self.processing.values().any(|p| !p.is_empty())
    }

    /// Push a ready key onto `worker`'s stack.
    pub fn stack(&mut self, worker: &Address, key: Key) {
        self.waiting.remove(&key);
        self.stacks.entry(worker.clone()).or_default().push(key);
    }

    /// Pop the most recently stacked key of `worker`.
    pub fn pop_stack(&mut self, worker: &Address) -> Option<Key> {
        self.stacks.get_mut(worker).and_then(Vec::pop)
    }

    /// Mark a ready (or just popped) key as running on `worker`.
    pub fn start_processing(&mut self, worker: &Address, key: Key) {
        self.waiting.remove(&key);
        self.processing.entry(worker.clone()).or_default().insert(key);
    }

    /// Drop a key from `worker`'s processing set; returns whether it was there.
    pub fn stop_processing(&mut self, worker: &Address, key: &Key) -> bool {
        self.processing
            .get_mut(worker)
            .is_some_and(|keys| keys.remove(key))
    }

    /// Record a computed value.
    ///
    /// Returns the dependents that became ready. The key is removed from any
    /// stack, processing set or waiting entry it still occupied.
    pub fn mark_in_memory(&mut self, key: &Key) -> Vec<Key> {
        for keys in self.processing.values_mut() {
            keys.remove(key);
        }
        for keys in self.stacks.values_mut() {
            keys.retain(|k| k != key);
        }
        self.waiting.remove(key);
        self.released.remove(key);
        self.in_memory.insert(key.clone());

        if self.outputs.contains(key) {
            self.finished_results.insert(key.clone());
        }

        let dependents = self.dependents.get(key).cloned().unwrap_or_default();
        let pending: BTreeSet<Key> = dependents
            .iter()
            .filter(|d| !self.released.contains(*d) && !self.in_memory.contains(*d))
            .cloned()
            .collect();
        self.waiting_data.insert(key.clone(), pending);

        let mut newly_ready = Vec::new();
        for dependent in dependents {
            if let Some(deps) = self.waiting.get_mut(&dependent) {
                if deps.remove(key) && deps.is_empty() {
                    newly_ready.push(dependent);
                }
            }
        }

        if let Some(deps) = self.dependencies.get(key) {
            for dep in deps {
                if let Some(pending) = self.waiting_data.get_mut(dep) {
                    pending.remove(key);
                }
            }
        }

        newly_ready
    }

    /// In-memory dependencies of `key` that nothing pending needs any more
    /// and that are not outputs.
    pub fn releasable_dependencies(&self, key: &Key) -> Vec<Key> {
        self.dependencies
            .get(key)
            .into_iter()
            .flatten()
            .filter(|dep| {
                self.in_memory.contains(*dep)
                    && !self.outputs.contains(*dep)
                    && self.waiting_data.get(*dep).is_none_or(BTreeSet::is_empty)
            })
            .cloned()
            .collect()
    }

    /// Move an in-memory key to `released` after its value was deleted.
    pub fn release(&mut self, key: &Key) {
        if self.in_memory.remove(key) {
            self.waiting_data.remove(key);
            self.released.insert(key.clone());
        }
    }

    /// Forget everything assigned to `worker`; returns the keys it had.
    pub fn remove_worker(&mut self, worker: &Address) -> Vec<Key> {
        let mut keys: Vec<Key> = self.stacks.remove(worker).unwrap_or_default();
        keys.extend(self.processing.remove(worker).unwrap_or_default());
        keys
    }

    /// Drop keys whose values are gone; `reheal` restores consistency.
    pub fn forget(&mut self, keys: &[Key]) {
        for key in keys {
            self.in_memory.remove(key);
            self.finished_results.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(s: &str) -> Key {
        Key::from(s)
    }

    fn set(keys: &[&str]) -> BTreeSet<Key> {
        keys.iter().map(|s| Key::from(*s)).collect()
    }

    fn deps(pairs: &[(&str, &[&str])]) -> DependencyIndex {
        let map = pairs
            .iter()
            .map(|(key, ds)| (k(key), set(ds)))
            .collect::<BTreeMap<_, _>>();
        DependencyIndex::from_dependencies(&map).unwrap()
    }

    #[test]
    fn completion_unlocks_dependents_and_tracks_waiting_data() {
        let index = deps(&[("x", &[]), ("y", &["x"]), ("z", &["x", "y"])]);
        let mut state = SchedulerState::initial(&index, &BTreeSet::new(), BTreeSet::new());
        assert_eq!(state.ready_keys(), set(&["x"]));

        let w = Address::from("alice");
        state.start_processing(&w, k("x"));
        assert_eq!(state.status_of(&k("x")), KeyStatus::Processing(w.clone()));

        let ready = state.mark_in_memory(&k("x"));
        assert_eq!(ready, vec![k("y")]);
        assert_eq!(state.waiting[&k("z")], set(&["y"]));
        assert_eq!(state.waiting_data[&k("x")], set(&["y", "z"]));
        assert!(state.releasable_dependencies(&k("y")).is_empty());

        state.start_processing(&w, k("y"));
        assert_eq!(state.mark_in_memory(&k("y")), vec![k("z")]);
        assert_eq!(state.waiting_data[&k("x")], set(&["z"]));

        state.start_processing(&w, k("z"));
        state.mark_in_memory(&k("z"));
        assert_eq!(state.releasable_dependencies(&k("z")), vec![k("x"), k("y")]);
        assert_eq!(state.finished_results, set(&["z"]));

        state.release(&k("x"));
        assert_eq!(state.status_of(&k("x")), KeyStatus::Released);
    }

    #[test]
    fn stack_is_lifo() {
        let index = deps(&[("a", &[]), ("b", &[])]);
        let mut state = SchedulerState::initial(&index, &BTreeSet::new(), BTreeSet::new());
        let w = Address::from("alice");
        state.stack(&w, k("a"));
        state.stack(&w, k("b"));
        assert_eq!(state.load_of(&w), 2);
        assert_eq!(state.pop_stack(&w), Some(k("b")));
        assert_eq!(state.pop_stack(&w), Some(k("a")));
        assert_eq!(state.pop_stack(&w), None);
    }

    #[test]
    fn unknown_snapshot_keys_are_dropped() {
        let index = deps(&[("x", &[]), ("y", &["x"])]);
        let state = SchedulerState::initial(&index, &BTreeSet::new(), set(&["x", "ghost"]));
        assert_eq!(state.in_memory, set(&["x"]));
        assert_eq!(state.status_of(&k("ghost")), KeyStatus::Unknown);
    }

    #[test]
    fn unneeded_values_in_memory_stay_in_memory() {
        let index = deps(&[("x", &[]), ("y", &["x"]), ("z", &["y"])]);
        let state = SchedulerState::initial(&index, &BTreeSet::new(), set(&["x", "y"]));
        assert_eq!(state.in_memory, set(&["x", "y"]));
        assert!(state.released.is_empty());
        assert_eq!(state.ready_keys(), set(&["z"]));
        state.validate().unwrap();
    }
}
