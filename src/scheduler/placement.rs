// src/scheduler/placement.rs

//! Where ready keys go.
//!
//! Both strategies only ever start a key on a worker with a free execution
//! slot (`processing < ncores`); they differ in how they pick the worker.

use std::cmp::Ordering;

use tracing::trace;

use crate::dag::state::SchedulerState;
use crate::dag::task::Key;
use crate::protocol::Address;
use crate::registry::Registry;
use crate::types::{LocalityTieBreak, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub strategy: Strategy,
    pub tie_break: LocalityTieBreak,
}

impl Placement {
    pub fn new(strategy: Strategy, tie_break: LocalityTieBreak) -> Self {
        Self {
            strategy,
            tie_break,
        }
    }

    /// Start as many ready keys as capacity allows.
    ///
    /// `ready` is used as a stack: the most recently readied key goes first.
    /// Stale entries (keys that are no longer ready) are skipped. Returns the
    /// `(worker, key)` pairs that moved to `processing`.
    pub fn assign(
        &self,
        state: &mut SchedulerState,
        registry: &Registry,
        ready: &mut Vec<Key>,
    ) -> Vec<(Address, Key)> {
        match self.strategy {
            Strategy::Centralized => assign_centralized(state, registry, ready),
            Strategy::Adaptive => assign_adaptive(state, registry, ready, self.tie_break),
        }
    }
}

fn has_free_slot(state: &SchedulerState, registry: &Registry, worker: &Address) -> bool {
    state.running_on(worker) < registry.ncores_of(worker)
}

/// Compare `a_load / a_cores` with `b_load / b_cores` without division.
fn cmp_ratio(a_load: usize, a_cores: usize, b_load: usize, b_cores: usize) -> Ordering {
    (a_load * b_cores.max(1)).cmp(&(b_load * a_cores.max(1)))
}

/// Every ready key onto the least loaded worker's stack, then every worker
/// pops its own stack while it has free slots.
fn assign_centralized(
    state: &mut SchedulerState,
    registry: &Registry,
    ready: &mut Vec<Key>,
) -> Vec<(Address, Key)> {
    while let Some(key) = ready.pop() {
        if !state.is_ready(&key) {
            continue;
        }
        let view = &*state;
        let target = registry
            .workers()
            .min_by(|a, b| {
                cmp_ratio(
                    view.load_of(a),
                    registry.ncores_of(a),
                    view.load_of(b),
                    registry.ncores_of(b),
                )
                .then_with(|| a.cmp(b))
            })
            .cloned();
        match target {
            Some(worker) => {
                trace!(key = %key, worker = %worker, "stacked");
                state.stack(&worker, key);
            }
            None => {
                ready.push(key);
                break;
            }
        }
    }

    let mut started = Vec::new();
    for worker in registry.workers() {
        while has_free_slot(state, registry, worker) {
            let Some(key) = state.pop_stack(worker) else {
                break;
            };
            state.start_processing(worker, key.clone());
            started.push((worker.clone(), key));
        }
    }
    started
}

/// One key at a time, to the free worker holding most of its inputs.
fn assign_adaptive(
    state: &mut SchedulerState,
    registry: &Registry,
    ready: &mut Vec<Key>,
    tie_break: LocalityTieBreak,
) -> Vec<(Address, Key)> {
    let mut started = Vec::new();
    while let Some(key) = ready.pop() {
        if !state.is_ready(&key) {
            continue;
        }
        let view = &*state;
        let deps = view.dependencies.get(&key).cloned().unwrap_or_default();
        let local = |w: &Address| deps.iter().filter(|d| registry.holds(w, d)).count();

        let target = registry
            .workers()
            .filter(|w| has_free_slot(view, registry, w))
            .min_by(|a, b| {
                let by_locality = local(b).cmp(&local(a));
                let by_load = match tie_break {
                    LocalityTieBreak::LeastLoaded => cmp_ratio(
                        view.running_on(a),
                        registry.ncores_of(a),
                        view.running_on(b),
                        registry.ncores_of(b),
                    ),
                    LocalityTieBreak::Address => Ordering::Equal,
                };
                by_locality.then(by_load).then_with(|| a.cmp(b))
            })
            .cloned();

        match target {
            Some(worker) => {
                trace!(key = %key, worker = %worker, "assigned");
                state.start_processing(&worker, key.clone());
                started.push((worker, key));
            }
            None => {
                // Every slot is busy; try again after the next completion.
                ready.push(key);
                break;
            }
        }
    }
    started
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::graph::DependencyIndex;
    use std::collections::{BTreeMap, BTreeSet};

    fn k(s: &str) -> Key {
        Key::from(s)
    }

    fn index(pairs: &[(&str, &[&str])]) -> DependencyIndex {
        let map: BTreeMap<Key, BTreeSet<Key>> = pairs
            .iter()
            .map(|(key, deps)| (k(key), deps.iter().map(|d| k(d)).collect()))
            .collect();
        DependencyIndex::from_dependencies(&map).unwrap()
    }

    fn registry(workers: &[(&str, usize)]) -> Registry {
        let mut r = Registry::new();
        for (w, n) in workers {
            r.add_worker(Address::from(*w), *n);
        }
        r
    }

    #[test]
    fn adaptive_prefers_the_worker_holding_the_inputs() {
        let idx = index(&[("x", &[]), ("y", &["x"])]);
        let mut reg = registry(&[("a:1", 1), ("b:1", 1)]);
        reg.add_keys(&Address::from("b:1"), [k("x")]).unwrap();
        let mut state = SchedulerState::initial(&idx, &BTreeSet::new(), [k("x")].into());
        let mut ready = vec![k("y")];

        let placement = Placement::new(Strategy::Adaptive, LocalityTieBreak::LeastLoaded);
        let started = placement.assign(&mut state, &reg, &mut ready);
        assert_eq!(started, vec![(Address::from("b:1"), k("y"))]);
    }

    #[test]
    fn adaptive_respects_core_counts() {
        let idx = index(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let reg = registry(&[("w:1", 2)]);
        let mut state = SchedulerState::initial(&idx, &BTreeSet::new(), BTreeSet::new());
        let mut ready = vec![k("a"), k("b"), k("c")];

        let placement = Placement::new(Strategy::Adaptive, LocalityTieBreak::Address);
        let started = placement.assign(&mut state, &reg, &mut ready);
        // Depth-first: most recently readied first.
        assert_eq!(
            started.iter().map(|(_, key)| key.clone()).collect::<Vec<_>>(),
            vec![k("c"), k("b")]
        );
        assert_eq!(ready, vec![k("a")]);
        assert!(state.is_ready(&k("a")));
    }

    #[test]
    fn centralized_spreads_by_core_count() {
        let idx = index(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let reg = registry(&[("big:1", 2), ("small:1", 1)]);
        let mut state = SchedulerState::initial(&idx, &BTreeSet::new(), BTreeSet::new());
        let mut ready = vec![k("a"), k("b"), k("c")];

        let placement = Placement::new(Strategy::Centralized, LocalityTieBreak::default());
        let started = placement.assign(&mut state, &reg, &mut ready);
        assert_eq!(started.len(), 3);
        assert_eq!(state.running_on(&Address::from("big:1")), 2);
        assert_eq!(state.running_on(&Address::from("small:1")), 1);
        assert!(ready.is_empty());
        state.validate().unwrap();
    }
}
