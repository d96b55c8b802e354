// src/dag/validate.rs

//! Invariant checker for [`SchedulerState`].
//!
//! Used as a production safety check by the scheduling loop (when enabled in
//! config) and as the oracle in tests. Never mutates the state.

use std::collections::BTreeSet;

use crate::dag::state::SchedulerState;
use crate::dag::task::Key;
use crate::errors::{DistError, Result};

fn violation(msg: String) -> DistError {
    DistError::InvariantViolation(msg)
}

/// Return the first invariant violation found, if any.
pub fn validate_state(state: &SchedulerState) -> Result<()> {
    let graph_keys: BTreeSet<&Key> = state.dependencies.keys().collect();

    let mut placed: BTreeSet<&Key> = BTreeSet::new();
    let mut in_processing: BTreeSet<&Key> = BTreeSet::new();
    for (worker, keys) in state.processing.iter() {
        for key in keys {
            if !placed.insert(key) {
                return Err(violation(format!(
                    "key '{key}' is assigned more than once (processing on {worker})"
                )));
            }
            in_processing.insert(key);
        }
    }
    let mut in_stacks: BTreeSet<&Key> = BTreeSet::new();
    for (worker, keys) in state.stacks.iter() {
        for key in keys {
            if !placed.insert(key) {
                return Err(violation(format!(
                    "key '{key}' is assigned more than once (stacked on {worker})"
                )));
            }
            in_stacks.insert(key);
        }
    }

    let mentioned = state
        .waiting
        .keys()
        .chain(state.in_memory.iter())
        .chain(state.released.iter())
        .chain(state.finished_results.iter())
        .chain(placed.iter().copied());
    for key in mentioned {
        if !graph_keys.contains(key) {
            return Err(violation(format!("key '{key}' is not part of the graph")));
        }
    }

    for key in graph_keys.iter().copied() {
        let memberships = [
            state.waiting.contains_key(key),
            in_stacks.contains(key),
            in_processing.contains(key),
            state.in_memory.contains(key),
            state.released.contains(key),
        ];
        let count = memberships.iter().filter(|m| **m).count();
        if count != 1 {
            return Err(violation(format!(
                "key '{key}' belongs to {count} of waiting/stacks/processing/in_memory/released \
                 (expected exactly one)"
            )));
        }

        let deps = state.dependencies.get(key).cloned().unwrap_or_default();

        if let Some(waiting) = state.waiting.get(key) {
            let unmet: BTreeSet<Key> = deps.difference(&state.in_memory).cloned().collect();
            if *waiting != unmet {
                return Err(violation(format!(
                    "waiting['{key}'] = {waiting:?} but its unmet dependencies are {unmet:?}"
                )));
            }
        }

        if state.in_memory.contains(key) {
            let dependents = state.dependents.get(key).cloned().unwrap_or_default();
            if let Some(d) = dependents
                .iter()
                .find(|d| state.waiting.get(*d).is_some_and(|w| w.contains(key)))
            {
                return Err(violation(format!(
                    "key '{key}' is in memory but '{d}' is still waiting on it"
                )));
            }
        }

        if in_stacks.contains(key) || in_processing.contains(key) {
            if let Some(missing) = deps.iter().find(|d| !state.in_memory.contains(*d)) {
                return Err(violation(format!(
                    "key '{key}' is assigned but its dependency '{missing}' is not in memory"
                )));
            }
        }

        if state.finished_results.contains(key) {
            if !state.in_memory.contains(key) {
                return Err(violation(format!(
                    "finished result '{key}' is not in memory"
                )));
            }
            if !state.outputs.contains(key) {
                return Err(violation(format!(
                    "finished result '{key}' is not an output"
                )));
            }
        } else if state.outputs.contains(key) && state.in_memory.contains(key) {
            return Err(violation(format!(
                "output '{key}' is in memory but not reported finished"
            )));
        }
    }

    Ok(())
}

impl SchedulerState {
    /// See [`validate_state`].
    pub fn validate(&self) -> Result<()> {
        validate_state(self)
    }
}
