// src/registry.rs

//! Cluster membership and data placement.
//!
//! The coordinator owns one `Registry` (mutated only by its core loop); each
//! scheduling request owns another, seeded from the coordinator when the
//! request starts and mutated only by that request's loop.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::dag::task::Key;
use crate::errors::{DistError, Result};
use crate::protocol::Address;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    ncores: BTreeMap<Address, usize>,
    who_has: BTreeMap<Key, BTreeSet<Address>>,
    has_what: BTreeMap<Address, BTreeSet<Key>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a registry from snapshots returned by the coordinator.
    ///
    /// Placement entries for workers missing from `ncores` are ignored.
    pub fn from_snapshot(
        ncores: BTreeMap<Address, usize>,
        who_has: BTreeMap<Key, BTreeSet<Address>>,
    ) -> Self {
        let mut registry = Self::new();
        for (worker, n) in ncores {
            registry.add_worker(worker, n);
        }
        for (key, holders) in who_has {
            for worker in holders {
                if registry.ncores.contains_key(&worker) {
                    registry.insert_pair(key.clone(), worker);
                }
            }
        }
        registry
    }

    /// A worker joined (or re-announced itself). Known keys are kept.
    pub fn add_worker(&mut self, worker: Address, ncores: usize) {
        let previous = self.ncores.insert(worker.clone(), ncores);
        self.has_what.entry(worker.clone()).or_default();
        if previous.is_none() {
            info!(worker = %worker, ncores, "worker joined");
        }
    }

    /// Remove a worker and everything it held.
    ///
    /// Returns the keys for which it was the only holder. Idempotent: an
    /// unknown worker yields an empty list.
    pub fn remove_worker(&mut self, worker: &Address) -> Vec<Key> {
        if self.ncores.remove(worker).is_none() {
            return Vec::new();
        }
        let held = self.has_what.remove(worker).unwrap_or_default();
        let mut lost = Vec::new();
        for key in held {
            if let Some(holders) = self.who_has.get_mut(&key) {
                holders.remove(worker);
                if holders.is_empty() {
                    self.who_has.remove(&key);
                    lost.push(key);
                }
            }
        }
        info!(worker = %worker, lost = lost.len(), "worker removed");
        lost
    }

    pub fn add_keys(&mut self, worker: &Address, keys: impl IntoIterator<Item = Key>) -> Result<()> {
        if !self.ncores.contains_key(worker) {
            return Err(DistError::UnknownWorker(worker.clone()));
        }
        for key in keys {
            debug!(key = %key, worker = %worker, "registry: key stored");
            self.insert_pair(key, worker.clone());
        }
        Ok(())
    }

    /// Forget that `worker` holds `keys`; unknown pairs are ignored.
    pub fn remove_keys<'a>(&mut self, worker: &Address, keys: impl IntoIterator<Item = &'a Key>) {
        for key in keys {
            if let Some(held) = self.has_what.get_mut(worker) {
                held.remove(key);
            }
            if let Some(holders) = self.who_has.get_mut(key) {
                holders.remove(worker);
                if holders.is_empty() {
                    self.who_has.remove(key);
                }
            }
        }
    }

    fn insert_pair(&mut self, key: Key, worker: Address) {
        self.has_what.entry(worker.clone()).or_default().insert(key.clone());
        self.who_has.entry(key).or_default().insert(worker);
    }

    pub fn contains_worker(&self, worker: &Address) -> bool {
        self.ncores.contains_key(worker)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Address> {
        self.ncores.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.ncores.is_empty()
    }

    pub fn ncores_of(&self, worker: &Address) -> usize {
        self.ncores.get(worker).copied().unwrap_or(0)
    }

    pub fn ncores(&self) -> &BTreeMap<Address, usize> {
        &self.ncores
    }

    /// Holders of `key`, in address order.
    pub fn holders(&self, key: &Key) -> Vec<Address> {
        self.who_has
            .get(key)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn holds(&self, worker: &Address, key: &Key) -> bool {
        self.has_what.get(worker).is_some_and(|keys| keys.contains(key))
    }

    pub fn keys_of(&self, worker: &Address) -> BTreeSet<Key> {
        self.has_what.get(worker).cloned().unwrap_or_default()
    }

    /// Keys held by at least one worker.
    pub fn keys_in_memory(&self) -> BTreeSet<Key> {
        self.who_has.keys().cloned().collect()
    }

    /// `who_has` restricted to `keys` (everything when `None`).
    pub fn who_has(&self, keys: Option<&[Key]>) -> BTreeMap<Key, BTreeSet<Address>> {
        match keys {
            None => self.who_has.clone(),
            Some(keys) => keys
                .iter()
                .map(|k| (k.clone(), self.who_has.get(k).cloned().unwrap_or_default()))
                .collect(),
        }
    }

    /// `has_what` restricted to `workers` (everything when `None`).
    pub fn has_what(&self, workers: Option<&[Address]>) -> BTreeMap<Address, BTreeSet<Key>> {
        match workers {
            None => self.has_what.clone(),
            Some(workers) => workers
                .iter()
                .map(|w| (w.clone(), self.has_what.get(w).cloned().unwrap_or_default()))
                .collect(),
        }
    }

    /// `who_has` and `has_what` are exact inverses and only mention live
    /// workers.
    pub fn is_consistent(&self) -> bool {
        let forward = self.who_has.iter().all(|(key, holders)| {
            !holders.is_empty()
                && holders
                    .iter()
                    .all(|w| self.ncores.contains_key(w) && self.holds(w, key))
        });
        let backward = self.has_what.iter().all(|(worker, keys)| {
            self.ncores.contains_key(worker)
                && keys
                    .iter()
                    .all(|k| self.who_has.get(k).is_some_and(|h| h.contains(worker)))
        });
        forward && backward
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::from(s)
    }

    fn k(s: &str) -> Key {
        Key::from(s)
    }

    #[test]
    fn remove_worker_reports_only_solely_held_keys() {
        let mut r = Registry::new();
        r.add_worker(addr("a:1"), 2);
        r.add_worker(addr("b:1"), 1);
        r.add_keys(&addr("a:1"), [k("x"), k("y")]).unwrap();
        r.add_keys(&addr("b:1"), [k("y")]).unwrap();
        assert!(r.is_consistent());

        let lost = r.remove_worker(&addr("a:1"));
        assert_eq!(lost, vec![k("x")]);
        assert_eq!(r.holders(&k("y")), vec![addr("b:1")]);
        assert!(r.holders(&k("x")).is_empty());
        assert!(r.is_consistent());

        // Idempotent.
        assert!(r.remove_worker(&addr("a:1")).is_empty());
    }

    #[test]
    fn add_keys_requires_known_worker() {
        let mut r = Registry::new();
        assert!(matches!(
            r.add_keys(&addr("ghost:1"), [k("x")]),
            Err(DistError::UnknownWorker(_))
        ));
    }

    #[test]
    fn remove_keys_drops_empty_entries() {
        let mut r = Registry::new();
        r.add_worker(addr("a:1"), 1);
        r.add_keys(&addr("a:1"), [k("x")]).unwrap();
        r.remove_keys(&addr("a:1"), [&k("x")]);
        assert!(r.who_has(None).is_empty());
        assert!(r.keys_of(&addr("a:1")).is_empty());
        assert!(r.is_consistent());
    }

    #[test]
    fn snapshot_ignores_unknown_holders() {
        let mut ncores = BTreeMap::new();
        ncores.insert(addr("a:1"), 2);
        let mut who_has = BTreeMap::new();
        who_has.insert(k("x"), [addr("a:1"), addr("gone:1")].into_iter().collect());
        let r = Registry::from_snapshot(ncores, who_has);
        assert_eq!(r.holders(&k("x")), vec![addr("a:1")]);
        assert!(r.is_consistent());
    }
}
