// src/dag/keys.rs

//! Nested key requests and nested results.
//!
//! A request is a single key or an arbitrarily nested list of keys; results
//! come back in exactly the same shape.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::dag::task::Key;

/// A value or a nested list of values, mirroring the shape of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Nested<T> {
    One(T),
    Many(Vec<Nested<T>>),
}

/// Requested output keys: `"total"` or `["total", "c", ["z"]]` in JSON.
pub type KeySpec = Nested<Key>;

impl<T> Nested<T> {
    /// Leaves in depth-first order.
    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Nested::One(t) => out.push(t),
            Nested::Many(items) => {
                for item in items {
                    item.collect(out);
                }
            }
        }
    }

    /// Rebuild the same shape, transforming every leaf.
    pub fn try_map<U, E>(&self, f: &mut impl FnMut(&T) -> Result<U, E>) -> Result<Nested<U>, E> {
        match self {
            Nested::One(t) => Ok(Nested::One(f(t)?)),
            Nested::Many(items) => items
                .iter()
                .map(|item| item.try_map(f))
                .collect::<Result<Vec<_>, _>>()
                .map(Nested::Many),
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> Nested<U> {
        match self.try_map(&mut |t| Ok::<_, std::convert::Infallible>(f(t))) {
            Ok(n) => n,
            Err(never) => match never {},
        }
    }
}

impl Nested<Key> {
    pub fn key(k: impl Into<Key>) -> Self {
        Nested::One(k.into())
    }

    pub fn list(items: Vec<Nested<Key>>) -> Self {
        Nested::Many(items)
    }

    /// Distinct keys of the request.
    pub fn key_set(&self) -> BTreeSet<Key> {
        self.leaves().into_iter().cloned().collect()
    }
}
