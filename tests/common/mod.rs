#![allow(dead_code)]

pub use distdag_test_utils::builders;
pub use distdag_test_utils::simulated;
pub use distdag_test_utils::{init_tracing, start_cluster, with_timeout, STRATEGIES};

use std::collections::BTreeSet;

use distdag::dag::Key;

pub fn set(keys: &[&str]) -> BTreeSet<Key> {
    keys.iter().map(|k| Key::from(*k)).collect()
}
