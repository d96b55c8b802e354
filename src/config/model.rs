// src/config/model.rs

use serde::Deserialize;

use crate::protocol::Address;
use crate::types::{LocalityTieBreak, Strategy};

/// Cluster configuration exactly as read from TOML.
///
/// ```toml
/// [coordinator]
/// address = "127.0.0.1:8786"
///
/// [scheduler]
/// strategy = "adaptive"
/// validate = false
/// membership_poll_ms = 100
/// locality_tie_break = "least_loaded"
///
/// [[worker]]
/// address = "127.0.0.1:8787"
/// ncores = 2
/// ```
///
/// Every section is optional. Convert to [`ClusterConfig`] with `try_from`,
/// which runs validation.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawClusterConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// `[[worker]]` tables; only used when the cluster is launched from this
    /// file (`distdag local`).
    #[serde(default, rename = "worker")]
    pub workers: Vec<WorkerSection>,
}

/// `[coordinator]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorSection {
    #[serde(default = "default_coordinator_address")]
    pub address: String,
}

fn default_coordinator_address() -> String {
    "127.0.0.1:8786".to_string()
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            address: default_coordinator_address(),
        }
    }
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SchedulerSection {
    #[serde(default)]
    pub strategy: Strategy,

    /// Check the state invariants after every event. Slow; meant for
    /// debugging scheduler changes.
    #[serde(default)]
    pub validate: bool,

    /// How often a running request asks the coordinator for membership
    /// changes.
    #[serde(default = "default_membership_poll_ms")]
    pub membership_poll_ms: u64,

    #[serde(default)]
    pub locality_tie_break: LocalityTieBreak,
}

fn default_membership_poll_ms() -> u64 {
    100
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            validate: false,
            membership_poll_ms: default_membership_poll_ms(),
            locality_tie_break: LocalityTieBreak::default(),
        }
    }
}

/// `[[worker]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    pub address: String,

    #[serde(default = "default_ncores")]
    pub ncores: usize,
}

fn default_ncores() -> usize {
    1
}

/// Validated cluster configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub coordinator: Address,
    pub scheduler: SchedulerSection,
    pub workers: Vec<WorkerSpec>,
}

/// A validated `[[worker]]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub address: Address,
    pub ncores: usize,
}

impl ClusterConfig {
    /// Build without validation; only `TryFrom<RawClusterConfig>` and tests
    /// should call this.
    pub(crate) fn new_unchecked(
        coordinator: Address,
        scheduler: SchedulerSection,
        workers: Vec<WorkerSpec>,
    ) -> Self {
        Self {
            coordinator,
            scheduler,
            workers,
        }
    }

    /// A loopback cluster on ephemeral ports, one entry per `ncores` value.
    pub fn loopback(ncores: &[usize]) -> Self {
        let workers = ncores
            .iter()
            .map(|&n| WorkerSpec {
                address: Address::from("127.0.0.1:0"),
                ncores: n,
            })
            .collect();
        Self::new_unchecked(
            Address::from("127.0.0.1:0"),
            SchedulerSection::default(),
            workers,
        )
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.scheduler.strategy = strategy;
        self
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.scheduler.validate = validate;
        self
    }
}
