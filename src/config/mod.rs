// src/config/mod.rs

//! Cluster configuration.
//!
//! - TOML data model (`model.rs`).
//! - Loading from disk (`loader.rs`).
//! - Validation through `TryFrom<RawClusterConfig>` (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, load_or_default};
pub use model::{
    ClusterConfig, CoordinatorSection, RawClusterConfig, SchedulerSection, WorkerSection,
    WorkerSpec,
};
pub use validate::{ensure_has_workers, validate_address};
