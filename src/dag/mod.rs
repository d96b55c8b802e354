// src/dag/mod.rs

//! Task graphs and the scheduler state machine.
//!
//! - [`task`] defines keys, values and task expressions.
//! - [`keys`] holds nested key requests and nested results.
//! - [`graph`] derives the `dependencies` / `dependents` index and culls graphs.
//! - [`state`] contains the per-request status partition and `heal`.
//! - [`validate`] checks the partition invariants.
//! - [`local`] is the single-process evaluator.

pub mod graph;
pub mod keys;
pub mod local;
pub mod state;
pub mod task;
pub mod validate;

pub use graph::{cull, DependencyIndex};
pub use keys::{KeySpec, Nested};
pub use local::get_sync;
pub use state::{heal, KeyStatus, Processing, SchedulerState, Stacks};
pub use task::{Key, TaskExpr, TaskGraph, Value};
pub use validate::validate_state;
