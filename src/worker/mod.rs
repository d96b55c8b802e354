// src/worker/mod.rs

//! Workers: hold values, compute tasks, serve data to peers.
//!
//! - [`store`] owns the value store and reports changes to the coordinator.
//! - [`compute`] runs one task, fetching inputs from peers as needed.
//! - [`server`] is the TCP server and its handle.
//! - [`client`] wraps one-shot requests against another worker.

pub mod client;
pub mod compute;
pub mod server;
pub mod store;

pub use compute::ComputeContext;
pub use server::{Worker, WorkerHandle};
pub use store::{spawn_store, StoreHandle, ValueStore};
