// src/coordinator/mod.rs

//! The coordinator: cluster membership and the authoritative data placement
//! registry.
//!
//! The pure state machine lives in [`core`]; the TCP server shell is
//! [`server`]; [`client`] is the typed client used by workers, the
//! scheduling loop and the CLI.

pub mod client;
pub mod core;
pub mod server;

pub use client::CoordinatorClient;
pub use self::core::{ConnectionId, CoordinatorCore, CoordinatorStep, ShutdownMode};
pub use server::{Coordinator, CoordinatorHandle};
