// src/protocol/mod.rs

//! Message protocol between clients, the coordinator and workers.
//!
//! - [`frame`] implements the length-prefixed framing over any async stream.
//! - [`message`] defines the request / reply enums, tagged by `op`.
//! - [`connection`] wraps a TCP stream in a request/response client.

pub mod connection;
pub mod frame;
pub mod message;

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

pub use connection::Connection;
pub use frame::{read_message, write_message, MAX_FRAME_LEN};
pub use message::{
    ComputeStatus, CoordinatorRequest, Reply, WorkerRequest,
};

/// Network identity of a worker or the coordinator, as `host:port`.
///
/// Ordering is plain string ordering; every deterministic tie-break between
/// workers uses it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Address(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address(s.to_string())
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Address(s)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address(addr.to_string())
    }
}
