// src/coordinator/core.rs

//! Pure coordinator state machine.
//!
//! Owns the cluster [`Registry`] and answers one request at a time. It has no
//! sockets or channels; the server shell in [`super::server`] feeds it.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::protocol::{Address, CoordinatorRequest, Reply};
use crate::registry::Registry;

/// Identifies one accepted client connection.
pub type ConnectionId = u64;

/// How the server should stop after a `terminate` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop accepting; finish serving open connections.
    Drain,
    /// Stop accepting and drop every open connection.
    Close,
}

/// Result of handling one request.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorStep {
    pub reply: Reply,
    pub shutdown: Option<ShutdownMode>,
}

impl CoordinatorStep {
    fn reply(reply: Reply) -> Self {
        Self {
            reply,
            shutdown: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct CoordinatorCore {
    registry: Registry,
    /// Connection that registered each worker. Closing it unregisters the
    /// worker, unless the worker re-registered on another connection since.
    registrations: BTreeMap<Address, ConnectionId>,
}

impl CoordinatorCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn handle(&mut self, conn: ConnectionId, request: CoordinatorRequest) -> CoordinatorStep {
        match request {
            CoordinatorRequest::Register {
                address,
                ncores,
                keys,
            } => {
                if ncores == 0 {
                    warn!(worker = %address, "refusing registration without cores");
                    return CoordinatorStep::reply(Reply::error(format!(
                        "worker {address} registered with 0 cores"
                    )));
                }
                self.registry.add_worker(address.clone(), ncores);
                self.registrations.insert(address.clone(), conn);
                if let Err(e) = self.registry.add_keys(&address, keys) {
                    return CoordinatorStep::reply(Reply::error(e.to_string()));
                }
                CoordinatorStep::reply(Reply::Ok)
            }
            CoordinatorRequest::Unregister { address } => {
                self.unregister(&address);
                CoordinatorStep::reply(Reply::Ok)
            }
            CoordinatorRequest::Ncores => CoordinatorStep::reply(Reply::Ncores {
                ncores: self.registry.ncores().clone(),
            }),
            CoordinatorRequest::WhoHas { keys } => CoordinatorStep::reply(Reply::WhoHas {
                who_has: self.registry.who_has(keys.as_deref()),
            }),
            CoordinatorRequest::HasWhat { workers } => CoordinatorStep::reply(Reply::HasWhat {
                has_what: self.registry.has_what(workers.as_deref()),
            }),
            CoordinatorRequest::AddKeys { address, keys } => {
                match self.registry.add_keys(&address, keys) {
                    Ok(()) => CoordinatorStep::reply(Reply::Ok),
                    Err(e) => {
                        warn!(worker = %address, error = %e, "add_keys from unknown worker");
                        CoordinatorStep::reply(Reply::error(e.to_string()))
                    }
                }
            }
            CoordinatorRequest::RemoveKeys { address, keys } => {
                self.registry.remove_keys(&address, keys.iter());
                CoordinatorStep::reply(Reply::Ok)
            }
            CoordinatorRequest::Terminate { close } => {
                info!(close, "coordinator terminate requested");
                CoordinatorStep {
                    reply: Reply::Ok,
                    shutdown: Some(if close {
                        ShutdownMode::Close
                    } else {
                        ShutdownMode::Drain
                    }),
                }
            }
        }
    }

    /// A connection went away; unregister the worker it registered, if any.
    pub fn connection_closed(&mut self, conn: ConnectionId, address: Option<&Address>) {
        let Some(address) = address else {
            return;
        };
        if self.registrations.get(address) == Some(&conn) {
            debug!(worker = %address, conn, "registration connection closed");
            self.unregister(address);
        }
    }

    fn unregister(&mut self, address: &Address) {
        self.registrations.remove(address);
        let lost = self.registry.remove_worker(address);
        if !lost.is_empty() {
            warn!(worker = %address, lost = ?lost, "values lost with worker");
        }
    }
}
