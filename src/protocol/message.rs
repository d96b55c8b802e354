// src/protocol/message.rs

//! Request and reply messages.
//!
//! Every message is a JSON object whose `op` field selects the operation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::dag::task::{Key, TaskExpr, Value};
use crate::errors::{DistError, Result, TaskError};
use crate::protocol::Address;

/// Requests understood by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CoordinatorRequest {
    /// A worker announces itself. The connection stays open for the worker's
    /// lifetime; when it closes the worker is unregistered.
    Register {
        address: Address,
        ncores: usize,
        #[serde(default)]
        keys: Vec<Key>,
    },
    Unregister {
        address: Address,
    },
    Ncores,
    WhoHas {
        #[serde(default)]
        keys: Option<Vec<Key>>,
    },
    HasWhat {
        #[serde(default)]
        workers: Option<Vec<Address>>,
    },
    AddKeys {
        address: Address,
        keys: Vec<Key>,
    },
    RemoveKeys {
        address: Address,
        keys: Vec<Key>,
    },
    Terminate {
        #[serde(default)]
        close: bool,
    },
}

/// Requests understood by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Compute `task` and store the result under `key`. `who_has` lists the
    /// holders of every dependency the worker may need to fetch.
    Compute {
        key: Key,
        task: TaskExpr,
        #[serde(default)]
        who_has: BTreeMap<Key, Vec<Address>>,
    },
    GetData {
        keys: Vec<Key>,
    },
    UpdateData {
        data: BTreeMap<Key, Value>,
    },
    DeleteData {
        keys: Vec<Key>,
    },
    Terminate {
        #[serde(default)]
        close: bool,
    },
}

/// Outcome of a `compute` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ComputeStatus {
    Success,
    Error { category: String, message: String },
    /// Dependencies that could not be fetched, with the peer that was tried.
    /// Peers in `unreachable` could not be contacted at all; the others
    /// answered without the value.
    MissingData {
        missing: Vec<(Key, Address)>,
        #[serde(default)]
        unreachable: Vec<Address>,
    },
}

impl From<TaskError> for ComputeStatus {
    fn from(err: TaskError) -> Self {
        ComputeStatus::Error {
            category: err.category,
            message: err.message,
        }
    }
}

/// Replies sent by both the coordinator and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Ncores {
        ncores: BTreeMap<Address, usize>,
    },
    WhoHas {
        who_has: BTreeMap<Key, BTreeSet<Address>>,
    },
    HasWhat {
        has_what: BTreeMap<Address, BTreeSet<Key>>,
    },
    Data {
        data: BTreeMap<Key, Value>,
    },
    Computed {
        key: Key,
        status: ComputeStatus,
    },
    Error {
        message: String,
    },
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            message: message.into(),
        }
    }

    /// Accept `ok`; turn anything else into a protocol error.
    pub fn into_ok(self) -> Result<()> {
        match self {
            Reply::Ok => Ok(()),
            other => Err(unexpected("ok", other)),
        }
    }
}

/// Error for a reply that does not match the request that was sent.
pub fn unexpected(wanted: &str, got: Reply) -> DistError {
    match got {
        Reply::Error { message } => DistError::Protocol(message),
        other => DistError::Protocol(format!("expected `{wanted}` reply, got {other:?}")),
    }
}
