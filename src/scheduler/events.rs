// src/scheduler/events.rs

//! Events consumed and commands produced by the scheduling core.

use std::collections::BTreeMap;

use crate::dag::task::{Key, TaskExpr};
use crate::errors::TaskError;
use crate::protocol::{Address, ComputeStatus};

/// How a dispatched key ended on its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failed(TaskError),
    /// The worker could not fetch these dependencies from these peers.
    MissingData {
        missing: Vec<(Key, Address)>,
        /// Peers that did not answer at all.
        unreachable: Vec<Address>,
    },
}

impl From<ComputeStatus> for TaskOutcome {
    fn from(status: ComputeStatus) -> Self {
        match status {
            ComputeStatus::Success => TaskOutcome::Success,
            ComputeStatus::Error { category, message } => {
                TaskOutcome::Failed(TaskError { category, message })
            }
            ComputeStatus::MissingData {
                missing,
                unreachable,
            } => TaskOutcome::MissingData {
                missing,
                unreachable,
            },
        }
    }
}

/// Events flowing into the scheduling core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    TaskFinished {
        key: Key,
        worker: Address,
        outcome: TaskOutcome,
    },
    WorkerJoined {
        worker: Address,
        ncores: usize,
    },
    WorkerLost {
        worker: Address,
    },
}

/// One key sent to one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub worker: Address,
    pub key: Key,
    pub task: TaskExpr,
    /// Current holders of every dependency of `key`.
    pub who_has: BTreeMap<Key, Vec<Address>>,
}

/// Commands the IO shell executes on behalf of the core.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerCommand {
    Dispatch(Assignment),
    /// Remove values this request no longer needs.
    DeleteData { worker: Address, keys: Vec<Key> },
    /// Open execution slots on a worker.
    ConnectWorker { worker: Address, ncores: usize },
    /// Drop every connection to a worker declared lost.
    DisconnectWorker { worker: Address },
}

/// What the core decided after one event.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStep {
    pub commands: Vec<SchedulerCommand>,
    /// False once every requested key is finished.
    pub keep_running: bool,
}
