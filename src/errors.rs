// src/errors.rs

//! Crate-wide error type and aliases.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dag::task::Key;
use crate::protocol::Address;

#[derive(Error, Debug)]
pub enum DistError {
    #[error("Cycle detected in task graph: {0}")]
    CyclicGraph(String),

    #[error("task '{key}' references undefined key '{dependency}'")]
    MissingDependency { key: Key, dependency: Key },

    #[error("requested key '{0}' is not part of the task graph")]
    UnknownKey(Key),

    /// A user task raised. Category and message are the task's own, unwrapped.
    #[error("{category}: {message} (while computing '{key}')")]
    TaskExecution {
        key: Key,
        category: String,
        message: String,
    },

    #[error("worker lost: {0}")]
    WorkerLost(String),

    #[error("worker {0} unavailable")]
    WorkerUnavailable(Address),

    #[error("no worker holds key '{0}'")]
    KeyNotFound(Key),

    #[error("scheduler invariant violated: {0}")]
    InvariantViolation(String),

    #[error("unknown worker {0}")]
    UnknownWorker(Address),

    #[error("no workers registered with the coordinator")]
    NoWorkers,

    #[error("request cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DistError {
    /// Whether this error means a peer went away (as opposed to a defect or a
    /// task failure).
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            DistError::IoError(_) | DistError::WorkerLost(_) | DistError::WorkerUnavailable(_)
        )
    }
}

/// Structured error raised by a user task.
///
/// Travels inside completion replies instead of being thrown across process
/// boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub category: String,
    pub message: String,
}

impl TaskError {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// Attach the key being computed, producing the request-level error.
    pub fn into_dist_error(self, key: Key) -> DistError {
        DistError::TaskExecution {
            key,
            category: self.category,
            message: self.message,
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DistError>;
