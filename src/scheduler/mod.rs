// src/scheduler/mod.rs

//! The scheduling loop.
//!
//! Structure:
//! - [`events`]: events into and commands out of the core.
//! - [`placement`]: the centralized and adaptive placement strategies.
//! - [`core`]: pure, synchronous state machine for one request.
//! - [`backend`]: how the loop reaches workers.
//! - [`runtime`]: async shell driving the core.

pub mod backend;
pub mod core;
pub mod events;
pub mod placement;
pub mod runtime;

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::config::SchedulerSection;
use crate::coordinator::CoordinatorClient;
use crate::dag::keys::{KeySpec, Nested};
use crate::dag::task::{TaskGraph, Value};
use crate::errors::{DistError, Result};
use crate::gather::{gather_from_registry, TcpFetcher};
use crate::protocol::Address;
use crate::types::{LocalityTieBreak, Strategy};

pub use backend::{BackendFuture, EventSender, TcpWorkerBackend, WorkerBackend};
pub use self::core::{RemoteData, SchedulerCore};
pub use events::{Assignment, SchedulerCommand, SchedulerEvent, SchedulerStep, TaskOutcome};
pub use placement::Placement;
pub use runtime::SchedulerRuntime;

/// Knobs of one scheduling request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub strategy: Strategy,
    pub locality_tie_break: LocalityTieBreak,
    /// Run the invariant checker after every step.
    pub validate: bool,
    pub membership_poll: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&SchedulerSection::default())
    }
}

impl From<&SchedulerSection> for SchedulerOptions {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            strategy: section.strategy,
            locality_tie_break: section.locality_tie_break,
            validate: section.validate,
            membership_poll: Duration::from_millis(section.membership_poll_ms),
        }
    }
}

/// Result of [`get`]: where the outputs live, or their values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GetOutput {
    Remote(Nested<RemoteData>),
    Values(Nested<Value>),
}

/// Compute `request` from `graph` on the cluster behind `coordinator`.
///
/// With `gather` the values are fetched from their holders; otherwise only
/// their locations are returned. In both cases the requested keys stay on
/// the workers and every intermediate value this request produced is
/// deleted.
///
/// The request runs on its own task. Dropping the returned future cancels
/// it; the task then disconnects from the workers and deletes what the
/// request computed before exiting.
pub async fn get(
    coordinator: &Address,
    graph: &TaskGraph,
    request: &KeySpec,
    options: &SchedulerOptions,
    gather: bool,
) -> Result<GetOutput> {
    let mut client = CoordinatorClient::connect(coordinator).await?;
    let registry = client.snapshot().await?;
    let core = SchedulerCore::new(graph, request.clone(), registry, options)?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let backend = TcpWorkerBackend::new(events_tx);
    // Held until the request task finishes; dropping it cancels the request.
    let (_cancel, cancel_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(
        SchedulerRuntime::new(core, events_rx, backend)
            .with_membership(client, options.membership_poll)
            .with_cancellation(cancel_rx)
            .run(),
    );
    let core = running
        .await
        .map_err(|e| DistError::Other(anyhow::anyhow!("request task failed: {e}")))??;

    if !gather {
        return core.output().map(GetOutput::Remote);
    }
    let values = gather_from_registry(core.registry(), request, &TcpFetcher).await?;
    info!(keys = request.key_set().len(), "gathered results");
    Ok(GetOutput::Values(values))
}
