// src/scheduler/backend.rs

//! Pluggable worker backend.
//!
//! The scheduling runtime talks to a `WorkerBackend` instead of raw sockets,
//! so tests can swap in an in-process backend while production uses
//! [`TcpWorkerBackend`]. Backends report results by sending
//! [`SchedulerEvent`]s on the channel they were created with.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::dag::task::Key;
use crate::errors::{Result, TaskError};
use crate::protocol::{Address, Connection, Reply, WorkerRequest};
use crate::worker::client::delete_data;

use super::events::{Assignment, SchedulerEvent, TaskOutcome};

/// Channel on which backends report events to the runtime.
pub type EventSender = mpsc::UnboundedSender<SchedulerEvent>;

/// Boxed future returned by backend operations.
pub type BackendFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// How the scheduling runtime reaches workers.
pub trait WorkerBackend: Send {
    /// Prepare `ncores` execution slots on `worker`.
    fn connect_worker(&mut self, worker: Address, ncores: usize) -> BackendFuture<'_>;

    /// Drop everything connected to `worker`. In-flight work is abandoned.
    fn disconnect_worker(&mut self, worker: &Address) -> BackendFuture<'_>;

    /// Start one assignment. Its outcome arrives later as an event.
    fn dispatch(&mut self, assignment: Assignment) -> BackendFuture<'_>;

    /// Delete values from `worker`. Failures are logged, not returned: the
    /// values are gone either way once the worker is.
    fn delete_data(&mut self, worker: Address, keys: Vec<Key>) -> BackendFuture<'_>;
}

/// Execution slots of one worker: a shared assignment queue drained by
/// `ncores` slot tasks, each with its own connection.
struct WorkerSlots {
    queue: mpsc::UnboundedSender<Assignment>,
    _slots: JoinSet<()>,
}

/// Production backend: persistent TCP connections, one per execution slot.
pub struct TcpWorkerBackend {
    events: EventSender,
    workers: BTreeMap<Address, WorkerSlots>,
}

impl TcpWorkerBackend {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            workers: BTreeMap::new(),
        }
    }
}

impl WorkerBackend for TcpWorkerBackend {
    fn connect_worker(&mut self, worker: Address, ncores: usize) -> BackendFuture<'_> {
        Box::pin(async move {
            if self.workers.contains_key(&worker) {
                return Ok(());
            }
            let (queue, rx) = mpsc::unbounded_channel();
            let rx = Arc::new(Mutex::new(rx));
            let mut slots = JoinSet::new();
            for slot in 0..ncores.max(1) {
                slots.spawn(run_slot(
                    worker.clone(),
                    slot,
                    Arc::clone(&rx),
                    self.events.clone(),
                ));
            }
            info!(worker = %worker, ncores, "connected worker slots");
            self.workers.insert(
                worker,
                WorkerSlots {
                    queue,
                    _slots: slots,
                },
            );
            Ok(())
        })
    }

    fn disconnect_worker(&mut self, worker: &Address) -> BackendFuture<'_> {
        // Dropping the JoinSet aborts the slot tasks and closes their sockets.
        if self.workers.remove(worker).is_some() {
            info!(worker = %worker, "disconnected worker slots");
        }
        Box::pin(async { Ok(()) })
    }

    fn dispatch(&mut self, assignment: Assignment) -> BackendFuture<'_> {
        Box::pin(async move {
            let worker = assignment.worker.clone();
            let sent = match self.workers.get(&worker) {
                Some(slots) => slots.queue.send(assignment).is_ok(),
                None => false,
            };
            if !sent {
                warn!(worker = %worker, "no live slots for dispatch; reporting worker lost");
                let _ = self.events.send(SchedulerEvent::WorkerLost { worker });
            }
            Ok(())
        })
    }

    fn delete_data(&mut self, worker: Address, keys: Vec<Key>) -> BackendFuture<'_> {
        Box::pin(async move {
            if let Err(e) = delete_data(&worker, keys.clone()).await {
                warn!(worker = %worker, keys = ?keys, error = %e, "delete_data failed");
            }
            Ok(())
        })
    }
}

/// One execution slot: pull assignments, run them over a persistent
/// connection, report outcomes. Any connection failure reports the worker
/// lost and ends the slot.
async fn run_slot(
    worker: Address,
    slot: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Assignment>>>,
    events: EventSender,
) {
    let mut conn = match Connection::connect(&worker).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(worker = %worker, slot, error = %e, "slot could not connect");
            let _ = events.send(SchedulerEvent::WorkerLost { worker });
            return;
        }
    };

    loop {
        let next = queue.lock().await.recv().await;
        let Some(assignment) = next else {
            break;
        };
        let key = assignment.key.clone();
        let request = WorkerRequest::Compute {
            key: assignment.key,
            task: assignment.task,
            who_has: assignment.who_has,
        };

        let event = match conn.request::<_, Reply>(&request).await {
            Ok(Reply::Computed { key, status }) => SchedulerEvent::TaskFinished {
                key,
                worker: worker.clone(),
                outcome: TaskOutcome::from(status),
            },
            Ok(Reply::Error { message }) => SchedulerEvent::TaskFinished {
                key,
                worker: worker.clone(),
                outcome: TaskOutcome::Failed(TaskError::new("WorkerError", message)),
            },
            Ok(other) => SchedulerEvent::TaskFinished {
                key,
                worker: worker.clone(),
                outcome: TaskOutcome::Failed(TaskError::new(
                    "ProtocolError",
                    format!("unexpected reply to compute: {other:?}"),
                )),
            },
            Err(e) => {
                warn!(worker = %worker, slot, key = %key, error = %e, "slot connection lost");
                let _ = events.send(SchedulerEvent::WorkerLost { worker });
                return;
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!(worker = %worker, slot, "slot finished");
}
