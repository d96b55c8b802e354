// src/scheduler/runtime.rs

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::coordinator::CoordinatorClient;
use crate::errors::{DistError, Result};
use crate::protocol::Address;

use super::backend::WorkerBackend;
use super::core::SchedulerCore;
use super::events::{SchedulerCommand, SchedulerEvent};

/// Drives a [`SchedulerCore`] in response to [`SchedulerEvent`]s and
/// executes its commands through a [`WorkerBackend`].
///
/// All scheduling semantics live in the core; this shell only waits for
/// events (or the membership poll timer), feeds them in, and carries out the
/// resulting commands.
pub struct SchedulerRuntime<B: WorkerBackend> {
    core: SchedulerCore,
    event_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    backend: B,
    membership: Option<Membership>,
    cancel: Option<oneshot::Receiver<()>>,
}

struct Membership {
    client: CoordinatorClient,
    interval: Duration,
}

impl<B: WorkerBackend> fmt::Debug for SchedulerRuntime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerRuntime")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

enum Wake {
    Event(Option<SchedulerEvent>),
    PollMembership,
}

/// Resolves when the cancel signal fires or its sender is dropped; never
/// without one.
async fn cancelled(cancel: &mut Option<oneshot::Receiver<()>>) {
    match cancel {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl<B: WorkerBackend> SchedulerRuntime<B> {
    pub fn new(
        core: SchedulerCore,
        event_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
        backend: B,
    ) -> Self {
        Self {
            core,
            event_rx,
            backend,
            membership: None,
            cancel: None,
        }
    }

    /// Poll `client` for joined and departed workers every `interval`.
    pub fn with_membership(mut self, client: CoordinatorClient, interval: Duration) -> Self {
        self.membership = Some(Membership { client, interval });
        self
    }

    /// Stop with [`DistError::Cancelled`] once `cancel` fires or its sender
    /// is dropped.
    pub fn with_cancellation(mut self, cancel: oneshot::Receiver<()>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run the request to completion.
    ///
    /// On every exit path, cancellation included, the workers are
    /// disconnected and the values this request computed and no longer needs
    /// are deleted from them. Returns the core, from which the caller reads
    /// the output locations.
    pub async fn run(mut self) -> Result<SchedulerCore> {
        let result = self.drive().await;

        let cleanup = self.core.cleanup(result.is_ok());
        if !cleanup.is_empty() {
            debug!(commands = cleanup.len(), "cleaning up request data");
        }
        for command in cleanup {
            if let Err(e) = self.execute(command).await {
                warn!(error = %e, "cleanup command failed");
            }
        }

        match result {
            Ok(()) => {
                info!("request finished");
                Ok(self.core)
            }
            Err(e) => Err(e),
        }
    }

    async fn drive(&mut self) -> Result<()> {
        let step = self.core.start()?;
        self.execute_all(step.commands).await?;
        if !step.keep_running {
            return Ok(());
        }

        let interval = self
            .membership
            .as_ref()
            .map_or(Duration::from_secs(3600), |m| m.interval);
        let polling = self.membership.is_some();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately and the snapshot is fresh.
        ticker.tick().await;

        loop {
            let wake = tokio::select! {
                event = self.event_rx.recv() => Wake::Event(event),
                _ = ticker.tick(), if polling => Wake::PollMembership,
                _ = cancelled(&mut self.cancel) => {
                    info!("request cancelled");
                    return Err(DistError::Cancelled);
                }
            };

            let events = match wake {
                Wake::Event(Some(event)) => vec![event],
                Wake::Event(None) => {
                    return Err(DistError::Protocol(
                        "worker backend stopped reporting events".to_string(),
                    ));
                }
                Wake::PollMembership => self.poll_membership().await,
            };

            for event in events {
                debug!(?event, "scheduler received event");
                let step = self.core.step(event)?;
                self.execute_all(step.commands).await?;
                if !step.keep_running {
                    return Ok(());
                }
            }
        }
    }

    /// Compare the coordinator's membership with the request's registry.
    async fn poll_membership(&mut self) -> Vec<SchedulerEvent> {
        let Some(membership) = self.membership.as_mut() else {
            return Vec::new();
        };
        let current = match membership.client.ncores().await {
            Ok(ncores) => ncores,
            Err(e) => {
                warn!(error = %e, "membership poll failed");
                return Vec::new();
            }
        };

        let known: BTreeSet<Address> = self.core.registry().workers().cloned().collect();
        let mut events: Vec<SchedulerEvent> = current
            .iter()
            .filter(|(worker, _)| !known.contains(*worker))
            .map(|(worker, &ncores)| SchedulerEvent::WorkerJoined {
                worker: worker.clone(),
                ncores,
            })
            .collect();
        events.extend(
            known
                .into_iter()
                .filter(|worker| !current.contains_key(worker))
                .map(|worker| SchedulerEvent::WorkerLost { worker }),
        );
        events
    }

    async fn execute_all(&mut self, commands: Vec<SchedulerCommand>) -> Result<()> {
        for command in commands {
            self.execute(command).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, command: SchedulerCommand) -> Result<()> {
        match command {
            SchedulerCommand::Dispatch(assignment) => self.backend.dispatch(assignment).await,
            SchedulerCommand::DeleteData { worker, keys } => {
                self.backend.delete_data(worker, keys).await
            }
            SchedulerCommand::ConnectWorker { worker, ncores } => {
                self.backend.connect_worker(worker, ncores).await
            }
            SchedulerCommand::DisconnectWorker { worker } => {
                self.backend.disconnect_worker(&worker).await
            }
        }
    }
}
