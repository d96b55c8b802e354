// src/worker/server.rs

//! Worker TCP server.
//!
//! A worker registers with the coordinator, then serves `compute` and data
//! requests. Each connection is handled by its own task; the value store is
//! owned by the store task (see [`super::store`]).

use std::sync::Arc;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::coordinator::{CoordinatorClient, ShutdownMode};
use crate::errors::Result;
use crate::functions::FunctionRegistry;
use crate::protocol::{read_message, write_message, Address, Reply, WorkerRequest};

use super::compute::{compute, ComputeContext};
use super::store::spawn_store;

/// A bound worker that has not registered yet.
#[derive(Debug)]
pub struct Worker {
    listener: TcpListener,
    address: Address,
    ncores: usize,
}

impl Worker {
    /// Bind the listening socket. Port 0 picks a free port.
    pub async fn bind(address: &Address, ncores: usize) -> Result<Self> {
        let listener = TcpListener::bind(address.as_str()).await?;
        let address = Address::from(listener.local_addr()?);
        Ok(Self {
            listener,
            address,
            ncores: ncores.max(1),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Register with `coordinator` and serve in a background task.
    ///
    /// Returns once the coordinator has acknowledged the registration.
    pub async fn start(
        self,
        coordinator: &Address,
        functions: Arc<FunctionRegistry>,
    ) -> Result<WorkerHandle> {
        let mut client = CoordinatorClient::connect(coordinator).await?;
        client.register(&self.address, self.ncores, Vec::new()).await?;
        info!(worker = %self.address, ncores = self.ncores, coordinator = %coordinator, "worker registered");

        let address = self.address.clone();
        let (shutdown_tx, _) = watch::channel(None);
        let task = tokio::spawn(self.serve(client, functions, shutdown_tx.clone()));
        Ok(WorkerHandle {
            address,
            shutdown_tx,
            task,
        })
    }

    async fn serve(
        self,
        coordinator: CoordinatorClient,
        functions: Arc<FunctionRegistry>,
        shutdown_tx: watch::Sender<Option<ShutdownMode>>,
    ) -> Result<()> {
        let (store, store_task) = spawn_store(self.address.clone(), Some(coordinator));
        let ctx = ComputeContext::new(self.address.clone(), store, functions, self.ncores);

        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut connections: JoinSet<()> = JoinSet::new();

        info!(worker = %self.address, "worker listening");

        let mut pending = *shutdown_rx.borrow_and_update();
        let mode = loop {
            if let Some(mode) = pending.take() {
                break mode;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break ShutdownMode::Close;
                    }
                    pending = *shutdown_rx.borrow_and_update();
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(worker = %self.address, peer = %peer, "worker accepted connection");
                        connections.spawn(serve_connection(stream, ctx.clone(), shutdown_tx.clone()));
                    }
                    Err(e) => warn!(worker = %self.address, error = %e, "worker accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        info!(worker = %self.address, ?mode, "worker shutting down");
        drop(self.listener);
        match mode {
            ShutdownMode::Close => connections.shutdown().await,
            ShutdownMode::Drain => while connections.join_next().await.is_some() {},
        }

        // Last store handle: the store task unregisters and exits.
        drop(ctx);
        store_task.await.map_err(anyhow::Error::from)?;
        info!(worker = %self.address, "worker stopped");
        Ok(())
    }
}

/// Handle to a worker serving in the background.
#[derive(Debug)]
pub struct WorkerHandle {
    address: Address,
    shutdown_tx: watch::Sender<Option<ShutdownMode>>,
    task: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Drop every connection and stop, as if the process died.
    pub async fn kill(self) -> Result<()> {
        self.shutdown_tx.send_replace(Some(ShutdownMode::Close));
        self.wait().await
    }

    /// Wait until the worker stops (e.g. after a `terminate` request).
    pub async fn wait(self) -> Result<()> {
        self.task.await.map_err(anyhow::Error::from)?
    }
}

async fn serve_connection(
    stream: TcpStream,
    ctx: ComputeContext,
    shutdown_tx: watch::Sender<Option<ShutdownMode>>,
) {
    if let Err(e) = handle_requests(stream, &ctx, &shutdown_tx).await {
        debug!(worker = %ctx.address, error = %e, "worker connection ended with error");
    }
}

async fn handle_requests(
    stream: TcpStream,
    ctx: &ComputeContext,
    shutdown_tx: &watch::Sender<Option<ShutdownMode>>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    while let Some(request) = read_message::<WorkerRequest, _>(&mut reader).await? {
        let reply = match request {
            WorkerRequest::Compute { key, task, who_has } => {
                let outcome = tokio::select! {
                    outcome = compute(ctx, key.clone(), task, who_has) => outcome,
                    _ = requester_gone(&mut reader) => {
                        info!(worker = %ctx.address, key = %key, "requester went away; abandoning compute");
                        return Ok(());
                    }
                };
                match outcome {
                    Ok(status) => Reply::Computed { key, status },
                    Err(e) => Reply::error(e.to_string()),
                }
            }
            WorkerRequest::GetData { keys } => Reply::Data {
                data: ctx.store.get(keys).await?,
            },
            WorkerRequest::UpdateData { data } => match ctx.store.put(data).await {
                Ok(()) => Reply::Ok,
                Err(e) => Reply::error(e.to_string()),
            },
            WorkerRequest::DeleteData { keys } => match ctx.store.delete(keys).await {
                Ok(()) => Reply::Ok,
                Err(e) => Reply::error(e.to_string()),
            },
            WorkerRequest::Terminate { close } => {
                write_message(&mut writer, &Reply::Ok).await?;
                info!(worker = %ctx.address, close, "worker terminate requested");
                shutdown_tx.send_replace(Some(if close {
                    ShutdownMode::Close
                } else {
                    ShutdownMode::Drain
                }));
                return Ok(());
            }
        };
        write_message(&mut writer, &reply).await?;
    }
    Ok(())
}

/// Resolves when the requester closes its side. Requesters wait for the
/// reply before sending again, so any incoming frame here is a protocol
/// violation and ends the connection as well.
async fn requester_gone(reader: &mut OwnedReadHalf) {
    match read_message::<WorkerRequest, _>(reader).await {
        Ok(None) | Err(_) => {}
        Ok(Some(request)) => {
            warn!(?request, "request received while a compute was in flight; closing");
        }
    }
}
