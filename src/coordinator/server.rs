// src/coordinator/server.rs

//! Async shell around [`CoordinatorCore`].
//!
//! One core task owns the core; every accepted connection gets its own task
//! that forwards requests to the core over an mpsc channel and writes the
//! reply it gets back through a oneshot.

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::errors::{DistError, Result};
use crate::protocol::{read_message, write_message, Address, CoordinatorRequest};

use super::core::{ConnectionId, CoordinatorCore, CoordinatorStep, ShutdownMode};

/// Messages from connection tasks to the core task.
#[derive(Debug)]
enum CoreMessage {
    Request {
        conn: ConnectionId,
        request: CoordinatorRequest,
        reply_tx: oneshot::Sender<CoordinatorStep>,
    },
    Closed {
        conn: ConnectionId,
        address: Option<Address>,
    },
}

/// A bound, not yet serving, coordinator.
#[derive(Debug)]
pub struct Coordinator {
    listener: TcpListener,
    address: Address,
}

impl Coordinator {
    /// Bind the listening socket. Port 0 picks a free port; [`address`]
    /// reports the real one.
    ///
    /// [`address`]: Coordinator::address
    pub async fn bind(address: &Address) -> Result<Self> {
        let listener = TcpListener::bind(address.as_str()).await?;
        let address = Address::from(listener.local_addr()?);
        Ok(Self { listener, address })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Serve in a background task.
    pub fn spawn(self) -> CoordinatorHandle {
        let address = self.address.clone();
        let (shutdown_tx, _) = watch::channel(None);
        let task = tokio::spawn(self.serve(shutdown_tx.clone()));
        CoordinatorHandle {
            address,
            shutdown_tx,
            task,
        }
    }

    /// Accept connections until a shutdown is requested, either through
    /// `shutdown_tx` or by a `terminate` request.
    pub async fn serve(self, shutdown_tx: watch::Sender<Option<ShutdownMode>>) -> Result<()> {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let (core_tx, core_rx) = mpsc::channel::<CoreMessage>(256);
        let core_task = tokio::spawn(run_core(CoordinatorCore::new(), core_rx));

        let mut connections: JoinSet<()> = JoinSet::new();
        let mut next_conn: ConnectionId = 0;

        info!(address = %self.address, "coordinator listening");

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
                        next_conn += 1;
                        debug!(conn = next_conn, peer = %peer, "coordinator accepted connection");
                        connections.spawn(serve_connection(
                            next_conn,
                            stream,
                            core_tx.clone(),
                            shutdown_tx.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "coordinator accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        info!(address = %self.address, ?mode, "coordinator shutting down");
        drop(self.listener);
        match mode {
            ShutdownMode::Close => connections.shutdown().await,
            ShutdownMode::Drain => while connections.join_next().await.is_some() {},
        }

        drop(core_tx);
        core_task.await.map_err(anyhow::Error::from)?;
        info!(address = %self.address, "coordinator stopped");
        Ok(())
    }
}

/// Handle to a coordinator serving in the background.
#[derive(Debug)]
pub struct CoordinatorHandle {
    address: Address,
    shutdown_tx: watch::Sender<Option<ShutdownMode>>,
    task: JoinHandle<Result<()>>,
}

impl CoordinatorHandle {
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Close every connection and wait for the server to stop.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send_replace(Some(ShutdownMode::Close));
        self.wait().await
    }

    /// Wait until the server stops (e.g. after a `terminate` request).
    pub async fn wait(self) -> Result<()> {
        self.task.await.map_err(anyhow::Error::from)?
    }
}

async fn run_core(mut core: CoordinatorCore, mut rx: mpsc::Receiver<CoreMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            CoreMessage::Request {
                conn,
                request,
                reply_tx,
            } => {
                debug!(conn, ?request, "coordinator request");
                let step = core.handle(conn, request);
                // The connection may have gone away meanwhile.
                let _ = reply_tx.send(step);
            }
            CoreMessage::Closed { conn, address } => {
                core.connection_closed(conn, address.as_ref());
            }
        }
    }
    debug!("coordinator core finished");
}

async fn serve_connection(
    conn: ConnectionId,
    mut stream: TcpStream,
    core_tx: mpsc::Sender<CoreMessage>,
    shutdown_tx: watch::Sender<Option<ShutdownMode>>,
) {
    let mut registered: Option<Address> = None;

    let result: Result<()> = async {
        while let Some(request) = read_message::<CoordinatorRequest, _>(&mut stream).await? {
            if let CoordinatorRequest::Register { address, .. } = &request {
                registered = Some(address.clone());
            }

            let (reply_tx, reply_rx) = oneshot::channel();
            core_tx
                .send(CoreMessage::Request {
                    conn,
                    request,
                    reply_tx,
                })
                .await
                .map_err(|_| DistError::Protocol("coordinator core stopped".to_string()))?;
            let step = reply_rx
                .await
                .map_err(|_| DistError::Protocol("coordinator core dropped request".to_string()))?;

            write_message(&mut stream, &step.reply).await?;

            // Reply first, then stop: the requester must see its `ok`.
            if let Some(mode) = step.shutdown {
                shutdown_tx.send_replace(Some(mode));
                if mode == ShutdownMode::Close {
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        debug!(conn, error = %e, "coordinator connection ended with error");
    }
    let _ = core_tx
        .send(CoreMessage::Closed {
            conn,
            address: registered,
        })
        .await;
}
