// src/protocol/connection.rs

//! Request/response client over a single persistent TCP connection.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::trace;

use crate::errors::{DistError, Result};
use crate::protocol::frame::{read_message, write_message};
use crate::protocol::Address;

/// One persistent connection to a coordinator or worker.
///
/// Requests are answered in order, so callers must not interleave
/// `send`/`recv` pairs from different logical requests.
#[derive(Debug)]
pub struct Connection {
    peer: Address,
    stream: TcpStream,
}

impl Connection {
    /// Connect to `peer`. A refused or failed connect is reported as
    /// `WorkerUnavailable` so callers can treat it like any other peer loss.
    pub async fn connect(peer: &Address) -> Result<Self> {
        let stream = TcpStream::connect(peer.as_str())
            .await
            .map_err(|e| {
                trace!(peer = %peer, error = %e, "connect failed");
                DistError::WorkerUnavailable(peer.clone())
            })?;
        stream.set_nodelay(true)?;
        Ok(Self {
            peer: peer.clone(),
            stream,
        })
    }

    pub fn peer(&self) -> &Address {
        &self.peer
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        write_message(&mut self.stream, message).await
    }

    /// Next message, or `None` on a graceful close.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        read_message(&mut self.stream).await
    }

    /// Send one request and wait for its reply. A close before the reply is a
    /// connection loss.
    pub async fn request<Req, Rep>(&mut self, request: &Req) -> Result<Rep>
    where
        Req: Serialize,
        Rep: DeserializeOwned,
    {
        self.send(request).await?;
        match self.recv().await? {
            Some(reply) => Ok(reply),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                format!("{} closed the connection before replying", self.peer),
            )
            .into()),
        }
    }

    /// Open a connection, send one request, read one reply.
    pub async fn request_once<Req, Rep>(peer: &Address, request: &Req) -> Result<Rep>
    where
        Req: Serialize,
        Rep: DeserializeOwned,
    {
        let mut conn = Self::connect(peer).await?;
        conn.request(request).await
    }
}
