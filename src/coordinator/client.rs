// src/coordinator/client.rs

use std::collections::{BTreeMap, BTreeSet};

use crate::dag::task::Key;
use crate::errors::Result;
use crate::protocol::message::unexpected;
use crate::protocol::{Address, Connection, CoordinatorRequest, Reply};
use crate::registry::Registry;

/// Typed client for the coordinator protocol over one persistent connection.
#[derive(Debug)]
pub struct CoordinatorClient {
    conn: Connection,
}

impl CoordinatorClient {
    pub async fn connect(address: &Address) -> Result<Self> {
        Ok(Self {
            conn: Connection::connect(address).await?,
        })
    }

    pub fn address(&self) -> &Address {
        self.conn.peer()
    }

    async fn call(&mut self, request: CoordinatorRequest) -> Result<Reply> {
        self.conn.request(&request).await
    }

    /// Announce a worker. The worker must keep this client alive: the
    /// coordinator unregisters it when the connection closes.
    pub async fn register(&mut self, address: &Address, ncores: usize, keys: Vec<Key>) -> Result<()> {
        self.call(CoordinatorRequest::Register {
            address: address.clone(),
            ncores,
            keys,
        })
        .await?
        .into_ok()
    }

    pub async fn unregister(&mut self, address: &Address) -> Result<()> {
        self.call(CoordinatorRequest::Unregister {
            address: address.clone(),
        })
        .await?
        .into_ok()
    }

    pub async fn ncores(&mut self) -> Result<BTreeMap<Address, usize>> {
        match self.call(CoordinatorRequest::Ncores).await? {
            Reply::Ncores { ncores } => Ok(ncores),
            other => Err(unexpected("ncores", other)),
        }
    }

    pub async fn who_has(&mut self, keys: Option<Vec<Key>>) -> Result<BTreeMap<Key, BTreeSet<Address>>> {
        match self.call(CoordinatorRequest::WhoHas { keys }).await? {
            Reply::WhoHas { who_has } => Ok(who_has),
            other => Err(unexpected("who_has", other)),
        }
    }

    pub async fn has_what(
        &mut self,
        workers: Option<Vec<Address>>,
    ) -> Result<BTreeMap<Address, BTreeSet<Key>>> {
        match self.call(CoordinatorRequest::HasWhat { workers }).await? {
            Reply::HasWhat { has_what } => Ok(has_what),
            other => Err(unexpected("has_what", other)),
        }
    }

    pub async fn add_keys(&mut self, address: &Address, keys: Vec<Key>) -> Result<()> {
        self.call(CoordinatorRequest::AddKeys {
            address: address.clone(),
            keys,
        })
        .await?
        .into_ok()
    }

    pub async fn remove_keys(&mut self, address: &Address, keys: Vec<Key>) -> Result<()> {
        self.call(CoordinatorRequest::RemoveKeys {
            address: address.clone(),
            keys,
        })
        .await?
        .into_ok()
    }

    pub async fn terminate(mut self, close: bool) -> Result<()> {
        self.call(CoordinatorRequest::Terminate { close }).await?.into_ok()
    }

    /// Membership and placement as one [`Registry`].
    pub async fn snapshot(&mut self) -> Result<Registry> {
        let ncores = self.ncores().await?;
        let who_has = self.who_has(None).await?;
        Ok(Registry::from_snapshot(ncores, who_has))
    }
}
