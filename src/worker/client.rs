// src/worker/client.rs

//! One-shot requests against a worker's data API.

use std::collections::BTreeMap;

use crate::dag::task::{Key, Value};
use crate::errors::{DistError, Result};
use crate::protocol::message::unexpected;
use crate::protocol::{Address, Connection, Reply, WorkerRequest};

/// Map a lost connection to `WorkerUnavailable(worker)`; keep other errors.
fn unavailable(worker: &Address, err: DistError) -> DistError {
    if err.is_connection_loss() {
        DistError::WorkerUnavailable(worker.clone())
    } else {
        err
    }
}

/// Values of `keys` held by `worker`. Keys it does not hold are absent from
/// the result.
pub async fn get_data(worker: &Address, keys: Vec<Key>) -> Result<BTreeMap<Key, Value>> {
    let reply = Connection::request_once(worker, &WorkerRequest::GetData { keys })
        .await
        .map_err(|e| unavailable(worker, e))?;
    match reply {
        Reply::Data { data } => Ok(data),
        other => Err(unexpected("data", other)),
    }
}

/// Store values on `worker`, which registers them with the coordinator.
pub async fn update_data(worker: &Address, data: BTreeMap<Key, Value>) -> Result<()> {
    Connection::request_once::<_, Reply>(worker, &WorkerRequest::UpdateData { data })
        .await
        .map_err(|e| unavailable(worker, e))?
        .into_ok()
}

pub async fn delete_data(worker: &Address, keys: Vec<Key>) -> Result<()> {
    Connection::request_once::<_, Reply>(worker, &WorkerRequest::DeleteData { keys })
        .await
        .map_err(|e| unavailable(worker, e))?
        .into_ok()
}

/// Ask `worker` to shut down.
pub async fn terminate(worker: &Address, close: bool) -> Result<()> {
    Connection::request_once::<_, Reply>(worker, &WorkerRequest::Terminate { close })
        .await
        .map_err(|e| unavailable(worker, e))?
        .into_ok()
}
