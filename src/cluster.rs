// src/cluster.rs

//! In-process cluster: a coordinator and its workers running as tasks of the
//! current tokio runtime.
//!
//! Used by `distdag local` and by the integration tests.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::info;

use crate::config::ClusterConfig;
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::dag::keys::KeySpec;
use crate::dag::task::TaskGraph;
use crate::errors::{DistError, Result};
use crate::functions::FunctionRegistry;
use crate::protocol::Address;
use crate::scheduler::{get, GetOutput, SchedulerOptions};
use crate::worker::{Worker, WorkerHandle};

#[derive(Debug)]
pub struct LocalCluster {
    coordinator: CoordinatorHandle,
    /// `None` once killed.
    workers: Vec<Option<WorkerHandle>>,
    options: SchedulerOptions,
}

impl LocalCluster {
    /// Start the coordinator, then every configured worker.
    ///
    /// Returns once every worker is registered.
    pub async fn start(config: &ClusterConfig, functions: Arc<FunctionRegistry>) -> Result<Self> {
        let coordinator = Coordinator::bind(&config.coordinator).await?.spawn();
        let mut workers = Vec::with_capacity(config.workers.len());
        for spec in &config.workers {
            let worker = Worker::bind(&spec.address, spec.ncores)
                .await?
                .start(coordinator.address(), Arc::clone(&functions))
                .await?;
            workers.push(Some(worker));
        }
        info!(
            coordinator = %coordinator.address(),
            workers = workers.len(),
            "local cluster started"
        );
        Ok(Self {
            coordinator,
            workers,
            options: SchedulerOptions::from(&config.scheduler),
        })
    }

    pub fn coordinator_address(&self) -> &Address {
        self.coordinator.address()
    }

    /// Addresses of the workers still running, in start order.
    pub fn worker_addresses(&self) -> Vec<Address> {
        self.workers
            .iter()
            .flatten()
            .map(|w| w.address().clone())
            .collect()
    }

    pub fn options(&self) -> SchedulerOptions {
        self.options
    }

    /// Stop worker `index` abruptly, dropping its connections and data.
    pub async fn kill_worker(&mut self, index: usize) -> Result<()> {
        let worker = self
            .workers
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| DistError::Other(anyhow!("no running worker at index {index}")))?;
        info!(worker = %worker.address(), "killing worker");
        worker.kill().await
    }

    /// Run a request against this cluster with its configured options.
    pub async fn get(&self, graph: &TaskGraph, request: &KeySpec, gather: bool) -> Result<GetOutput> {
        get(self.coordinator_address(), graph, request, &self.options, gather).await
    }

    /// Stop every worker, then the coordinator.
    pub async fn shutdown(self) -> Result<()> {
        for worker in self.workers.into_iter().flatten() {
            worker.kill().await?;
        }
        self.coordinator.shutdown().await?;
        info!("local cluster stopped");
        Ok(())
    }
}
