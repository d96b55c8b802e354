// src/lib.rs

pub mod cli;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod dag;
pub mod errors;
pub mod functions;
pub mod gather;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod types;
pub mod worker;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cli::{CliArgs, Command, RequestArgs};
use crate::cluster::LocalCluster;
use crate::config::{default_config_path, ensure_has_workers, load_and_validate, load_or_default};
use crate::config::{validate_address, ClusterConfig};
use crate::coordinator::{Coordinator, CoordinatorClient};
use crate::dag::{cull, get_sync, DependencyIndex, KeySpec, SchedulerState, TaskGraph};
use crate::functions::FunctionRegistry;
use crate::protocol::Address;
use crate::scheduler::SchedulerOptions;
use crate::worker::Worker;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the selected subcommand
/// - Ctrl-C handling for the long-running servers
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = match &args.config {
        Some(path) => load_and_validate(path)?,
        None => load_or_default(default_config_path())?,
    };

    match args.command {
        Command::Coordinator { address } => {
            let address = resolve_address(address, &cfg.coordinator)?;
            run_coordinator(&address).await
        }
        Command::Worker {
            address,
            ncores,
            coordinator,
        } => {
            validate_address("worker address", &address)?;
            let coordinator = resolve_address(coordinator, &cfg.coordinator)?;
            run_worker(&Address::from(address), ncores, &coordinator).await
        }
        Command::Get {
            request,
            coordinator,
            strategy,
        } => {
            let (graph, keys) = read_request(&request)?;
            if request.dry_run {
                return print_dry_run(&graph, &keys, request.evaluate);
            }
            let coordinator = resolve_address(coordinator, &cfg.coordinator)?;
            let mut options = SchedulerOptions::from(&cfg.scheduler);
            if let Some(strategy) = strategy {
                options.strategy = strategy.into();
            }
            let output =
                scheduler::get(&coordinator, &graph, &keys, &options, request.gather).await?;
            print_json(&output)
        }
        Command::Local { request } => {
            let (graph, keys) = read_request(&request)?;
            if request.dry_run {
                return print_dry_run(&graph, &keys, request.evaluate);
            }
            run_local(&cfg, &graph, &keys, request.gather).await
        }
        Command::Ncores { coordinator } => {
            let coordinator = resolve_address(coordinator, &cfg.coordinator)?;
            let mut client = CoordinatorClient::connect(&coordinator).await?;
            print_json(&client.ncores().await?)
        }
        Command::Terminate { address, close } => {
            validate_address("address", &address)?;
            // Coordinators and workers share the terminate message.
            worker::client::terminate(&Address::from(address), close).await?;
            Ok(())
        }
    }
}

fn resolve_address(flag: Option<String>, configured: &Address) -> Result<Address> {
    match flag {
        Some(address) => {
            validate_address("address", &address)?;
            Ok(Address::from(address))
        }
        None => Ok(configured.clone()),
    }
}

async fn run_coordinator(address: &Address) -> Result<()> {
    let handle = Coordinator::bind(address).await?.spawn();
    println!("{}", handle.address());
    terminate_on_ctrl_c(handle.address().clone());
    handle.wait().await?;
    Ok(())
}

async fn run_worker(address: &Address, ncores: usize, coordinator: &Address) -> Result<()> {
    let functions = Arc::new(FunctionRegistry::with_builtins());
    let handle = Worker::bind(address, ncores)
        .await?
        .start(coordinator, functions)
        .await?;
    println!("{}", handle.address());
    terminate_on_ctrl_c(handle.address().clone());
    handle.wait().await?;
    Ok(())
}

/// Ctrl-C sends the server at `address` a closing `terminate`, the same path
/// as `distdag terminate --close`.
fn terminate_on_ctrl_c(address: Address) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("failed to listen for Ctrl+C: {e}");
            return;
        }
        info!(address = %address, "Ctrl+C received; terminating");
        if let Err(e) = worker::client::terminate(&address, true).await {
            warn!(address = %address, error = %e, "terminate after Ctrl+C failed");
        }
    });
}

async fn run_local(
    cfg: &ClusterConfig,
    graph: &TaskGraph,
    keys: &KeySpec,
    gather: bool,
) -> Result<()> {
    ensure_has_workers(cfg)?;
    let functions = Arc::new(FunctionRegistry::with_builtins());
    let cluster = LocalCluster::start(cfg, functions).await?;

    let result = cluster.get(graph, keys, gather).await;
    cluster.shutdown().await?;
    print_json(&result?)
}

fn read_request(request: &RequestArgs) -> Result<(TaskGraph, KeySpec)> {
    let graph = read_graph(&request.graph)?;
    let keys: KeySpec = serde_json::from_str(&request.keys)
        .with_context(|| format!("invalid --keys JSON: {}", request.keys))?;
    Ok((graph, keys))
}

fn read_graph(path: &Path) -> Result<TaskGraph> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read graph file {}", path.display()))?;
    let graph: TaskGraph = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse graph file {}", path.display()))?;
    debug!(keys = graph.len(), path = %path.display(), "graph loaded");
    Ok(graph)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the dependency index and the initial state; with `evaluate`, also
/// the values computed in this process.
fn print_dry_run(graph: &TaskGraph, keys: &KeySpec, evaluate: bool) -> Result<()> {
    let requested = keys.key_set();
    let culled = cull(graph, &requested)?;
    let index = DependencyIndex::from_graph(&culled)?;
    let state = SchedulerState::initial(&index, &requested, Default::default());
    state.validate()?;

    println!("distdag dry-run");
    println!("  requested = {}", serde_json::to_string(keys)?);
    println!();

    println!("keys ({}), in topological order:", index.len());
    for key in index.order() {
        let deps = index.dependencies_of(key);
        if deps.is_empty() {
            println!("  - {key}");
        } else {
            let deps: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
            println!("  - {key}  <- {}", deps.join(", "));
        }
    }
    println!();

    let ready: Vec<String> = state.ready_keys().iter().map(|k| k.to_string()).collect();
    let outputs: Vec<String> = state.outputs.iter().map(|k| k.to_string()).collect();
    println!("initial state:");
    println!("  ready:   [{}]", ready.join(", "));
    println!("  waiting: {}", state.waiting.len() - ready.len());
    println!("  outputs: [{}]", outputs.join(", "));

    if evaluate {
        let functions = FunctionRegistry::with_builtins();
        let values = get_sync(graph, keys, &functions)?;
        println!();
        println!("values = {}", serde_json::to_string(&values)?);
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
