pub mod builders;
pub mod simulated;

use std::sync::{Arc, Once};
use std::time::Duration;

use distdag::cluster::LocalCluster;
use distdag::config::ClusterConfig;
use distdag::functions::FunctionRegistry;
use distdag::types::Strategy;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 10-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("Test timed out after 10 seconds")
}

/// Loopback cluster with one worker per `ncores` entry, invariant checks on.
pub async fn start_cluster(ncores: &[usize], strategy: Strategy) -> LocalCluster {
    let config = ClusterConfig::loopback(ncores)
        .with_strategy(strategy)
        .with_validation(true);
    LocalCluster::start(&config, Arc::new(FunctionRegistry::with_builtins()))
        .await
        .expect("failed to start local cluster")
}

/// Both placement strategies, for tests that must hold under either.
pub const STRATEGIES: [Strategy; 2] = [Strategy::Adaptive, Strategy::Centralized];
