// tests/error_handling.rs

mod common;
use crate::common::builders::GraphBuilder;

use std::io::Write;
use tempfile::NamedTempFile;

use distdag::config::{ensure_has_workers, load_and_validate, load_or_default};
use distdag::dag::{DependencyIndex, Nested};
use distdag::errors::DistError;
use distdag::registry::Registry;
use distdag::scheduler::{SchedulerCore, SchedulerOptions};
use distdag::types::{LocalityTieBreak, Strategy};

fn config_file(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{text}").unwrap();
    file
}

#[test]
fn test_full_config_loads() {
    let file = config_file(
        r#"
[coordinator]
address = "127.0.0.1:9786"

[scheduler]
strategy = "centralized"
validate = true
membership_poll_ms = 50
locality_tie_break = "address"

[[worker]]
address = "127.0.0.1:9787"
ncores = 2

[[worker]]
address = "127.0.0.1:0"
"#,
    );

    let cfg = load_and_validate(file.path()).unwrap();
    assert_eq!(cfg.coordinator.as_str(), "127.0.0.1:9786");
    assert_eq!(cfg.scheduler.strategy, Strategy::Centralized);
    assert_eq!(cfg.scheduler.locality_tie_break, LocalityTieBreak::Address);
    assert!(cfg.scheduler.validate);
    assert_eq!(cfg.workers.len(), 2);
    assert_eq!(cfg.workers[1].ncores, 1);
    ensure_has_workers(&cfg).unwrap();

    let options = SchedulerOptions::from(&cfg.scheduler);
    assert_eq!(options.membership_poll.as_millis(), 50);
}

#[test]
fn test_bad_coordinator_address_returns_config_error() {
    let file = config_file("[coordinator]\naddress = \"nowhere\"\n");
    match load_and_validate(file.path()) {
        Err(DistError::ConfigError(msg)) => assert!(msg.contains("[coordinator].address")),
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_zero_poll_interval_returns_config_error() {
    let file = config_file("[scheduler]\nmembership_poll_ms = 0\n");
    assert!(matches!(
        load_and_validate(file.path()),
        Err(DistError::ConfigError(_))
    ));
}

#[test]
fn test_malformed_toml_returns_toml_error() {
    let file = config_file("[scheduler\n");
    assert!(matches!(
        load_and_validate(file.path()),
        Err(DistError::TomlError(_))
    ));
}

#[test]
fn test_explicit_missing_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("Distdag.toml");
    assert!(matches!(load_or_default(&missing), Err(DistError::IoError(_))));
}

#[test]
fn test_graph_cycle_returns_structured_error() {
    let graph = GraphBuilder::new()
        .call("a", "inc", &["b"])
        .call("b", "inc", &["a"])
        .build();
    match DependencyIndex::from_graph(&graph) {
        Err(DistError::CyclicGraph(msg)) => {
            assert!(msg.contains("cycle detected"));
            assert!(msg.contains('a') || msg.contains('b'));
        }
        other => panic!("Expected CyclicGraph, got: {:?}", other),
    }
}

#[test]
fn test_undefined_reference_names_both_keys() {
    let graph = GraphBuilder::new().call("y", "inc", &["ghost"]).build();
    match DependencyIndex::from_graph(&graph) {
        Err(DistError::MissingDependency { key, dependency }) => {
            assert_eq!(key.as_str(), "y");
            assert_eq!(dependency.as_str(), "ghost");
        }
        other => panic!("Expected MissingDependency, got: {:?}", other),
    }
}

#[test]
fn test_unknown_requested_key_is_rejected_before_scheduling() {
    let graph = GraphBuilder::new().literal("x", 1).build();
    let mut registry = Registry::new();
    registry.add_worker("w0:1".into(), 1);

    let err = SchedulerCore::new(
        &graph,
        Nested::key("nope"),
        registry,
        &SchedulerOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, DistError::UnknownKey(k) if k.as_str() == "nope"));
}

#[test]
fn test_scheduling_without_workers_fails_fast() {
    let graph = GraphBuilder::new().literal("x", 1).build();
    let mut core = SchedulerCore::new(
        &graph,
        Nested::key("x"),
        Registry::new(),
        &SchedulerOptions::default(),
    )
    .unwrap();
    assert!(matches!(core.start(), Err(DistError::NoWorkers)));
}
