// src/config/validate.rs

use std::collections::BTreeSet;

use crate::config::model::{ClusterConfig, RawClusterConfig, WorkerSpec};
use crate::errors::{DistError, Result};
use crate::protocol::Address;

impl TryFrom<RawClusterConfig> for ClusterConfig {
    type Error = DistError;

    fn try_from(raw: RawClusterConfig) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        let workers = raw
            .workers
            .into_iter()
            .map(|w| WorkerSpec {
                address: Address::from(w.address.trim()),
                ncores: w.ncores,
            })
            .collect();
        Ok(ClusterConfig::new_unchecked(
            Address::from(raw.coordinator.address.trim()),
            raw.scheduler,
            workers,
        ))
    }
}

fn validate_raw_config(cfg: &RawClusterConfig) -> Result<()> {
    validate_address("[coordinator].address", &cfg.coordinator.address)?;
    validate_scheduler(cfg)?;
    validate_workers(cfg)?;
    Ok(())
}

fn validate_scheduler(cfg: &RawClusterConfig) -> Result<()> {
    // strategy and locality_tie_break are typed and checked during
    // deserialization.
    if cfg.scheduler.membership_poll_ms == 0 {
        return Err(DistError::ConfigError(
            "[scheduler].membership_poll_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_workers(cfg: &RawClusterConfig) -> Result<()> {
    let mut seen = BTreeSet::new();
    for (i, worker) in cfg.workers.iter().enumerate() {
        let address = worker.address.trim();
        validate_address(&format!("[[worker]] #{i} address"), address)?;
        if worker.ncores == 0 {
            return Err(DistError::ConfigError(format!(
                "worker '{address}' must have ncores >= 1 (got 0)"
            )));
        }
        // Port 0 asks the OS for a fresh port, so repeats are fine.
        if !address.ends_with(":0") && !seen.insert(address) {
            return Err(DistError::ConfigError(format!(
                "worker address '{address}' is listed more than once"
            )));
        }
    }
    Ok(())
}

/// Check that `value` looks like `host:port`.
pub fn validate_address(what: &str, value: &str) -> Result<()> {
    let value = value.trim();
    let Some((host, port)) = value.rsplit_once(':') else {
        return Err(DistError::ConfigError(format!(
            "{what} must be of the form host:port (got '{value}')"
        )));
    };
    if host.is_empty() {
        return Err(DistError::ConfigError(format!(
            "{what} has an empty host (got '{value}')"
        )));
    }
    if port.parse::<u16>().is_err() {
        return Err(DistError::ConfigError(format!(
            "{what} has an invalid port (got '{value}')"
        )));
    }
    Ok(())
}

/// Reject configurations that cannot start an in-process cluster.
pub fn ensure_has_workers(cfg: &ClusterConfig) -> Result<()> {
    if cfg.workers.is_empty() {
        return Err(DistError::ConfigError(
            "config must contain at least one [[worker]] section".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Strategy;

    fn parse(text: &str) -> Result<ClusterConfig> {
        let raw: RawClusterConfig = toml::from_str(text)?;
        ClusterConfig::try_from(raw)
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.coordinator.as_str(), "127.0.0.1:8786");
        assert_eq!(cfg.scheduler.strategy, Strategy::Adaptive);
        assert_eq!(cfg.scheduler.membership_poll_ms, 100);
        assert!(cfg.workers.is_empty());
        assert!(ensure_has_workers(&cfg).is_err());
    }

    #[test]
    fn rejects_zero_cores() {
        let err = parse("[[worker]]\naddress = \"127.0.0.1:9000\"\nncores = 0\n").unwrap_err();
        assert!(matches!(err, DistError::ConfigError(m) if m.contains("ncores")));
    }

    #[test]
    fn rejects_duplicate_workers_but_allows_ephemeral_ports() {
        let dup = "[[worker]]\naddress = \"h:1\"\n[[worker]]\naddress = \"h:1\"\n";
        assert!(parse(dup).is_err());

        let ephemeral = "[[worker]]\naddress = \"h:0\"\n[[worker]]\naddress = \"h:0\"\n";
        assert_eq!(parse(ephemeral).unwrap().workers.len(), 2);
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(validate_address("x", "localhost").is_err());
        assert!(validate_address("x", ":80").is_err());
        assert!(validate_address("x", "host:http").is_err());
        assert!(validate_address("x", "[::1]:80").is_ok());
    }

    #[test]
    fn rejects_unknown_strategy_at_parse_time() {
        let err = parse("[scheduler]\nstrategy = \"random\"\n").unwrap_err();
        assert!(matches!(err, DistError::TomlError(_)));
    }
}
