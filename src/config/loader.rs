// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ClusterConfig, RawClusterConfig};
use crate::errors::Result;

/// Read and deserialize a cluster config without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawClusterConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawClusterConfig = toml::from_str(&contents)?;

    Ok(config)
}

/// Read, deserialize and validate a cluster config.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ClusterConfig> {
    let raw_config = load_from_path(&path)?;
    let config = ClusterConfig::try_from(raw_config)?;
    Ok(config)
}

/// Like [`load_and_validate`], but a missing file at the default location
/// yields the built-in defaults instead of an error.
pub fn load_or_default(path: impl AsRef<Path>) -> Result<ClusterConfig> {
    let path = path.as_ref();
    if !path.exists() && path == default_config_path() {
        return ClusterConfig::try_from(RawClusterConfig::default());
    }
    load_and_validate(path)
}

/// `Distdag.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Distdag.toml")
}
