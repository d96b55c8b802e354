use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Placement policy of the scheduling loop.
///
/// - `Adaptive`: hand out one ready key at a time to a worker with free
///   capacity, preferring workers that already hold the key's inputs.
/// - `Centralized`: distribute every ready key onto per-worker stacks up
///   front, proportional to core count; workers pop their own stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Adaptive,
    Centralized,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "adaptive" => Ok(Strategy::Adaptive),
            "centralized" | "centralised" => Ok(Strategy::Centralized),
            other => Err(format!(
                "invalid strategy: {other} (expected \"adaptive\" or \"centralized\")"
            )),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Adaptive => f.write_str("adaptive"),
            Strategy::Centralized => f.write_str("centralized"),
        }
    }
}

/// How the adaptive strategy picks between free workers holding equally many
/// of a key's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocalityTieBreak {
    /// Lowest `processing / ncores`, then address.
    #[default]
    LeastLoaded,
    /// Lowest address.
    Address,
}

impl FromStr for LocalityTieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "least_loaded" => Ok(LocalityTieBreak::LeastLoaded),
            "address" => Ok(LocalityTieBreak::Address),
            other => Err(format!(
                "invalid locality_tie_break: {other} (expected \"least_loaded\" or \"address\")"
            )),
        }
    }
}
