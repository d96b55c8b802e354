// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::types::Strategy;

/// Command-line arguments for `distdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "distdag",
    version,
    about = "Run task graphs on a coordinator and a pool of workers.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the cluster config file (TOML).
    ///
    /// Default: `Distdag.toml` in the current working directory; built-in
    /// defaults are used when that file does not exist.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DISTDAG_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a coordinator until it is terminated.
    Coordinator {
        /// Listen address; defaults to `[coordinator].address`.
        #[arg(long, value_name = "HOST:PORT")]
        address: Option<String>,
    },

    /// Run a worker until it is terminated.
    Worker {
        /// Listen address. Port 0 picks a free port.
        #[arg(long, value_name = "HOST:PORT", default_value = "127.0.0.1:0")]
        address: String,

        /// Number of tasks run at once.
        #[arg(long, default_value_t = 1)]
        ncores: usize,

        /// Coordinator to register with; defaults to `[coordinator].address`.
        #[arg(long, value_name = "HOST:PORT")]
        coordinator: Option<String>,
    },

    /// Compute keys of a graph on a running cluster.
    Get {
        #[command(flatten)]
        request: RequestArgs,

        /// Coordinator of the cluster; defaults to `[coordinator].address`.
        #[arg(long, value_name = "HOST:PORT")]
        coordinator: Option<String>,

        /// Placement strategy; defaults to `[scheduler].strategy`.
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
    },

    /// Start the configured cluster in this process, compute keys, stop it.
    Local {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Print the core count of every registered worker.
    Ncores {
        #[arg(long, value_name = "HOST:PORT")]
        coordinator: Option<String>,
    },

    /// Ask a coordinator or worker to shut down.
    Terminate {
        #[arg(long, value_name = "HOST:PORT")]
        address: String,

        /// Drop open connections instead of letting them finish.
        #[arg(long)]
        close: bool,
    },
}

/// A graph file and the keys wanted from it.
#[derive(Debug, Clone, Args)]
pub struct RequestArgs {
    /// JSON file mapping keys to task expressions.
    #[arg(long, value_name = "FILE")]
    pub graph: PathBuf,

    /// Requested keys as JSON: `"z"` or `["total", ["c"]]`.
    #[arg(long, value_name = "JSON")]
    pub keys: String,

    /// Print values instead of their locations.
    #[arg(long)]
    pub gather: bool,

    /// Validate and print the dependency index and initial state without
    /// executing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// With `--dry-run`, also evaluate the request in this process.
    #[arg(long, requires = "dry_run")]
    pub evaluate: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum StrategyArg {
    Adaptive,
    Centralized,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Adaptive => Strategy::Adaptive,
            StrategyArg::Centralized => Strategy::Centralized,
        }
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_with_global_flags_after_subcommand() {
        let args = CliArgs::try_parse_from([
            "distdag",
            "get",
            "--graph",
            "g.json",
            "--keys",
            r#"["z"]"#,
            "--gather",
            "--strategy",
            "centralized",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        match args.command {
            Command::Get {
                request, strategy, ..
            } => {
                assert!(request.gather);
                assert!(!request.dry_run);
                assert!(matches!(strategy, Some(StrategyArg::Centralized)));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn evaluate_requires_dry_run() {
        let err = CliArgs::try_parse_from([
            "distdag", "local", "--graph", "g.json", "--keys", "\"z\"", "--evaluate",
        ]);
        assert!(err.is_err());
    }
}
