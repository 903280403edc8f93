// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `stagehand`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Drive a pod through its start and delete workflows on the stage-based task engine.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Stagehand.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Stagehand.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `STAGEHAND_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the container start waves, but start nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// After a successful start, run the pod delete workflow.
    #[arg(long)]
    pub delete: bool,

    /// Skip waiting for the pod address release when deleting.
    #[arg(long, requires = "delete")]
    pub purge: bool,

    /// How long to wait for each workflow to finish (e.g. "30s", "5m").
    #[arg(long, value_name = "DURATION", default_value = "5m")]
    pub wait: String,
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

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
