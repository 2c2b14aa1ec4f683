//! CLI command definitions for the `stepwise` binary.

pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run and inspect Stepwise workflows.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the engine config file.
    #[arg(long, global = true, env = "STEPWISE_CONFIG", default_value = "stepwise.toml")]
    pub config: PathBuf,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate a workflow file.
    Validate {
        /// Path to a `.yaml`, `.yml`, or `.json` workflow file.
        file: PathBuf,
    },

    /// Execute a workflow file once and print its step history.
    Run {
        /// Path to the workflow file.
        file: PathBuf,

        /// JSON object used as the instance's initial data.
        #[arg(long)]
        data: Option<String>,

        /// Override the workflow timeout for this run.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Load a directory of workflows and deliver one event to them.
    Fire {
        /// Directory searched recursively for workflow files.
        dir: PathBuf,

        /// Event name, as declared by a trigger in the config file.
        event: String,

        /// JSON payload delivered with the event.
        #[arg(long)]
        payload: Option<String>,
    },

    /// List built-in actions and conditions.
    Builtins,
}
