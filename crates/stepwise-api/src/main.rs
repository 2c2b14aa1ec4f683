//! Stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, sets up tracing, loads `stepwise.toml`, then
//! dispatches to the command handler.

mod cli;

use clap::Parser;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stepwise_core=debug,stepwise_infra=debug",
        _ => "trace",
    };
    stepwise_observe::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let config = stepwise_infra::config::load_config(&cli.config).await;

    let result = match cli.command {
        Commands::Validate { file } => cli::workflow::handle_validate(&file, cli.json),
        Commands::Run {
            file,
            data,
            timeout_ms,
        } => {
            cli::workflow::handle_run(&config, &file, data.as_deref(), timeout_ms, cli.json).await
        }
        Commands::Fire {
            dir,
            event,
            payload,
        } => cli::workflow::handle_fire(&config, &dir, &event, payload.as_deref(), cli.json).await,
        Commands::Builtins => cli::workflow::handle_builtins(cli.json),
    };

    stepwise_observe::shutdown_tracing();
    result
}
