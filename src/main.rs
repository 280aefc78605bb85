//! relaychat - multi-persona chat relay
//!
//! Command-line entry point: configuration checks and an in-process
//! simulator for the relay engine.

use clap::Parser;
use relaychat::cli::{self, Cli, Command};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level.to_lowercase()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Command::Check => cli::check::execute(config).await,
        Command::Config(args) => cli::config::execute(args, config).await,
        Command::Simulate(args) => cli::simulate::execute(args, config).await,
    }
}
