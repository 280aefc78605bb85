//! CLI command definitions and handlers

pub mod check;
pub mod config;
pub mod simulate;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// relaychat - multi-persona chat relay
///
/// Decides which managed personas answer a message and relays their replies
/// to each other as bounded bot-to-bot chains.
#[derive(Parser, Debug)]
#[command(name = "relaychat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file layered on top of the global and project files
    #[arg(short, long, global = true, env = "RELAYCHAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, value_parser = ["DEBUG", "INFO", "WARN", "ERROR"])]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate the configuration and print the persona roster
    Check,

    /// Show or initialize configuration
    Config(ConfigArgs),

    /// Run an in-process conversation through the relay
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Show the merged configuration
    #[arg(long)]
    pub show: bool,

    /// Write a starter configuration
    #[arg(long)]
    pub init: bool,

    /// Where `--init` writes (defaults to the global config path)
    #[arg(long)]
    pub path: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Message text sent by the simulated human
    pub message: String,

    /// Conversation (group or private) id
    #[arg(long, default_value = "sim-group")]
    pub session: String,

    /// Sender id of the simulated human
    #[arg(long, default_value = "human-1")]
    pub sender: String,

    /// Display name of the simulated human
    #[arg(long, default_value = "Human")]
    pub sender_name: String,

    /// Send as a private message to the first persona instead of the group
    #[arg(long)]
    pub direct: bool,

    /// Seed for reproducible decisions
    #[arg(long)]
    pub seed: Option<u64>,

    /// Stop after this many seconds without relay activity
    #[arg(long, default_value_t = 5)]
    pub quiet_secs: u64,

    /// Persist history to the configured directory instead of memory
    #[arg(long)]
    pub persist: bool,

    /// Skip the configured initial and chain delays
    #[arg(long)]
    pub fast: bool,

    /// Print the metrics snapshot as JSON
    #[arg(long)]
    pub json: bool,
}
