//! Configuration management commands

use super::ConfigArgs;
use crate::config::Config;
use anyhow::Result;
use std::path::Path;

pub async fn execute(args: ConfigArgs, explicit: Option<&Path>) -> Result<()> {
    if args.init {
        let path = Config::init_default(args.path).await?;
        println!("Configuration initialized at {}", path.display());
        return Ok(());
    }

    if args.show {
        let config = Config::load(explicit).await?;
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    // Default: show help
    println!("Use --show or --init [--path <file>]");
    Ok(())
}
