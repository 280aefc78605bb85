//! `relaychat check`: validate configuration and print the roster

use crate::config::Config;
use anyhow::{Context, Result};
use std::path::Path;

pub async fn execute(explicit: Option<&Path>) -> Result<()> {
    let config = Config::load(explicit).await?;
    let roster = config
        .build_roster()
        .context("persona roster is unusable")?;
    let settings = config.relay_settings();
    let profiles = config.profile_directory();

    println!("{} managed persona(s):", roster.len());
    for persona in roster.iter() {
        let keywords: Vec<&str> = persona.keywords.iter().map(String::as_str).collect();
        let blacklist: Vec<&str> = persona
            .blacklist_keywords
            .iter()
            .map(String::as_str)
            .collect();
        println!(
            "  {:<16} {:<12} bot={:<12} base={:.2} chain={:.2} model={}",
            persona.platform_id,
            persona.persona_name,
            persona.physical_bot_id,
            persona.base_reply_probability,
            persona.chain_reply_probability,
            profiles.model(&persona.persona_name).unwrap_or("default"),
        );
        if !keywords.is_empty() {
            println!("      keywords: {}", keywords.join(", "));
        }
        if !blacklist.is_empty() {
            println!("      blacklist: {}", blacklist.join(", "));
        }
    }
    println!();
    println!(
        "max chain depth {}, chain delay {:.1}-{:.1}s, incentive {:.0}% for {}s",
        settings.max_chain_depth,
        settings.chain_delay.min_secs,
        settings.chain_delay.max_secs,
        settings.incentive_probability * 100.0,
        settings.incentive_duration_secs,
    );
    println!("history: {}", config.history_dir().display());
    Ok(())
}
