//! Configuration system
//!
//! Handles loading configuration from multiple sources, later ones winning:
//! - Global config (`<config dir>/relaychat/config.toml`)
//! - Project config (`./relaychat.toml` or `.relaychat/config.toml`)
//! - An explicit `--config` file
//! - Environment variables (`RELAYCHAT_*`)
//!
//! Files are merged table by table, so a project file only needs the keys it
//! changes.  Arrays (such as `managed_bots`) are replaced, not appended.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::history::DEFAULT_MAX_ENTRIES;
use crate::persona::{PersonaDefaults, PersonaEntry, PersonaProfile, ProfileDirectory, Roster, RosterError};
use crate::relay::{DelayRange, RelaySettings, duration_from_secs};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Compact roster entries:
    /// `platform_id::persona_name::physical_bot_id::keywords_json::base_p::chain_p::blacklist_json`
    #[serde(default)]
    pub managed_bots: Vec<String>,

    #[serde(default)]
    pub relay: RelayConfig,

    /// Fallbacks for roster entries that leave a field empty
    #[serde(default)]
    pub defaults: PersonaDefaults,

    #[serde(default)]
    pub history: HistoryConfig,

    /// Structured roster entries (`[[personas]]`).  Kept as raw values so a
    /// single malformed table is skipped instead of failing the whole file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub personas: Vec<toml::Value>,

    /// System prompt and model per persona name
    #[serde(default)]
    pub profiles: HashMap<String, PersonaProfile>,
}

/// Chain and timing knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: u32,
    #[serde(default = "default_initial_min")]
    pub initial_reply_min_delay_seconds: f64,
    #[serde(default = "default_initial_max")]
    pub initial_reply_max_delay_seconds: f64,
    #[serde(default = "default_chain_min")]
    pub chain_reply_min_delay_seconds: f64,
    #[serde(default = "default_chain_max")]
    pub chain_reply_max_delay_seconds: f64,
    #[serde(default = "default_incentive_probability")]
    pub conversation_incentive_probability: f64,
    /// Zero or negative disables the incentive window
    #[serde(default = "default_incentive_duration")]
    pub conversation_incentive_duration_seconds: f64,
    #[serde(default = "default_lock_release_delay")]
    pub reply_lock_release_delay_seconds: f64,
}

fn default_max_chain_depth() -> u32 {
    1
}

fn default_initial_min() -> f64 {
    0.1
}

fn default_initial_max() -> f64 {
    0.8
}

fn default_chain_min() -> f64 {
    1.0
}

fn default_chain_max() -> f64 {
    3.0
}

fn default_incentive_probability() -> f64 {
    0.9
}

fn default_incentive_duration() -> f64 {
    120.0
}

fn default_lock_release_delay() -> f64 {
    1.0
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: default_max_chain_depth(),
            initial_reply_min_delay_seconds: default_initial_min(),
            initial_reply_max_delay_seconds: default_initial_max(),
            chain_reply_min_delay_seconds: default_chain_min(),
            chain_reply_max_delay_seconds: default_chain_max(),
            conversation_incentive_probability: default_incentive_probability(),
            conversation_incentive_duration_seconds: default_incentive_duration(),
            reply_lock_release_delay_seconds: default_lock_release_delay(),
        }
    }
}

/// History persistence and prompt window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Absolute base directory; defaults to `<data dir>/<directory_name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_history_dir_name")]
    pub directory_name: String,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_prompt_messages")]
    pub max_prompt_messages: usize,
    #[serde(default = "default_prompt_images")]
    pub max_prompt_images: usize,
}

fn default_history_dir_name() -> String {
    "relaychat_history".to_string()
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_prompt_messages() -> usize {
    20
}

fn default_prompt_images() -> usize {
    5
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            directory: None,
            directory_name: default_history_dir_name(),
            max_entries: default_max_entries(),
            max_prompt_messages: default_prompt_messages(),
            max_prompt_images: default_prompt_images(),
        }
    }
}

impl Config {
    /// Load configuration from all sources (global, project, explicit, env)
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut merged = toml::Table::new();

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            merge_tables(&mut merged, read_table(&global_path).await?);
        }

        for name in ["relaychat.toml", ".relaychat/config.toml"] {
            let path = PathBuf::from(name);
            if path.exists() {
                merge_tables(&mut merged, read_table(&path).await?);
            }
        }

        if let Some(path) = explicit {
            merge_tables(&mut merged, read_table(path).await?);
        }

        let mut config: Config = toml::Value::Table(merged)
            .try_into()
            .context("invalid relaychat configuration")?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the global config file path
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "relaychat", "relaychat")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path
    pub fn data_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "relaychat", "relaychat")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Base directory for conversation history files
    pub fn history_dir(&self) -> PathBuf {
        if let Some(dir) = &self.history.directory {
            return dir.clone();
        }
        Self::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(&self.history.directory_name)
    }

    /// A starter configuration with two example personas.
    pub fn sample() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            "Alice".to_string(),
            PersonaProfile {
                system_prompt: Some("You are Alice, cheerful and curious.".to_string()),
                model: None,
            },
        );
        profiles.insert(
            "Bob".to_string(),
            PersonaProfile {
                system_prompt: Some("You are Bob, dry and concise.".to_string()),
                model: None,
            },
        );
        Self {
            managed_bots: vec![
                r#"bot-alice::Alice::10001::["alice"]::0.2::0.8::[]"#.to_string(),
                r#"bot-bob::Bob::10002::["bob"]::0.2::0.8::[]"#.to_string(),
            ],
            profiles,
            ..Self::default()
        }
    }

    /// Write the sample configuration to `path` (or the global location).
    pub async fn init_default(path: Option<PathBuf>) -> Result<PathBuf> {
        let path = match path.or_else(Self::global_config_path) {
            Some(path) => path,
            None => anyhow::bail!("Could not determine config directory"),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(&Self::sample())?;
        fs::write(&path, content).await?;
        tracing::info!("Created config at {:?}", path);
        Ok(path)
    }

    /// Build the persona roster.  Malformed entries are skipped with a
    /// warning; an empty result is an error.
    pub fn build_roster(&self) -> Result<Roster, RosterError> {
        let structured: Vec<PersonaEntry> = self
            .personas
            .iter()
            .enumerate()
            .filter_map(|(index, value)| {
                let parsed: Result<PersonaEntry, _> = value.clone().try_into();
                match parsed {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        tracing::warn!(index, error = %err, "Skipping malformed [[personas]] entry");
                        None
                    }
                }
            })
            .collect();
        Roster::from_entries(&self.managed_bots, structured, &self.defaults)
    }

    pub fn profile_directory(&self) -> ProfileDirectory {
        ProfileDirectory::new(self.profiles.clone())
    }

    pub fn relay_settings(&self) -> RelaySettings {
        let relay = &self.relay;
        let incentive_probability = if (0.0..=1.0).contains(&relay.conversation_incentive_probability) {
            relay.conversation_incentive_probability
        } else {
            tracing::warn!(
                value = relay.conversation_incentive_probability,
                fallback = default_incentive_probability(),
                "conversation_incentive_probability must be in [0, 1], using default"
            );
            default_incentive_probability()
        };
        RelaySettings {
            max_chain_depth: relay.max_chain_depth,
            initial_delay: DelayRange::new(
                relay.initial_reply_min_delay_seconds,
                relay.initial_reply_max_delay_seconds,
            ),
            chain_delay: DelayRange::new(
                relay.chain_reply_min_delay_seconds,
                relay.chain_reply_max_delay_seconds,
            ),
            incentive_probability,
            incentive_duration_secs: relay.conversation_incentive_duration_seconds,
            reply_lock_release_delay: duration_from_secs(
                "reply_lock_release_delay_seconds",
                relay.reply_lock_release_delay_seconds,
            ),
            max_prompt_messages: self.history.max_prompt_messages,
            max_prompt_images: self.history.max_prompt_images,
        }
    }

    /// Apply environment variable overrides
    fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("RELAYCHAT_MAX_CHAIN_DEPTH") {
            match val.trim().parse::<u32>() {
                Ok(depth) => self.relay.max_chain_depth = depth,
                Err(_) => tracing::warn!(value = %val, "Invalid RELAYCHAT_MAX_CHAIN_DEPTH; expected an integer"),
            }
        }
        if let Some(val) = lookup("RELAYCHAT_INCENTIVE_PROBABILITY") {
            match val.trim().parse::<f64>() {
                Ok(p) if (0.0..=1.0).contains(&p) => {
                    self.relay.conversation_incentive_probability = p
                }
                _ => tracing::warn!(
                    value = %val,
                    "Invalid RELAYCHAT_INCENTIVE_PROBABILITY; expected a number in [0, 1]"
                ),
            }
        }
        if let Some(val) = lookup("RELAYCHAT_INCENTIVE_DURATION_SECONDS") {
            match val.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() => {
                    self.relay.conversation_incentive_duration_seconds = secs
                }
                _ => tracing::warn!(value = %val, "Invalid RELAYCHAT_INCENTIVE_DURATION_SECONDS"),
            }
        }
        if let Some(val) = lookup("RELAYCHAT_HISTORY_DIR")
            && !val.trim().is_empty()
        {
            self.history.directory = Some(PathBuf::from(val));
        }
    }
}

async fn read_table(path: &Path) -> Result<toml::Table> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
}

/// Deep-merge `overlay` into `base`; tables merge, everything else replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::from_toml_str("").unwrap();
        let settings = config.relay_settings();
        assert_eq!(settings.max_chain_depth, 1);
        assert_eq!(settings.initial_delay, DelayRange::new(0.1, 0.8));
        assert_eq!(settings.chain_delay, DelayRange::new(1.0, 3.0));
        assert_eq!(settings.incentive_probability, 0.9);
        assert_eq!(settings.incentive_duration_secs, 120.0);
        assert_eq!(settings.reply_lock_release_delay, Duration::from_secs(1));
        assert_eq!(config.defaults.base_reply_probability, 0.1);
        assert_eq!(config.defaults.chain_reply_probability, 0.75);
        assert_eq!(config.history.max_entries, 200);
    }

    #[test]
    fn roster_from_mixed_entries() {
        let config = Config::from_toml_str(
            r#"
managed_bots = [
    'vc-1::Alice::101::["alice"]::0.2::0.8::[]',
    'broken-entry',
]

[defaults]
base_reply_probability = 0.05

[[personas]]
platform_id = "vc-2"
persona_name = "Bob"
physical_bot_id = "102"
keywords = ["bob"]

[[personas]]
platform_id = "vc-3"
persona_name = 42

[profiles.Alice]
system_prompt = "You are Alice."
"#,
        )
        .unwrap();

        let roster = config.build_roster().unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.get("vc-2").unwrap().base_reply_probability, 0.05);
        assert!(roster.get("vc-2").unwrap().keywords.contains("bob"));
        assert_eq!(
            config.profile_directory().system_prompt("Alice"),
            "You are Alice."
        );
    }

    #[test]
    fn out_of_range_relay_values_are_contained() {
        let config = Config::from_toml_str(
            "[relay]\nconversation_incentive_probability = 1.5\nreply_lock_release_delay_seconds = 1e30\n",
        )
        .unwrap();
        let settings = config.relay_settings();
        assert_eq!(settings.incentive_probability, 0.9);
        assert_eq!(
            settings.reply_lock_release_delay,
            crate::relay::MAX_CONFIGURED_DURATION
        );

        let config =
            Config::from_toml_str("[relay]\nconversation_incentive_probability = -0.1\n").unwrap();
        assert_eq!(config.relay_settings().incentive_probability, 0.9);
    }

    #[test]
    fn empty_roster_is_an_error() {
        let config = Config::default();
        assert_eq!(config.build_roster().unwrap_err(), RosterError::Empty);
    }

    #[test]
    fn merge_is_deep_for_tables() {
        let mut base: toml::Table = toml::from_str(
            "managed_bots = ['a']\n[relay]\nmax_chain_depth = 1\nchain_reply_min_delay_seconds = 2.0\n",
        )
        .unwrap();
        let overlay: toml::Table =
            toml::from_str("managed_bots = ['b']\n[relay]\nmax_chain_depth = 3\n").unwrap();
        merge_tables(&mut base, overlay);
        let config: Config = toml::Value::Table(base).try_into().unwrap();
        assert_eq!(config.managed_bots, vec!["b"]);
        assert_eq!(config.relay.max_chain_depth, 3);
        assert_eq!(config.relay.chain_reply_min_delay_seconds, 2.0);
    }

    #[test]
    fn overrides_apply_and_ignore_garbage() {
        let mut config = Config::default();
        let vars: HashMap<&str, &str> = [
            ("RELAYCHAT_MAX_CHAIN_DEPTH", "4"),
            ("RELAYCHAT_INCENTIVE_PROBABILITY", "7"),
            ("RELAYCHAT_INCENTIVE_DURATION_SECONDS", "-1"),
            ("RELAYCHAT_HISTORY_DIR", "/tmp/hist"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.relay.max_chain_depth, 4);
        assert_eq!(config.relay.conversation_incentive_probability, 0.9);
        assert_eq!(config.relay.conversation_incentive_duration_seconds, -1.0);
        assert_eq!(config.history_dir(), PathBuf::from("/tmp/hist"));
    }

    #[test]
    fn sample_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::sample()).unwrap();
        let parsed = Config::from_toml_str(&text).unwrap();
        assert_eq!(parsed.build_roster().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn init_default_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relaychat.toml");
        let written = Config::init_default(Some(path.clone())).await.unwrap();
        assert_eq!(written, path);
        let loaded = Config::load(Some(&path)).await.unwrap();
        assert_eq!(loaded.managed_bots.len(), 2);
    }
}
