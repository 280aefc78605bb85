//! Persona roster
//!
//! Every managed platform connection is bound to exactly one persona.  The
//! roster is built once at startup from configuration and is read-only
//! afterwards, so it is shared as a plain `Arc<Roster>` without locking.
//!
//! Two entry formats are accepted:
//!
//! - the compact legacy string
//!   `platform_id::persona_name::physical_bot_id::keywords_json::base_p::chain_p::blacklist_json`
//! - structured [`PersonaEntry`] tables where omitted fields fall back to
//!   [`PersonaDefaults`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Number of `::` separated segments in a legacy roster entry.
const LEGACY_SEGMENTS: usize = 7;

// ─── Errors ──────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RosterError {
    #[error("no valid persona entries configured; at least one managed bot is required")]
    Empty,
    #[error("entry has {found} segments, expected at least 7")]
    MalformedEntry { found: usize },
    #[error("entry is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid {field}: {value:?}")]
    InvalidProbability { field: &'static str, value: String },
    #[error("{field} is not a JSON list: {value:?}")]
    InvalidKeywordList { field: &'static str, value: String },
    #[error("platform id `{0}` is already bound to another persona")]
    DuplicatePlatform(String),
}

// ─── Persona configuration ───────────────────────────────────────────────

/// Global fallbacks applied to roster entries that leave a field empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaDefaults {
    #[serde(default = "default_base_probability")]
    pub base_reply_probability: f64,
    #[serde(default = "default_chain_probability")]
    pub chain_reply_probability: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

fn default_base_probability() -> f64 {
    0.1
}

fn default_chain_probability() -> f64 {
    0.75
}

impl Default for PersonaDefaults {
    fn default() -> Self {
        Self {
            base_reply_probability: default_base_probability(),
            chain_reply_probability: default_chain_probability(),
            keywords: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

/// One persona bound to one platform connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub platform_id: String,
    pub persona_name: String,
    /// The bot's own user id on the chat network.
    pub physical_bot_id: String,
    /// Trimmed, lower-cased trigger keywords.
    pub keywords: BTreeSet<String>,
    /// Trimmed, lower-cased keywords that silence this persona.
    pub blacklist_keywords: BTreeSet<String>,
    pub base_reply_probability: f64,
    pub chain_reply_probability: f64,
}

impl PersonaConfig {
    pub fn new(
        platform_id: impl Into<String>,
        persona_name: impl Into<String>,
        physical_bot_id: impl Into<String>,
    ) -> Self {
        let defaults = PersonaDefaults::default();
        Self {
            platform_id: platform_id.into(),
            persona_name: persona_name.into(),
            physical_bot_id: physical_bot_id.into(),
            keywords: BTreeSet::new(),
            blacklist_keywords: BTreeSet::new(),
            base_reply_probability: defaults.base_reply_probability,
            chain_reply_probability: defaults.chain_reply_probability,
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.keywords = normalize_keywords(keywords);
        self
    }

    pub fn with_blacklist<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blacklist_keywords = normalize_keywords(keywords);
        self
    }

    pub fn with_probabilities(mut self, base: f64, chain: f64) -> Self {
        self.base_reply_probability = base;
        self.chain_reply_probability = chain;
        self
    }

    /// Case-insensitive substring match against the trigger keywords.
    pub fn matches_keyword(&self, text: &str) -> bool {
        contains_any(&self.keywords, text)
    }

    /// Case-insensitive substring match against the blacklist.
    pub fn matches_blacklist(&self, text: &str) -> bool {
        contains_any(&self.blacklist_keywords, text)
    }

    /// Whether this persona can be targeted by chain continuations.
    pub fn has_physical_identity(&self) -> bool {
        !self.physical_bot_id.trim().is_empty()
    }
}

fn normalize_keywords<I, S>(keywords: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keywords
        .into_iter()
        .map(|k| k.as_ref().trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

fn contains_any(keywords: &BTreeSet<String>, text: &str) -> bool {
    if keywords.is_empty() || text.is_empty() {
        return false;
    }
    let lowered = text.to_lowercase();
    keywords.iter().any(|k| lowered.contains(k.as_str()))
}

fn validate_probability(field: &'static str, value: f64) -> Result<f64, RosterError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(RosterError::InvalidProbability {
            field,
            value: value.to_string(),
        })
    }
}

// ─── Entry parsing ───────────────────────────────────────────────────────

/// Structured roster entry as written in a `[[personas]]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaEntry {
    pub platform_id: String,
    pub persona_name: String,
    pub physical_bot_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blacklist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_reply_probability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_reply_probability: Option<f64>,
}

impl PersonaEntry {
    /// Resolve against the global defaults and validate.
    pub fn resolve(self, defaults: &PersonaDefaults) -> Result<PersonaConfig, RosterError> {
        let platform_id = required("platform_id", &self.platform_id)?;
        let persona_name = required("persona_name", &self.persona_name)?;
        let physical_bot_id = required("physical_bot_id", &self.physical_bot_id)?;
        let base = validate_probability(
            "base_reply_probability",
            self.base_reply_probability
                .unwrap_or(defaults.base_reply_probability),
        )?;
        let chain = validate_probability(
            "chain_reply_probability",
            self.chain_reply_probability
                .unwrap_or(defaults.chain_reply_probability),
        )?;

        Ok(PersonaConfig::new(platform_id, persona_name, physical_bot_id)
            .with_keywords(self.keywords.unwrap_or_else(|| defaults.keywords.clone()))
            .with_blacklist(self.blacklist.unwrap_or_else(|| defaults.blacklist.clone()))
            .with_probabilities(base, chain))
    }
}

fn required(field: &'static str, value: &str) -> Result<String, RosterError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(RosterError::MissingField(field))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Parse one compact legacy entry.
///
/// Empty keyword, probability and blacklist segments take the global default.
/// A keyword segment that is valid JSON but not an array also falls back to
/// the default list; one that is not JSON at all rejects the entry.
pub fn parse_legacy_entry(
    raw: &str,
    defaults: &PersonaDefaults,
) -> Result<PersonaConfig, RosterError> {
    let parts: Vec<&str> = raw.split("::").map(str::trim).collect();
    if parts.len() < LEGACY_SEGMENTS {
        return Err(RosterError::MalformedEntry { found: parts.len() });
    }

    let keywords = parse_keyword_list(parts[3], "keywords", &defaults.keywords)?;
    let blacklist = parse_keyword_list(parts[6], "blacklist", &defaults.blacklist)?;

    let entry = PersonaEntry {
        platform_id: parts[0].to_string(),
        persona_name: parts[1].to_string(),
        physical_bot_id: parts[2].to_string(),
        keywords: Some(keywords),
        blacklist: Some(blacklist),
        base_reply_probability: parse_probability(parts[4], "base_reply_probability")?,
        chain_reply_probability: parse_probability(parts[5], "chain_reply_probability")?,
    };
    entry.resolve(defaults)
}

fn parse_probability(segment: &str, field: &'static str) -> Result<Option<f64>, RosterError> {
    if segment.is_empty() {
        return Ok(None);
    }
    segment
        .parse::<f64>()
        .map(Some)
        .map_err(|_| RosterError::InvalidProbability {
            field,
            value: segment.to_string(),
        })
}

fn parse_keyword_list(
    segment: &str,
    field: &'static str,
    fallback: &[String],
) -> Result<Vec<String>, RosterError> {
    if segment.is_empty() {
        return Ok(fallback.to_vec());
    }
    match serde_json::from_str::<serde_json::Value>(segment) {
        Ok(serde_json::Value::Array(items)) => Ok(items
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                other if !other.is_null() => Some(other.to_string()),
                _ => None,
            })
            .collect()),
        Ok(_) => {
            tracing::warn!(field, segment, "Keyword list is not a JSON array, using defaults");
            Ok(fallback.to_vec())
        }
        Err(err) => {
            tracing::debug!(field, segment, error = %err, "Keyword list is not valid JSON");
            Err(RosterError::InvalidKeywordList {
                field,
                value: segment.to_string(),
            })
        }
    }
}

// ─── Roster ──────────────────────────────────────────────────────────────

/// Ordered, immutable table of personas keyed by platform id.
#[derive(Debug, Clone)]
pub struct Roster {
    personas: Vec<PersonaConfig>,
    by_platform: HashMap<String, usize>,
}

impl Roster {
    /// Build a roster, keeping the first persona for any repeated platform id.
    ///
    /// Fails with [`RosterError::Empty`] when nothing survives.
    pub fn new(personas: impl IntoIterator<Item = PersonaConfig>) -> Result<Self, RosterError> {
        let mut roster = Self {
            personas: Vec::new(),
            by_platform: HashMap::new(),
        };
        for persona in personas {
            if let Err(err) = roster.insert(persona) {
                tracing::warn!(error = %err, "Skipping roster entry");
            }
        }
        if roster.personas.is_empty() {
            return Err(RosterError::Empty);
        }
        Ok(roster)
    }

    /// Build from legacy strings and structured entries.  Invalid entries are
    /// logged and skipped.
    pub fn from_entries(
        legacy: &[String],
        structured: Vec<PersonaEntry>,
        defaults: &PersonaDefaults,
    ) -> Result<Self, RosterError> {
        let mut parsed = Vec::with_capacity(legacy.len() + structured.len());
        for (index, raw) in legacy.iter().enumerate() {
            match parse_legacy_entry(raw, defaults) {
                Ok(persona) => parsed.push(persona),
                Err(err) => tracing::warn!(index, entry = %raw, error = %err, "Skipping managed bot entry"),
            }
        }
        for (index, entry) in structured.into_iter().enumerate() {
            let platform_id = entry.platform_id.clone();
            match entry.resolve(defaults) {
                Ok(persona) => parsed.push(persona),
                Err(err) => tracing::warn!(index, platform_id = %platform_id, error = %err, "Skipping persona entry"),
            }
        }
        Self::new(parsed)
    }

    fn insert(&mut self, persona: PersonaConfig) -> Result<(), RosterError> {
        if self.by_platform.contains_key(&persona.platform_id) {
            return Err(RosterError::DuplicatePlatform(persona.platform_id));
        }
        tracing::info!(
            platform_id = %persona.platform_id,
            persona = %persona.persona_name,
            bot_id = %persona.physical_bot_id,
            base_p = persona.base_reply_probability,
            chain_p = persona.chain_reply_probability,
            "Persona registered"
        );
        self.by_platform
            .insert(persona.platform_id.clone(), self.personas.len());
        self.personas.push(persona);
        Ok(())
    }

    pub fn get(&self, platform_id: &str) -> Option<&PersonaConfig> {
        self.by_platform
            .get(platform_id)
            .map(|&index| &self.personas[index])
    }

    /// Personas in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &PersonaConfig> {
        self.personas.iter()
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    /// True when `sender_id` is one of the managed bots' own ids.
    pub fn is_managed_sender(&self, sender_id: &str) -> bool {
        !sender_id.is_empty() && self.personas.iter().any(|p| p.physical_bot_id == sender_id)
    }
}

// ─── Profiles ────────────────────────────────────────────────────────────

/// Generation settings attached to a persona name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Lookup table of profiles by persona name.
#[derive(Debug, Clone, Default)]
pub struct ProfileDirectory {
    profiles: HashMap<String, PersonaProfile>,
}

impl ProfileDirectory {
    pub fn new(profiles: HashMap<String, PersonaProfile>) -> Self {
        Self { profiles }
    }

    pub fn system_prompt(&self, persona_name: &str) -> &str {
        self.profiles
            .get(persona_name)
            .and_then(|p| p.system_prompt.as_deref())
            .unwrap_or("")
    }

    pub fn model(&self, persona_name: &str) -> Option<&str> {
        self.profiles
            .get(persona_name)
            .and_then(|p| p.model.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_entry_parses_all_fields() {
        let defaults = PersonaDefaults::default();
        let persona = parse_legacy_entry(
            r#"vc-1::Alice::101::["Hello", " TEA "]::0.2::0.9::["spam"]"#,
            &defaults,
        )
        .unwrap();
        assert_eq!(persona.platform_id, "vc-1");
        assert_eq!(persona.persona_name, "Alice");
        assert_eq!(persona.physical_bot_id, "101");
        assert!(persona.keywords.contains("hello"));
        assert!(persona.keywords.contains("tea"));
        assert!(persona.blacklist_keywords.contains("spam"));
        assert_eq!(persona.base_reply_probability, 0.2);
        assert_eq!(persona.chain_reply_probability, 0.9);
    }

    #[test]
    fn legacy_entry_empty_fields_use_defaults() {
        let defaults = PersonaDefaults {
            base_reply_probability: 0.3,
            chain_reply_probability: 0.4,
            keywords: vec!["ping".into()],
            blacklist: vec!["ad".into()],
        };
        let persona = parse_legacy_entry("vc-1::Alice::101::::::", &defaults).unwrap();
        assert_eq!(persona.base_reply_probability, 0.3);
        assert_eq!(persona.chain_reply_probability, 0.4);
        assert!(persona.keywords.contains("ping"));
        assert!(persona.blacklist_keywords.contains("ad"));
    }

    #[test]
    fn legacy_entry_rejects_short_and_bad_probability() {
        let defaults = PersonaDefaults::default();
        assert_eq!(
            parse_legacy_entry("vc-1::Alice::101", &defaults),
            Err(RosterError::MalformedEntry { found: 3 })
        );
        assert!(matches!(
            parse_legacy_entry("vc-1::Alice::101::[]::abc::0.5::[]", &defaults),
            Err(RosterError::InvalidProbability { .. })
        ));
        assert!(matches!(
            parse_legacy_entry("vc-1::Alice::101::[]::1.5::0.5::[]", &defaults),
            Err(RosterError::InvalidProbability { .. })
        ));
        assert_eq!(
            parse_legacy_entry("vc-1::::101::[]::0.1::0.5::[]", &defaults),
            Err(RosterError::MissingField("persona_name"))
        );
    }

    #[test]
    fn non_array_keywords_fall_back() {
        let defaults = PersonaDefaults {
            keywords: vec!["fallback".into()],
            ..PersonaDefaults::default()
        };
        let persona =
            parse_legacy_entry(r#"vc-1::Alice::101::{"a":1}::0.1::0.5::[]"#, &defaults).unwrap();
        assert!(persona.keywords.contains("fallback"));
    }

    #[test]
    fn unparseable_keyword_lists_reject_the_entry() {
        let defaults = PersonaDefaults::default();
        assert_eq!(
            parse_legacy_entry("vc-1::Alice::101::not json::0.2::0.8::[]", &defaults),
            Err(RosterError::InvalidKeywordList {
                field: "keywords",
                value: "not json".into(),
            })
        );
        assert!(matches!(
            parse_legacy_entry(r#"vc-1::Alice::101::[]::0.2::0.8::["spoiler""#, &defaults),
            Err(RosterError::InvalidKeywordList { field: "blacklist", .. })
        ));

        let roster = Roster::from_entries(
            &[
                "vc-1::Alice::101::[]::0.2::0.8::[spoiler]".to_string(),
                "vc-2::Bob::102::[]::0.2::0.8::[]".to_string(),
            ],
            Vec::new(),
            &defaults,
        )
        .unwrap();
        assert_eq!(roster.len(), 1);
        assert!(roster.get("vc-1").is_none());
    }

    #[test]
    fn roster_skips_invalid_and_duplicates() {
        let defaults = PersonaDefaults::default();
        let roster = Roster::from_entries(
            &[
                "vc-1::Alice::101::[]::0.1::0.5::[]".to_string(),
                "garbage".to_string(),
                "vc-1::Other::999::[]::0.1::0.5::[]".to_string(),
            ],
            vec![PersonaEntry {
                platform_id: "vc-2".into(),
                persona_name: "Bob".into(),
                physical_bot_id: "102".into(),
                ..PersonaEntry::default()
            }],
            &defaults,
        )
        .unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.get("vc-1").unwrap().persona_name, "Alice");
        assert_eq!(roster.get("vc-2").unwrap().persona_name, "Bob");
        assert!(roster.is_managed_sender("102"));
        assert!(!roster.is_managed_sender("999"));
        assert!(!roster.is_managed_sender(""));
    }

    #[test]
    fn empty_roster_is_fatal() {
        let defaults = PersonaDefaults::default();
        let err = Roster::from_entries(&["bad".to_string()], Vec::new(), &defaults).unwrap_err();
        assert_eq!(err, RosterError::Empty);
    }

    #[test]
    fn keyword_matching_is_case_insensitive_and_skips_blanks() {
        let persona = PersonaConfig::new("p", "P", "1").with_keywords(["  ", "Coffee"]);
        assert_eq!(persona.keywords.len(), 1);
        assert!(persona.matches_keyword("who wants COFFEE?"));
        assert!(!persona.matches_keyword("tea please"));
        assert!(!persona.matches_blacklist("anything"));
    }

    #[test]
    fn profile_lookup_defaults_to_empty_prompt() {
        let mut profiles = HashMap::new();
        profiles.insert(
            "Alice".to_string(),
            PersonaProfile {
                system_prompt: Some("You are Alice.".into()),
                model: Some("small".into()),
            },
        );
        let dir = ProfileDirectory::new(profiles);
        assert_eq!(dir.system_prompt("Alice"), "You are Alice.");
        assert_eq!(dir.model("Alice"), Some("small"));
        assert_eq!(dir.system_prompt("Bob"), "");
        assert_eq!(dir.model("Bob"), None);
    }
}
