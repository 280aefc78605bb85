//! Conversation history
//!
//! Every conversation keeps a bounded list of [`HistoryEntry`] records: human
//! messages as they arrive and bot replies once delivered.  Because the same
//! human message reaches every managed connection, the raw history contains
//! duplicates; [`dedup_history`] collapses them before prompt assembly.

pub mod dedup;
pub mod file_store;

pub use dedup::dedup_history;
pub use file_store::JsonFileHistoryStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::relay::message::{BASE64_IMAGE_PREFIX, InboundMessage, MessageKind};

/// Default number of entries retained per conversation.
pub const DEFAULT_MAX_ENTRIES: usize = 200;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub name: String,
    pub user_id: String,
    pub time: String,
    pub text: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64_uri: Option<String>,
}

impl HistoryEntry {
    /// Entry for an inbound human message.
    pub fn from_user(message: &InboundMessage) -> Self {
        Self {
            role: HistoryRole::User,
            name: message.sender_name.clone(),
            user_id: message.sender_id.clone(),
            time: Local::now().format(TIME_FORMAT).to_string(),
            text: message.outline(),
            message_id: message.id.clone(),
            image_base64_uri: message
                .images()
                .find(|uri| uri.starts_with(BASE64_IMAGE_PREFIX))
                .map(str::to_string),
        }
    }

    /// Entry for a delivered bot reply to `trigger_message_id`.
    pub fn from_bot_reply(
        persona_name: &str,
        bot_id: &str,
        trigger_message_id: &str,
        text: String,
        image: Option<String>,
    ) -> Self {
        Self {
            role: HistoryRole::Assistant,
            name: format!("Bot_{persona_name}"),
            user_id: bot_id.to_string(),
            time: Local::now().format(TIME_FORMAT).to_string(),
            text,
            message_id: format!("{trigger_message_id}_bot_reply"),
            image_base64_uri: image,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationScope {
    Group,
    Private,
}

impl ConversationScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Private => "private",
        }
    }
}

/// Identifies one stored conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub platform_kind: String,
    pub scope: ConversationScope,
    pub conversation_id: String,
}

impl ConversationKey {
    /// Groups are keyed by session.  Private chats use the session unless it
    /// is the bot's own id, in which case the sender is the counterpart.
    pub fn for_message(message: &InboundMessage) -> Option<Self> {
        let (scope, id) = match message.kind {
            MessageKind::Group => (ConversationScope::Group, message.session_id.as_str()),
            MessageKind::Direct => {
                let id = if message.session_id.is_empty() || message.session_id == message.self_id {
                    message.sender_id.as_str()
                } else {
                    message.session_id.as_str()
                };
                (ConversationScope::Private, id)
            }
        };
        if id.trim().is_empty() {
            tracing::warn!(
                platform_id = %message.platform_id,
                message_id = %message.id,
                "Cannot determine conversation id for history"
            );
            return None;
        }
        let platform_kind = if message.platform_kind.trim().is_empty() {
            "unknown_platform".to_string()
        } else {
            message.platform_kind.clone()
        };
        Some(Self {
            platform_kind,
            scope,
            conversation_id: id.to_string(),
        })
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.platform_kind,
            self.scope.as_str(),
            self.conversation_id
        )
    }
}

/// Persistent per-conversation history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one entry, trimming to the store's capacity.
    async fn append(&self, key: &ConversationKey, entry: HistoryEntry) -> Result<()>;

    /// All entries in chronological order.
    async fn read_all(&self, key: &ConversationKey) -> Result<Vec<HistoryEntry>>;

    /// Drop the conversation.  Returns whether anything was removed.
    async fn clear(&self, key: &ConversationKey) -> Result<bool>;
}

/// History kept in process memory.
#[derive(Debug)]
pub struct InMemoryHistoryStore {
    max_entries: usize,
    conversations: Mutex<HashMap<ConversationKey, Vec<HistoryEntry>>>,
}

impl InMemoryHistoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            conversations: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, key: &ConversationKey, entry: HistoryEntry) -> Result<()> {
        let mut conversations = self.conversations.lock();
        let entries = conversations.entry(key.clone()).or_default();
        entries.push(entry);
        trim_to(entries, self.max_entries);
        Ok(())
    }

    async fn read_all(&self, key: &ConversationKey) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .conversations
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, key: &ConversationKey) -> Result<bool> {
        Ok(self.conversations.lock().remove(key).is_some())
    }
}

pub(crate) fn trim_to(entries: &mut Vec<HistoryEntry>, max_entries: usize) {
    if entries.len() > max_entries {
        let excess = entries.len() - max_entries;
        entries.drain(..excess);
    }
}

// ─── Prompt formatting ───────────────────────────────────────────────────

/// History rendered for a prompt, plus the images it references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormattedHistory {
    pub text: String,
    /// Chronological `base64://` image references.
    pub images: Vec<String>,
}

/// Render the last `max_messages` entries and collect up to `max_images` of
/// the most recent inline images among them.
pub fn format_for_prompt(
    entries: &[HistoryEntry],
    max_messages: usize,
    max_images: usize,
) -> FormattedHistory {
    let start = entries.len().saturating_sub(max_messages);
    let window = &entries[start..];

    let mut images: Vec<String> = window
        .iter()
        .rev()
        .filter_map(|e| e.image_base64_uri.as_deref())
        .filter(|uri| uri.starts_with(BASE64_IMAGE_PREFIX))
        .take(max_images)
        .map(str::to_string)
        .collect();
    images.reverse();

    let text = window
        .iter()
        .map(|e| {
            let content = e.text.replace(['\n', '\r'], " ");
            format!(
                "Sender: {} (ID: {})\nTime: {}\nContent: {}",
                e.name, e.user_id, e.time, content
            )
        })
        .collect::<Vec<_>>()
        .join("\n-\n");

    FormattedHistory { text, images }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::message::MessagePart;

    fn entry(name: &str, text: &str, image: Option<&str>) -> HistoryEntry {
        HistoryEntry {
            role: HistoryRole::User,
            name: name.into(),
            user_id: format!("{name}-id"),
            time: "2024-01-01 10:00:00".into(),
            text: text.into(),
            message_id: format!("{name}-{text}"),
            image_base64_uri: image.map(str::to_string),
        }
    }

    #[test]
    fn conversation_key_for_private_uses_counterpart() {
        let msg = InboundMessage::direct("p1", "u1", "hi")
            .with_platform_kind("qq")
            .with_self_id("bot");
        let key = ConversationKey::for_message(&msg).unwrap();
        assert_eq!(key.scope, ConversationScope::Private);
        assert_eq!(key.conversation_id, "u1");

        let mut own_session = msg.clone();
        own_session.session_id = "bot".into();
        let key = ConversationKey::for_message(&own_session).unwrap();
        assert_eq!(key.conversation_id, "u1");

        let group = InboundMessage::group("p1", "", "u1", "hi");
        assert!(ConversationKey::for_message(&group).is_none());
    }

    #[test]
    fn user_entry_captures_inline_image() {
        let msg = InboundMessage::group("p1", "g1", "u1", "look")
            .with_sender_name("Ann")
            .with_part(MessagePart::image("https://x/cat.png"))
            .with_part(MessagePart::image("base64://AAAA"));
        let entry = HistoryEntry::from_user(&msg);
        assert_eq!(entry.role, HistoryRole::User);
        assert_eq!(entry.name, "Ann");
        assert_eq!(entry.text, "look [image] [image]");
        assert_eq!(entry.image_base64_uri.as_deref(), Some("base64://AAAA"));
    }

    #[test]
    fn bot_entry_naming() {
        let entry = HistoryEntry::from_bot_reply("Alice", "101", "m1", "hey".into(), None);
        assert_eq!(entry.role, HistoryRole::Assistant);
        assert_eq!(entry.name, "Bot_Alice");
        assert_eq!(entry.message_id, "m1_bot_reply");
    }

    #[tokio::test]
    async fn memory_store_trims_oldest() {
        let store = InMemoryHistoryStore::new(3);
        let key = ConversationKey {
            platform_kind: "qq".into(),
            scope: ConversationScope::Group,
            conversation_id: "g1".into(),
        };
        for i in 0..5 {
            store
                .append(&key, entry("a", &i.to_string(), None))
                .await
                .unwrap();
        }
        let entries = store.read_all(&key).await.unwrap();
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["2", "3", "4"]);
        assert!(store.clear(&key).await.unwrap());
        assert!(store.read_all(&key).await.unwrap().is_empty());
    }

    #[test]
    fn prompt_format_windows_and_collects_images() {
        let entries = vec![
            entry("a", "old", Some("base64://1")),
            entry("b", "line one\nline two", Some("base64://2")),
            entry("c", "url only", Some("https://not-inline")),
            entry("d", "latest", Some("base64://3")),
        ];
        let formatted = format_for_prompt(&entries, 3, 5);
        assert_eq!(formatted.images, vec!["base64://2", "base64://3"]);
        assert!(!formatted.text.contains("old"));
        assert!(formatted.text.contains("Content: line one line two"));
        assert!(formatted.text.starts_with("Sender: b (ID: b-id)"));
        assert_eq!(formatted.text.matches("\n-\n").count(), 2);

        let capped = format_for_prompt(&entries, 10, 1);
        assert_eq!(capped.images, vec!["base64://3"]);
    }
}
