//! Inbound message and chain context types
//!
//! `InboundMessage` is the host-neutral view of one chat event as seen by a
//! single platform connection.  Chain continuations are ordinary messages
//! carrying a typed [`ChainContext`].

use crate::persona::PersonaConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix for inline base64 image references.
pub const BASE64_IMAGE_PREFIX: &str = "base64://";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// One-to-one private conversation
    Direct,
    /// Multi-party group conversation
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    /// `base64://...`, `http(s)://...` or a local file reference
    Image { uri: String },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(uri: impl Into<String>) -> Self {
        Self::Image { uri: uri.into() }
    }

    fn outline(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Image { uri } if is_remote_or_inline(uri) => "[image]".to_string(),
            Self::Image { uri } => {
                let name = uri.rsplit(['/', '\\']).next().unwrap_or(uri);
                format!("[{name}]")
            }
        }
    }
}

fn is_remote_or_inline(uri: &str) -> bool {
    uri.starts_with(BASE64_IMAGE_PREFIX) || uri.starts_with("http://") || uri.starts_with("https://")
}

/// Whether a list of parts carries anything worth relaying.
pub fn parts_have_content(parts: &[MessagePart]) -> bool {
    parts.iter().any(|part| match part {
        MessagePart::Text { text } => !text.trim().is_empty(),
        MessagePart::Image { uri } => !uri.trim().is_empty(),
    })
}

/// Relay metadata threaded through a chain of bot-to-bot replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainContext {
    pub is_chain: bool,
    /// Number of bot-to-bot hops since the human message.
    pub depth: u32,
    pub last_replier_persona: Option<String>,
    pub last_replier_physical_id: Option<String>,
    /// Id of the human message that started this chain tree.
    pub root_message_id: String,
    pub root_sender_id: String,
}

impl ChainContext {
    /// Fresh context for a human-originated message.
    pub fn origin(root_message_id: impl Into<String>, root_sender_id: impl Into<String>) -> Self {
        Self {
            is_chain: false,
            depth: 0,
            last_replier_persona: None,
            last_replier_physical_id: None,
            root_message_id: root_message_id.into(),
            root_sender_id: root_sender_id.into(),
        }
    }

    /// Context for the next hop after `replier` answered at this depth.
    pub fn next_hop(&self, replier: &PersonaConfig) -> Self {
        Self {
            is_chain: true,
            depth: self.depth + 1,
            last_replier_persona: Some(replier.persona_name.clone()),
            last_replier_physical_id: Some(replier.physical_bot_id.clone()),
            root_message_id: self.root_message_id.clone(),
            root_sender_id: self.root_sender_id.clone(),
        }
    }
}

/// A chain continuation arrived without the ids needed to place it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("chain continuation {message_id} carries no root message id")]
pub struct MissingChainContext {
    pub message_id: String,
}

/// One inbound chat event as delivered to one platform connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    /// The platform connection that received the event.
    pub platform_id: String,
    /// Adapter family (e.g. `aiocqhttp`); shared by connections of the same network.
    pub platform_kind: String,
    pub session_id: String,
    pub sender_id: String,
    pub sender_name: String,
    /// The receiving bot's own id.
    pub self_id: String,
    pub kind: MessageKind,
    pub parts: Vec<MessagePart>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainContext>,
}

impl InboundMessage {
    /// A group text message with a fresh id.
    pub fn group(
        platform_id: impl Into<String>,
        session_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::Group, platform_id, session_id, sender_id, text)
    }

    /// A private text message; the session id is the sender id.
    pub fn direct(
        platform_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let sender_id = sender_id.into();
        Self::new(
            MessageKind::Direct,
            platform_id,
            sender_id.clone(),
            sender_id,
            text,
        )
    }

    fn new(
        kind: MessageKind,
        platform_id: impl Into<String>,
        session_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let sender_id = sender_id.into();
        Self {
            id: Uuid::new_v4().to_string(),
            platform_id: platform_id.into(),
            platform_kind: "default".to_string(),
            session_id: session_id.into(),
            sender_name: sender_id.clone(),
            sender_id,
            self_id: String::new(),
            kind,
            parts: vec![MessagePart::text(text)],
            timestamp: Utc::now(),
            chain: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_platform_kind(mut self, kind: impl Into<String>) -> Self {
        self.platform_kind = kind.into();
        self
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = name.into();
        self
    }

    pub fn with_self_id(mut self, self_id: impl Into<String>) -> Self {
        self.self_id = self_id.into();
        self
    }

    pub fn with_part(mut self, part: MessagePart) -> Self {
        self.parts.push(part);
        self
    }

    pub fn with_chain(mut self, chain: ChainContext) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Plain text parts joined by a space.
    pub fn text(&self) -> String {
        let texts: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.trim()),
                MessagePart::Image { .. } => None,
            })
            .filter(|t| !t.is_empty())
            .collect();
        texts.join(" ")
    }

    /// Text with image markers, used for keyword matching and history.
    pub fn outline(&self) -> String {
        let pieces: Vec<String> = self
            .parts
            .iter()
            .map(MessagePart::outline)
            .filter(|t| !t.trim().is_empty())
            .collect();
        pieces.join(" ")
    }

    pub fn images(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            MessagePart::Image { uri } if !uri.trim().is_empty() => Some(uri.as_str()),
            _ => None,
        })
    }

    pub fn is_direct(&self) -> bool {
        self.kind == MessageKind::Direct
    }

    pub fn is_chain(&self) -> bool {
        self.chain.as_ref().is_some_and(|c| c.is_chain)
    }

    /// Resolve the chain context for this message.
    ///
    /// Non-chain messages get a fresh origin context rooted at their own id
    /// (or a host-supplied root); a blank message id is replaced with a UUID.
    /// Chain continuations must carry a root message id.
    pub fn resolve_chain(&mut self) -> Result<ChainContext, MissingChainContext> {
        if self.id.trim().is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        match &self.chain {
            Some(ctx) if ctx.is_chain => {
                if ctx.root_message_id.trim().is_empty() {
                    Err(MissingChainContext {
                        message_id: self.id.clone(),
                    })
                } else {
                    Ok(ctx.clone())
                }
            }
            Some(ctx) => {
                let root_id = non_blank_or(&ctx.root_message_id, &self.id);
                let root_sender = non_blank_or(&ctx.root_sender_id, &self.sender_id);
                Ok(ChainContext::origin(root_id, root_sender))
            }
            None => Ok(ChainContext::origin(self.id.clone(), self.sender_id.clone())),
        }
    }
}

fn non_blank_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
