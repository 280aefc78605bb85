//! Reply generation
//!
//! The relay never talks to a language model directly.  It assembles a
//! [`ReplyRequest`] (persona system prompt, formatted history, the current
//! message and attached images) and hands it to a [`ReplyGenerator`].

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::{self, HistoryEntry};
use crate::persona::{PersonaConfig, ProfileDirectory};
use crate::relay::message::{BASE64_IMAGE_PREFIX, InboundMessage, MessagePart};

const IMAGE_ONLY_PLACEHOLDER: &str = "[the user sent one or more images]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub persona_name: String,
    pub system_prompt: String,
    /// Model override; `None` means the generator's default.
    pub model: Option<String>,
    pub session_id: String,
    pub prompt: String,
    /// The current message's text alone, without history.
    pub current_text: String,
    pub image_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedReply {
    pub parts: Vec<MessagePart>,
}

impl GeneratedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![MessagePart::text(text)],
        }
    }

    pub fn is_empty(&self) -> bool {
        !crate::relay::message::parts_have_content(&self.parts)
    }

    /// Text parts joined by a space.
    pub fn plain_text(&self) -> String {
        let texts: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Image { .. } => None,
            })
            .collect();
        texts.join(" ").trim().to_string()
    }

    /// First inline image, if any.
    pub fn inline_image(&self) -> Option<&str> {
        self.parts.iter().find_map(|p| match p {
            MessagePart::Image { uri } if uri.starts_with(BASE64_IMAGE_PREFIX) => Some(uri.as_str()),
            _ => None,
        })
    }
}

/// Produces a reply for an assembled request.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, request: ReplyRequest) -> Result<GeneratedReply>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrepareError {
    #[error("nothing to send: prompt and images are both empty")]
    EmptyInput,
}

/// Limits applied while assembling a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLimits {
    pub max_messages: usize,
    pub max_images: usize,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            max_messages: 20,
            max_images: 5,
        }
    }
}

/// Build the request for `persona` answering `message`.
///
/// `history` is expected to be the raw stored history; it is deduplicated
/// here.
pub fn build_request(
    persona: &PersonaConfig,
    profiles: &ProfileDirectory,
    message: &InboundMessage,
    history: Vec<HistoryEntry>,
    limits: PromptLimits,
) -> Result<ReplyRequest, PrepareError> {
    let deduped = history::dedup_history(history);
    let formatted = history::format_for_prompt(&deduped, limits.max_messages, limits.max_images);

    let mut sections = Vec::new();
    if !formatted.text.is_empty() {
        sections.push(format!("Previous conversation:\n{}", formatted.text));
    }

    let mut current_parts = Vec::new();
    let mut current_images = Vec::new();
    for part in &message.parts {
        match part {
            MessagePart::Text { text } if !text.trim().is_empty() => current_parts.push(text.trim().to_string()),
            MessagePart::Text { .. } => {}
            MessagePart::Image { uri } if uri.starts_with(BASE64_IMAGE_PREFIX) => {
                current_images.push(uri.clone());
                current_parts.push("[image]".to_string());
            }
            MessagePart::Image { uri } if uri.starts_with("http://") || uri.starts_with("https://") => {
                current_images.push(uri.clone());
                current_parts.push("[image url]".to_string());
            }
            MessagePart::Image { .. } => {}
        }
    }
    let current_text = current_parts.join(" ").trim().to_string();
    let only_images = message.text().is_empty() && !current_images.is_empty();
    let current_for_prompt = if only_images {
        IMAGE_ONLY_PLACEHOLDER.to_string()
    } else if current_text.is_empty() {
        message.outline()
    } else {
        current_text.clone()
    };
    if !current_for_prompt.is_empty() {
        sections.push(format!(
            "Current message (from sender ID: {}):\n{}",
            message.sender_id, current_for_prompt
        ));
    }
    let prompt = sections.join("\n\n").trim().to_string();

    let mut images = formatted.images;
    images.extend(current_images);
    let cap = limits.max_images + 1;
    if images.len() > cap {
        tracing::warn!(
            total = images.len(),
            kept = cap,
            "Too many images for one request, keeping the most recent"
        );
        images.drain(..images.len() - cap);
    }

    if prompt.is_empty() && images.is_empty() {
        return Err(PrepareError::EmptyInput);
    }

    Ok(ReplyRequest {
        persona_name: persona.persona_name.clone(),
        system_prompt: profiles.system_prompt(&persona.persona_name).to_string(),
        model: profiles.model(&persona.persona_name).map(str::to_string),
        session_id: message.session_id.clone(),
        prompt,
        current_text: current_for_prompt,
        image_urls: images,
    })
}

/// Generator that answers with a short acknowledgement of the current
/// message.  Used by the `simulate` command and in tests.
#[derive(Debug, Clone, Default)]
pub struct EchoGenerator;

#[async_trait]
impl ReplyGenerator for EchoGenerator {
    async fn generate(&self, request: ReplyRequest) -> Result<GeneratedReply> {
        let excerpt: String = request.current_text.chars().take(60).collect();
        Ok(GeneratedReply::text(format!(
            "{} heard: {}",
            request.persona_name, excerpt
        )))
    }
}
