//! Relay engine
//!
//! Wires the decision engine, reply lock, chain scheduler and history to the
//! host-provided collaborators.  One call to [`RelayEngine::handle_inbound`]
//! processes one event as seen by one persona's platform connection.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use super::chain::{ChainScheduler, ConfirmedReply, EventSink, FanOutOutcome};
use super::decision::DecisionEngine;
use super::incentive::IncentiveTracker;
use super::message::{ChainContext, InboundMessage, MessageKind};
use super::random::{RandomSource, ThreadRandom};
use super::reply_lock::{ReplyLockGuard, ReplyLockKey};
use super::RelaySettings;
use crate::generation::{self, GeneratedReply, PromptLimits, ReplyGenerator};
use crate::history::{ConversationKey, HistoryEntry, HistoryStore};
use crate::persona::{PersonaConfig, ProfileDirectory, Roster};
use crate::telemetry::RelayMetrics;

// ─── Outbound delivery ───────────────────────────────────────────────────

/// Where a reply goes: the conversation the triggering message came from,
/// sent through the replying persona's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub platform_id: String,
    pub platform_kind: String,
    pub session_id: String,
    pub kind: MessageKind,
    pub reply_to: String,
}

/// Sends replies back to the chat network.
#[async_trait]
pub trait ReplyTransport: Send + Sync {
    async fn deliver(&self, target: &DeliveryTarget, reply: &GeneratedReply) -> Result<()>;
}

// ─── Outcomes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnmanagedPlatform,
    MissingChainContext,
    ReplyInProgress,
    SamePersona,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoReplyReason {
    PrepareFailed(String),
    GenerationFailed(String),
    EmptyReply,
    DeliveryFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Ignored(IgnoreReason),
    /// The persona chose not to answer.
    Declined,
    /// The persona declined a private message; the host should stop any
    /// further processing of this event.
    StopPropagation,
    NoReply(NoReplyReason),
    Replied {
        persona: String,
        depth: u32,
        fan_out: FanOutOutcome,
    },
}

impl InboundOutcome {
    pub fn replied(&self) -> bool {
        matches!(self, Self::Replied { .. })
    }
}

/// What the post-reply hook needs to know about a delivered reply.
#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub persona: PersonaConfig,
    pub platform_kind: String,
    pub session_id: String,
    pub kind: MessageKind,
    pub trigger_message_id: String,
    pub chain: ChainContext,
    pub conversation: Option<ConversationKey>,
}

impl ReplyContext {
    pub fn new(persona: &PersonaConfig, message: &InboundMessage, chain: ChainContext) -> Self {
        Self {
            persona: persona.clone(),
            platform_kind: message.platform_kind.clone(),
            session_id: message.session_id.clone(),
            kind: message.kind,
            trigger_message_id: message.id.clone(),
            chain,
            conversation: ConversationKey::for_message(message),
        }
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────

/// Host-provided pieces the engine talks to.
pub struct RelayCollaborators {
    pub history: Arc<dyn HistoryStore>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub transport: Arc<dyn ReplyTransport>,
    pub sink: Arc<dyn EventSink>,
    pub random: Arc<dyn RandomSource>,
    pub metrics: Arc<RelayMetrics>,
}

impl RelayCollaborators {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        generator: Arc<dyn ReplyGenerator>,
        transport: Arc<dyn ReplyTransport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            history,
            generator,
            transport,
            sink,
            random: Arc::new(ThreadRandom),
            metrics: RelayMetrics::new().into_arc(),
        }
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

pub struct RelayEngine {
    roster: Arc<Roster>,
    profiles: Arc<ProfileDirectory>,
    settings: RelaySettings,
    decision: DecisionEngine,
    incentive: Arc<IncentiveTracker>,
    reply_lock: ReplyLockGuard,
    scheduler: ChainScheduler,
    history: Arc<dyn HistoryStore>,
    generator: Arc<dyn ReplyGenerator>,
    transport: Arc<dyn ReplyTransport>,
    random: Arc<dyn RandomSource>,
    metrics: Arc<RelayMetrics>,
    shutdown: watch::Sender<bool>,
}

impl RelayEngine {
    pub fn new(
        roster: Arc<Roster>,
        profiles: Arc<ProfileDirectory>,
        settings: RelaySettings,
        parts: RelayCollaborators,
    ) -> Self {
        let incentive = Arc::new(IncentiveTracker::from_secs(settings.incentive_duration_secs));
        let decision = DecisionEngine::new(
            Arc::clone(&roster),
            Arc::clone(&incentive),
            settings.incentive_probability,
            Arc::clone(&parts.random),
        );
        let scheduler = ChainScheduler::new(
            Arc::clone(&roster),
            settings.max_chain_depth,
            settings.chain_delay,
            Arc::clone(&parts.random),
            parts.sink,
            Arc::clone(&parts.metrics),
        );
        let (shutdown, _) = watch::channel(false);

        tracing::info!(
            personas = roster.len(),
            max_chain_depth = settings.max_chain_depth,
            incentive_secs = settings.incentive_duration_secs,
            "Relay engine ready"
        );

        Self {
            roster,
            profiles,
            settings,
            decision,
            incentive,
            reply_lock: ReplyLockGuard::new(),
            scheduler,
            history: parts.history,
            generator: parts.generator,
            transport: parts.transport,
            random: parts.random,
            metrics: parts.metrics,
            shutdown,
        }
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &ChainScheduler {
        &self.scheduler
    }

    pub fn incentive(&self) -> &IncentiveTracker {
        &self.incentive
    }

    pub fn reply_lock(&self) -> &ReplyLockGuard {
        &self.reply_lock
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop accepting work and cancel every pending chain task.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let cancelled = self.scheduler.shutdown();
        tracing::info!(cancelled, "Relay engine shutting down");
    }

    /// Process one inbound event for the persona bound to its platform.
    pub async fn handle_inbound(&self, mut message: InboundMessage) -> InboundOutcome {
        if self.is_shutting_down() {
            return self.ignore(IgnoreReason::ShuttingDown);
        }
        let Some(persona) = self.roster.get(&message.platform_id) else {
            tracing::debug!(platform_id = %message.platform_id, "Event for unmanaged platform");
            return self.ignore(IgnoreReason::UnmanagedPlatform);
        };

        let chain = match message.resolve_chain() {
            Ok(chain) => chain,
            Err(err) => {
                tracing::warn!(platform_id = %persona.platform_id, error = %err, "Dropping chain event");
                return self.ignore(IgnoreReason::MissingChainContext);
            }
        };
        self.metrics.record_message(chain.is_chain);

        let lock_key = ReplyLockKey::for_message(&message);
        if !chain.is_chain {
            if self.reply_lock.is_held(&lock_key) {
                tracing::debug!(lock = %lock_key, persona = %persona.persona_name, "Reply already in progress");
                self.metrics.record_lock_contention();
                return self.ignore(IgnoreReason::ReplyInProgress);
            }

            if !self.initial_delay().await {
                return self.ignore(IgnoreReason::ShuttingDown);
            }

            self.record_user_message(&message).await;
            self.scheduler.cancel_root(&chain.root_message_id);
        } else if chain.last_replier_persona.as_deref() == Some(persona.persona_name.as_str()) {
            tracing::debug!(
                persona = %persona.persona_name,
                root_message_id = %chain.root_message_id,
                "Skipping chain event from the same persona"
            );
            return self.ignore(IgnoreReason::SamePersona);
        }

        let decision = self
            .decision
            .evaluate(&message, persona, &chain, Instant::now());
        if !decision.reply {
            tracing::debug!(
                persona = %persona.persona_name,
                rule = %decision.rule,
                depth = chain.depth,
                "Declined to reply"
            );
            self.metrics.record_declined(&persona.persona_name);
            if message.is_direct() && !chain.is_chain {
                return InboundOutcome::StopPropagation;
            }
            return InboundOutcome::Declined;
        }
        tracing::info!(
            persona = %persona.persona_name,
            platform_id = %persona.platform_id,
            rule = %decision.rule,
            is_chain = chain.is_chain,
            depth = chain.depth,
            "Decided to reply"
        );

        let lease = if chain.is_chain {
            None
        } else {
            match self
                .reply_lock
                .lease(lock_key.clone(), self.settings.reply_lock_release_delay)
            {
                Some(lease) => Some(lease),
                None => {
                    tracing::debug!(lock = %lock_key, "Lost reply lock race");
                    self.metrics.record_lock_contention();
                    return self.ignore(IgnoreReason::ReplyInProgress);
                }
            }
        };

        let delivered = self.generate_and_deliver(persona, &message).await;
        if let Some(lease) = lease {
            lease.release();
        }
        let reply = match delivered {
            Ok(reply) => reply,
            Err(reason) => return InboundOutcome::NoReply(reason),
        };

        let context = ReplyContext::new(persona, &message, chain);
        let depth = context.chain.depth;
        let fan_out = self.after_reply_sent(&context, &reply).await;
        InboundOutcome::Replied {
            persona: persona.persona_name.clone(),
            depth,
            fan_out,
        }
    }

    /// Post-reply hook: record the reply, warm the conversation, and
    /// schedule chain continuations.
    pub async fn after_reply_sent(
        &self,
        context: &ReplyContext,
        reply: &GeneratedReply,
    ) -> FanOutOutcome {
        let persona = &context.persona;
        self.metrics.record_reply(&persona.persona_name);

        if let Some(key) = &context.conversation {
            let entry = HistoryEntry::from_bot_reply(
                &persona.persona_name,
                &persona.physical_bot_id,
                &context.trigger_message_id,
                reply.plain_text(),
                reply.inline_image().map(str::to_string),
            );
            if let Err(err) = self.history.append(key, entry).await {
                tracing::warn!(conversation = %key, error = %err, "Failed to save bot reply to history");
            }
        }

        self.incentive
            .activate(&persona.platform_id, &context.session_id, Instant::now());

        self.scheduler.fan_out(&ConfirmedReply {
            replier: persona.clone(),
            platform_kind: context.platform_kind.clone(),
            session_id: context.session_id.clone(),
            kind: context.kind,
            chain: context.chain.clone(),
            content: reply.parts.clone(),
        })
    }

    fn ignore(&self, reason: IgnoreReason) -> InboundOutcome {
        self.metrics.record_ignored();
        InboundOutcome::Ignored(reason)
    }

    /// Wait the randomized pre-reply delay.  Returns false if shutdown
    /// interrupted it.
    async fn initial_delay(&self) -> bool {
        let Some(delay) = self.settings.initial_delay.sample(self.random.as_ref()) else {
            return true;
        };
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }

    async fn record_user_message(&self, message: &InboundMessage) {
        let Some(key) = ConversationKey::for_message(message) else {
            return;
        };
        if let Err(err) = self
            .history
            .append(&key, HistoryEntry::from_user(message))
            .await
        {
            tracing::warn!(conversation = %key, error = %err, "Failed to save user message to history");
        }
    }

    async fn generate_and_deliver(
        &self,
        persona: &PersonaConfig,
        message: &InboundMessage,
    ) -> Result<GeneratedReply, NoReplyReason> {
        let history = match ConversationKey::for_message(message) {
            Some(key) => self.history.read_all(&key).await.unwrap_or_else(|err| {
                tracing::warn!(conversation = %key, error = %err, "Failed to read history");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let limits = PromptLimits {
            max_messages: self.settings.max_prompt_messages,
            max_images: self.settings.max_prompt_images,
        };
        let request = generation::build_request(persona, &self.profiles, message, history, limits)
            .map_err(|err| {
                tracing::warn!(persona = %persona.persona_name, error = %err, "Could not build reply request");
                NoReplyReason::PrepareFailed(err.to_string())
            })?;

        let reply = self.generator.generate(request).await.map_err(|err| {
            tracing::warn!(persona = %persona.persona_name, error = %err, "Reply generation failed");
            self.metrics.record_generation_failure();
            NoReplyReason::GenerationFailed(err.to_string())
        })?;
        if reply.is_empty() {
            tracing::warn!(persona = %persona.persona_name, "Generator returned an empty reply");
            self.metrics.record_generation_failure();
            return Err(NoReplyReason::EmptyReply);
        }

        let target = DeliveryTarget {
            platform_id: persona.platform_id.clone(),
            platform_kind: message.platform_kind.clone(),
            session_id: message.session_id.clone(),
            kind: message.kind,
            reply_to: message.id.clone(),
        };
        self.transport
            .deliver(&target, &reply)
            .await
            .map_err(|err| {
                tracing::warn!(persona = %persona.persona_name, error = %err, "Reply delivery failed");
                self.metrics.record_delivery_failure();
                NoReplyReason::DeliveryFailed(err.to_string())
            })?;
        Ok(reply)
    }
}

impl Drop for RelayEngine {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}
