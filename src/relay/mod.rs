//! Relay core: reply decisions and bounded bot-to-bot chains
//!
//! # Flow
//!
//! ```text
//! inbound ─▶ RelayEngine ─▶ DecisionEngine ─▶ ReplyGenerator ─▶ ReplyTransport
//!                ▲                                                  │
//!                │                                                  ▼
//!           EventSink ◀──────────── ChainScheduler ◀──── after_reply_sent
//! ```
//!
//! A persona's confirmed reply in a group becomes a synthetic inbound event
//! for every other persona, one hop deeper, until `max_chain_depth` is hit.

pub mod chain;
pub mod decision;
pub mod engine;
pub mod incentive;
pub mod message;
pub mod random;
pub mod reply_lock;

pub use chain::{ChainScheduler, ChainTaskKey, ConfirmedReply, EmitError, EventSink, FanOutOutcome};
pub use decision::{Decision, DecisionEngine, DecisionRule};
pub use engine::{
    DeliveryTarget, IgnoreReason, InboundOutcome, NoReplyReason, RelayCollaborators, RelayEngine,
    ReplyContext, ReplyTransport,
};
pub use incentive::IncentiveTracker;
pub use message::{ChainContext, InboundMessage, MessageKind, MessagePart};
pub use random::{RandomSource, ScriptedRandom, SeededRandom, ThreadRandom};
pub use reply_lock::{ReplyLease, ReplyLockGuard, ReplyLockKey};

use std::time::Duration;

/// Upper bound for any configured delay or window, about 136 years.
pub const MAX_CONFIGURED_DURATION: Duration = Duration::from_secs(u32::MAX as u64);

/// Convert configured seconds into a [`Duration`].  Zero, negative and NaN
/// give [`Duration::ZERO`]; values beyond [`MAX_CONFIGURED_DURATION`] are
/// clamped with a warning.
pub fn duration_from_secs(field: &str, seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) if duration <= MAX_CONFIGURED_DURATION => duration,
        _ => {
            tracing::warn!(field, seconds, "Duration out of range, clamping");
            MAX_CONFIGURED_DURATION
        }
    }
}

/// Randomized delay window in seconds, `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayRange {
    pub const NONE: Self = Self {
        min_secs: 0.0,
        max_secs: 0.0,
    };

    pub fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    /// Inactive when `min >= max` or `max <= 0`.
    pub fn is_active(&self) -> bool {
        self.min_secs.is_finite()
            && self.max_secs.is_finite()
            && self.min_secs < self.max_secs
            && self.max_secs > 0.0
    }

    /// Draw a delay, rounded to centiseconds.  `None` when inactive.
    pub fn sample(&self, random: &dyn RandomSource) -> Option<Duration> {
        if !self.is_active() {
            return None;
        }
        let secs = random.uniform(self.min_secs, self.max_secs).max(0.0);
        let rounded = (secs * 100.0).round() / 100.0;
        Some(duration_from_secs("delay", rounded))
    }
}

/// Runtime knobs of the relay, resolved from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub max_chain_depth: u32,
    pub initial_delay: DelayRange,
    pub chain_delay: DelayRange,
    pub incentive_probability: f64,
    /// Seconds; zero or negative disables the incentive.
    pub incentive_duration_secs: f64,
    pub reply_lock_release_delay: Duration,
    pub max_prompt_messages: usize,
    pub max_prompt_images: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_chain_depth: 1,
            initial_delay: DelayRange::new(0.1, 0.8),
            chain_delay: DelayRange::new(1.0, 3.0),
            incentive_probability: 0.9,
            incentive_duration_secs: 120.0,
            reply_lock_release_delay: Duration::from_secs(1),
            max_prompt_messages: 20,
            max_prompt_images: 5,
        }
    }
}

impl RelaySettings {
    /// No delays anywhere; useful for tests and simulation.
    pub fn immediate() -> Self {
        Self {
            initial_delay: DelayRange::NONE,
            chain_delay: DelayRange::NONE,
            reply_lock_release_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}
