//! Reply decision engine
//!
//! Turns one inbound message into a reply / no-reply verdict for one
//! persona.  Rules are evaluated in a fixed order and the first one that
//! matches wins:
//!
//! 1. blacklist gate (human messages only)
//! 2. direct-message override
//! 3. chain-continuation roll
//! 4. keyword match
//! 5. incentive roll (falls through on failure)
//! 6. base roll

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::incentive::IncentiveTracker;
use super::message::{ChainContext, InboundMessage};
use super::random::RandomSource;
use crate::persona::{PersonaConfig, Roster};

/// Which rule produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecisionRule {
    Blacklisted,
    DirectMessage,
    ChainRoll { draw: f64, threshold: f64 },
    KeywordMatch,
    IncentiveRoll { draw: f64, threshold: f64 },
    BaseRoll { draw: f64, threshold: f64 },
}

impl fmt::Display for DecisionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blacklisted => write!(f, "blacklisted"),
            Self::DirectMessage => write!(f, "direct message"),
            Self::ChainRoll { draw, threshold } => write!(f, "chain roll {draw:.3} < {threshold:.3}"),
            Self::KeywordMatch => write!(f, "keyword match"),
            Self::IncentiveRoll { draw, threshold } => {
                write!(f, "incentive roll {draw:.3} < {threshold:.3}")
            }
            Self::BaseRoll { draw, threshold } => write!(f, "base roll {draw:.3} < {threshold:.3}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub reply: bool,
    pub rule: DecisionRule,
}

impl Decision {
    fn new(reply: bool, rule: DecisionRule) -> Self {
        Self { reply, rule }
    }
}

pub struct DecisionEngine {
    roster: Arc<Roster>,
    incentive: Arc<IncentiveTracker>,
    incentive_probability: f64,
    random: Arc<dyn RandomSource>,
}

impl DecisionEngine {
    pub fn new(
        roster: Arc<Roster>,
        incentive: Arc<IncentiveTracker>,
        incentive_probability: f64,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            roster,
            incentive,
            incentive_probability,
            random,
        }
    }

    pub fn should_reply(
        &self,
        message: &InboundMessage,
        persona: &PersonaConfig,
        chain: &ChainContext,
    ) -> bool {
        self.evaluate(message, persona, chain, Instant::now()).reply
    }

    pub fn evaluate(
        &self,
        message: &InboundMessage,
        persona: &PersonaConfig,
        chain: &ChainContext,
        now: Instant,
    ) -> Decision {
        let text = message.outline();

        if !chain.is_chain
            && !self.roster.is_managed_sender(&message.sender_id)
            && persona.matches_blacklist(&text)
        {
            return Decision::new(false, DecisionRule::Blacklisted);
        }

        if message.is_direct() && !chain.is_chain {
            return Decision::new(true, DecisionRule::DirectMessage);
        }

        if chain.is_chain {
            let draw = self.random.next_unit();
            let threshold = persona.chain_reply_probability;
            return Decision::new(draw < threshold, DecisionRule::ChainRoll { draw, threshold });
        }

        if persona.matches_keyword(&text) {
            return Decision::new(true, DecisionRule::KeywordMatch);
        }

        if self
            .incentive
            .is_active(&persona.platform_id, &message.session_id, now)
        {
            let draw = self.random.next_unit();
            let threshold = self.incentive_probability;
            if draw < threshold {
                return Decision::new(true, DecisionRule::IncentiveRoll { draw, threshold });
            }
            tracing::debug!(
                platform_id = %persona.platform_id,
                draw,
                threshold,
                "Incentive roll failed, falling back to base probability"
            );
        }

        let draw = self.random.next_unit();
        let threshold = persona.base_reply_probability;
        Decision::new(draw < threshold, DecisionRule::BaseRoll { draw, threshold })
    }
}
