//! Relay metrics
//!
//! Lock-free counters for decisions, replies and chain activity, plus a
//! per-persona reply breakdown.  Snapshots are serializable for the CLI.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct PersonaCounters {
    replies: AtomicU64,
    declined: AtomicU64,
}

/// Thread-safe counters shared by the engine and the chain scheduler.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    messages_seen: AtomicU64,
    chain_messages_seen: AtomicU64,
    ignored: AtomicU64,
    declined: AtomicU64,
    lock_contention: AtomicU64,
    replies_sent: AtomicU64,
    generation_failures: AtomicU64,
    delivery_failures: AtomicU64,
    chains_scheduled: AtomicU64,
    chains_deduplicated: AtomicU64,
    chains_cancelled: AtomicU64,
    chains_emitted: AtomicU64,
    chain_emit_failures: AtomicU64,
    personas: RwLock<HashMap<String, Arc<PersonaCounters>>>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn persona(&self, name: &str) -> Arc<PersonaCounters> {
        if let Some(counters) = self.personas.read().get(name) {
            return Arc::clone(counters);
        }
        let mut personas = self.personas.write();
        Arc::clone(personas.entry(name.to_string()).or_default())
    }

    pub fn record_message(&self, is_chain: bool) {
        self.messages_seen.fetch_add(1, Ordering::Relaxed);
        if is_chain {
            self.chain_messages_seen.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_declined(&self, persona: &str) {
        self.declined.fetch_add(1, Ordering::Relaxed);
        self.persona(persona).declined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self) {
        self.lock_contention.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply(&self, persona: &str) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
        self.persona(persona).replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generation_failure(&self) {
        self.generation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chains_scheduled(&self, scheduled: usize, deduplicated: usize) {
        self.chains_scheduled
            .fetch_add(scheduled as u64, Ordering::Relaxed);
        self.chains_deduplicated
            .fetch_add(deduplicated as u64, Ordering::Relaxed);
    }

    pub fn record_chains_cancelled(&self, count: usize) {
        self.chains_cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_chain_emitted(&self) {
        self.chains_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chain_emit_failure(&self) {
        self.chain_emit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayMetricsSnapshot {
        let per_persona = self
            .personas
            .read()
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    PersonaSnapshot {
                        replies: c.replies.load(Ordering::Relaxed),
                        declined: c.declined.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        RelayMetricsSnapshot {
            messages_seen: self.messages_seen.load(Ordering::Relaxed),
            chain_messages_seen: self.chain_messages_seen.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            declined: self.declined.load(Ordering::Relaxed),
            lock_contention: self.lock_contention.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            generation_failures: self.generation_failures.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            chains_scheduled: self.chains_scheduled.load(Ordering::Relaxed),
            chains_deduplicated: self.chains_deduplicated.load(Ordering::Relaxed),
            chains_cancelled: self.chains_cancelled.load(Ordering::Relaxed),
            chains_emitted: self.chains_emitted.load(Ordering::Relaxed),
            chain_emit_failures: self.chain_emit_failures.load(Ordering::Relaxed),
            per_persona,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaSnapshot {
    pub replies: u64,
    pub declined: u64,
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMetricsSnapshot {
    pub messages_seen: u64,
    pub chain_messages_seen: u64,
    pub ignored: u64,
    pub declined: u64,
    pub lock_contention: u64,
    pub replies_sent: u64,
    pub generation_failures: u64,
    pub delivery_failures: u64,
    pub chains_scheduled: u64,
    pub chains_deduplicated: u64,
    pub chains_cancelled: u64,
    pub chains_emitted: u64,
    pub chain_emit_failures: u64,
    pub per_persona: BTreeMap<String, PersonaSnapshot>,
}

impl std::fmt::Display for RelayMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "messages: {} ({} chained), ignored {}, declined {}, lock contention {}",
            self.messages_seen,
            self.chain_messages_seen,
            self.ignored,
            self.declined,
            self.lock_contention
        )?;
        writeln!(
            f,
            "replies: {} sent, {} generation failures, {} delivery failures",
            self.replies_sent, self.generation_failures, self.delivery_failures
        )?;
        write!(
            f,
            "chains: {} scheduled, {} deduplicated, {} cancelled, {} emitted, {} failed",
            self.chains_scheduled,
            self.chains_deduplicated,
            self.chains_cancelled,
            self.chains_emitted,
            self.chain_emit_failures
        )?;
        for (name, persona) in &self.per_persona {
            write!(
                f,
                "\n  {name}: {} replies, {} declined",
                persona.replies, persona.declined
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_snapshot() {
        let metrics = RelayMetrics::new();
        metrics.record_message(false);
        metrics.record_message(true);
        metrics.record_reply("Alice");
        metrics.record_reply("Alice");
        metrics.record_declined("Bob");
        metrics.record_chains_scheduled(3, 1);

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_seen, 2);
        assert_eq!(snap.chain_messages_seen, 1);
        assert_eq!(snap.replies_sent, 2);
        assert_eq!(snap.chains_scheduled, 3);
        assert_eq!(snap.chains_deduplicated, 1);
        assert_eq!(snap.per_persona["Alice"].replies, 2);
        assert_eq!(snap.per_persona["Bob"].declined, 1);
        assert!(snap.to_string().contains("Alice: 2 replies"));
    }
}
