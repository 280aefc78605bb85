//! Chain scheduler
//!
//! Turns one persona's confirmed group reply into delayed synthetic inbound
//! events for the other personas, one hop deeper.  Every scheduled task is
//! registered under `(root message, target platform, target depth)` in a
//! single mutex-guarded registry; fan-out, cancellation and self-removal all
//! happen under that lock so they never interleave.
//!
//! Cancellation is cooperative: the task's flag is set and its delay is
//! woken early.  A task that has already submitted its event is unaffected.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::DelayRange;
use super::message::{ChainContext, InboundMessage, MessageKind, MessagePart, parts_have_content};
use super::random::RandomSource;
use crate::persona::{PersonaConfig, Roster};
use crate::telemetry::RelayMetrics;

// ─── Event sink ──────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("event sink is closed")]
    Closed,
    #[error("no subscribers are listening for relay events")]
    NoSubscribers,
}

/// Where synthetic chain events are submitted: the host's inbound pipeline.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(&self, event: InboundMessage) -> Result<(), EmitError>;
}

#[async_trait]
impl EventSink for mpsc::Sender<InboundMessage> {
    async fn submit(&self, event: InboundMessage) -> Result<(), EmitError> {
        self.send(event).await.map_err(|_| EmitError::Closed)
    }
}

// ─── Keys & outcomes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainTaskKey {
    pub root_message_id: String,
    pub target_platform_id: String,
    pub target_depth: u32,
}

impl fmt::Display for ChainTaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_to_{}_depth{}",
            self.root_message_id, self.target_platform_id, self.target_depth
        )
    }
}

/// A reply that was actually delivered, as seen by the scheduler.
#[derive(Debug, Clone)]
pub struct ConfirmedReply {
    pub replier: PersonaConfig,
    pub platform_kind: String,
    pub session_id: String,
    pub kind: MessageKind,
    /// Context of the message the replier answered.
    pub chain: ChainContext,
    pub content: Vec<MessagePart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotQualified {
    NotGroup,
    EmptyReply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOutOutcome {
    NotQualified(NotQualified),
    /// The chain hit `max_chain_depth`; finished tasks for the root were pruned.
    DepthExhausted { pruned: usize },
    Scheduled {
        scheduled: Vec<ChainTaskKey>,
        deduplicated: usize,
    },
}

impl FanOutOutcome {
    pub fn scheduled_count(&self) -> usize {
        match self {
            Self::Scheduled { scheduled, .. } => scheduled.len(),
            _ => 0,
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CancelFlag {
    cancelled: AtomicBool,
    wake: Notify,
}

impl CancelFlag {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct ChainTaskEntry {
    instance: u64,
    flag: Arc<CancelFlag>,
    handle: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<ChainTaskKey, ChainTaskEntry>>>;

/// Remove `key` only if it still belongs to this task instance.
fn retire(registry: &Registry, key: &ChainTaskKey, instance: u64) {
    let mut tasks = registry.lock();
    if tasks.get(key).is_some_and(|entry| entry.instance == instance) {
        tasks.remove(key);
    }
}

/// Everything a task needs to build its synthetic event after the delay.
struct ChainJob {
    key: ChainTaskKey,
    target: PersonaConfig,
    replier_name: String,
    replier_bot_id: String,
    platform_kind: String,
    session_id: String,
    content: Vec<MessagePart>,
    chain: ChainContext,
}

impl ChainJob {
    fn build_event(&self) -> InboundMessage {
        InboundMessage {
            id: Uuid::new_v4().to_string(),
            platform_id: self.target.platform_id.clone(),
            platform_kind: self.platform_kind.clone(),
            session_id: self.session_id.clone(),
            sender_id: self.replier_bot_id.clone(),
            sender_name: format!("Bot_{}", self.replier_name),
            self_id: self.target.physical_bot_id.clone(),
            kind: MessageKind::Group,
            parts: self.content.clone(),
            timestamp: Utc::now(),
            chain: Some(self.chain.clone()),
        }
    }
}

// ─── ChainScheduler ──────────────────────────────────────────────────────

pub struct ChainScheduler {
    roster: Arc<Roster>,
    max_depth: u32,
    delay: DelayRange,
    random: Arc<dyn RandomSource>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<RelayMetrics>,
    registry: Registry,
    next_instance: AtomicU64,
}

impl ChainScheduler {
    pub fn new(
        roster: Arc<Roster>,
        max_depth: u32,
        delay: DelayRange,
        random: Arc<dyn RandomSource>,
        sink: Arc<dyn EventSink>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            roster,
            max_depth,
            delay,
            random,
            sink,
            metrics,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_instance: AtomicU64::new(1),
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Schedule follow-up events for every eligible persona.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn fan_out(&self, reply: &ConfirmedReply) -> FanOutOutcome {
        if reply.kind != MessageKind::Group {
            return FanOutOutcome::NotQualified(NotQualified::NotGroup);
        }
        if !parts_have_content(&reply.content) {
            return FanOutOutcome::NotQualified(NotQualified::EmptyReply);
        }
        if reply.chain.depth >= self.max_depth {
            let pruned = self.prune_finished(&reply.chain.root_message_id);
            tracing::debug!(
                root_message_id = %reply.chain.root_message_id,
                depth = reply.chain.depth,
                max_depth = self.max_depth,
                pruned,
                "Chain depth exhausted"
            );
            return FanOutOutcome::DepthExhausted { pruned };
        }

        let replier = &reply.replier;
        let next = reply.chain.next_hop(replier);
        let mut scheduled = Vec::new();
        let mut deduplicated = 0;

        let mut tasks = self.registry.lock();
        for target in self.roster.iter() {
            if target.platform_id == replier.platform_id
                || target.persona_name == replier.persona_name
            {
                continue;
            }
            if !target.has_physical_identity() {
                tracing::warn!(
                    platform_id = %target.platform_id,
                    "Skipping chain target without a bot id"
                );
                continue;
            }

            let key = ChainTaskKey {
                root_message_id: next.root_message_id.clone(),
                target_platform_id: target.platform_id.clone(),
                target_depth: next.depth,
            };
            if tasks
                .get(&key)
                .is_some_and(|entry| !entry.handle.is_finished())
            {
                tracing::debug!(task = %key, "Chain task already pending");
                deduplicated += 1;
                continue;
            }

            let job = ChainJob {
                key: key.clone(),
                target: target.clone(),
                replier_name: replier.persona_name.clone(),
                replier_bot_id: replier.physical_bot_id.clone(),
                platform_kind: reply.platform_kind.clone(),
                session_id: reply.session_id.clone(),
                content: reply.content.clone(),
                chain: next.clone(),
            };
            let delay = self.delay.sample(self.random.as_ref());
            let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
            let flag = Arc::new(CancelFlag::default());
            let handle = tokio::spawn(run_chain_task(
                job,
                delay,
                instance,
                Arc::clone(&flag),
                Arc::clone(&self.sink),
                Arc::clone(&self.registry),
                Arc::clone(&self.metrics),
            ));

            tracing::info!(
                task = %key,
                from = %replier.persona_name,
                to = %target.persona_name,
                delay_ms = delay.map(|d| d.as_millis() as u64).unwrap_or(0),
                "Chain task scheduled"
            );
            tasks.insert(
                key.clone(),
                ChainTaskEntry {
                    instance,
                    flag,
                    handle,
                },
            );
            scheduled.push(key);
        }
        drop(tasks);

        self.metrics
            .record_chains_scheduled(scheduled.len(), deduplicated);
        FanOutOutcome::Scheduled {
            scheduled,
            deduplicated,
        }
    }

    /// Cancel and purge every task rooted at `root_message_id`.  Returns the
    /// number of tasks that were still pending.
    pub fn cancel_root(&self, root_message_id: &str) -> usize {
        let cancelled = self.cancel_where(|key| key.root_message_id == root_message_id);
        if cancelled > 0 {
            tracing::info!(
                root_message_id = %root_message_id,
                cancelled,
                "Cancelled stale chain tasks"
            );
        }
        cancelled
    }

    /// Cancel everything.  Used on shutdown.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.cancel_where(|_| true);
        tracing::info!(cancelled, "Chain scheduler shut down");
        cancelled
    }

    fn cancel_where(&self, matches: impl Fn(&ChainTaskKey) -> bool) -> usize {
        let mut tasks = self.registry.lock();
        let keys: Vec<ChainTaskKey> = tasks.keys().filter(|k| matches(k)).cloned().collect();
        let mut cancelled = 0;
        for key in keys {
            if let Some(entry) = tasks.remove(&key)
                && !entry.handle.is_finished()
            {
                entry.flag.cancel();
                cancelled += 1;
            }
        }
        drop(tasks);
        self.metrics.record_chains_cancelled(cancelled);
        cancelled
    }

    fn prune_finished(&self, root_message_id: &str) -> usize {
        let mut tasks = self.registry.lock();
        let before = tasks.len();
        tasks.retain(|key, entry| {
            key.root_message_id != root_message_id || !entry.handle.is_finished()
        });
        before - tasks.len()
    }

    /// Tasks registered and not yet finished.
    pub fn pending(&self) -> usize {
        self.registry
            .lock()
            .values()
            .filter(|entry| !entry.handle.is_finished())
            .count()
    }

    /// Keys of unfinished tasks, sorted.
    pub fn pending_keys(&self) -> Vec<ChainTaskKey> {
        let mut keys: Vec<ChainTaskKey> = self
            .registry
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Pending tasks for one root.
    pub fn pending_for_root(&self, root_message_id: &str) -> usize {
        self.pending_keys()
            .iter()
            .filter(|k| k.root_message_id == root_message_id)
            .count()
    }
}

async fn run_chain_task(
    job: ChainJob,
    delay: Option<Duration>,
    instance: u64,
    flag: Arc<CancelFlag>,
    sink: Arc<dyn EventSink>,
    registry: Registry,
    metrics: Arc<RelayMetrics>,
) {
    if let Some(delay) = delay {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = flag.wake.notified() => {}
        }
    }

    if flag.is_cancelled() {
        tracing::debug!(task = %job.key, "Chain task cancelled before emission");
        retire(&registry, &job.key, instance);
        return;
    }

    let event = job.build_event();
    let event_id = event.id.clone();
    // A backpressured sink must not outlive a cancellation.
    let submitted = tokio::select! {
        biased;
        _ = flag.wake.notified() => None,
        result = sink.submit(event) => Some(result),
    };
    let Some(submitted) = submitted else {
        debug_assert!(flag.is_cancelled());
        tracing::debug!(task = %job.key, "Chain task cancelled while submitting");
        retire(&registry, &job.key, instance);
        return;
    };
    match submitted {
        Ok(()) => {
            metrics.record_chain_emitted();
            tracing::info!(
                task = %job.key,
                event_id = %event_id,
                depth = job.chain.depth,
                "Chain event submitted"
            );
        }
        Err(err) => {
            metrics.record_chain_emit_failure();
            tracing::warn!(task = %job.key, error = %err, "Chain event submission failed, abandoning");
        }
    }
    retire(&registry, &job.key, instance);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::random::ScriptedRandom;

    fn roster() -> Arc<Roster> {
        Arc::new(
            Roster::new([
                PersonaConfig::new("p1", "Alice", "101"),
                PersonaConfig::new("p2", "Bob", "102"),
                PersonaConfig::new("p3", "Alice", "103"),
                PersonaConfig::new("p4", "Carol", "104"),
            ])
            .unwrap(),
        )
    }

    fn scheduler(
        max_depth: u32,
        delay: DelayRange,
    ) -> (ChainScheduler, mpsc::Receiver<InboundMessage>, Arc<RelayMetrics>) {
        let (tx, rx) = mpsc::channel(64);
        let metrics = RelayMetrics::new().into_arc();
        let scheduler = ChainScheduler::new(
            roster(),
            max_depth,
            delay,
            Arc::new(ScriptedRandom::constant(0.5)),
            Arc::new(tx),
            metrics.clone(),
        );
        (scheduler, rx, metrics)
    }

    fn reply_from(platform_id: &str, chain: ChainContext) -> ConfirmedReply {
        let roster = roster();
        ConfirmedReply {
            replier: roster.get(platform_id).unwrap().clone(),
            platform_kind: "qq".into(),
            session_id: "g1".into(),
            kind: MessageKind::Group,
            chain,
            content: vec![MessagePart::text("hello there")],
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_skips_replier_and_namesakes() {
        let (scheduler, mut rx, _) = scheduler(3, DelayRange::NONE);
        let outcome = scheduler.fan_out(&reply_from("p1", ChainContext::origin("m1", "u1")));
        // 4 personas, 2 of them named Alice
        assert_eq!(outcome.scheduled_count(), 2);

        let mut targets = Vec::new();
        for _ in 0..2 {
            let event = rx.recv().await.unwrap();
            targets.push(event.platform_id.clone());
            assert_eq!(event.sender_id, "101");
            assert_eq!(event.sender_name, "Bot_Alice");
            assert_eq!(event.session_id, "g1");
            assert_eq!(event.kind, MessageKind::Group);
            assert_eq!(event.text(), "hello there");
            let chain = event.chain.unwrap();
            assert!(chain.is_chain);
            assert_eq!(chain.depth, 1);
            assert_eq!(chain.root_message_id, "m1");
            assert_eq!(chain.last_replier_persona.as_deref(), Some("Alice"));
        }
        targets.sort();
        assert_eq!(targets, vec!["p2", "p4"]);

        settle().await;
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn synthetic_event_targets_bot_identity() {
        let (scheduler, mut rx, _) = scheduler(3, DelayRange::NONE);
        scheduler.fan_out(&reply_from("p2", ChainContext::origin("m1", "u1")));
        let mut self_ids = Vec::new();
        for _ in 0..3 {
            let event = rx.recv().await.unwrap();
            self_ids.push((event.platform_id, event.self_id));
        }
        self_ids.sort();
        assert_eq!(
            self_ids,
            vec![
                ("p1".to_string(), "101".to_string()),
                ("p3".to_string(), "103".to_string()),
                ("p4".to_string(), "104".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pending_duplicates_are_skipped() {
        let (scheduler, _rx, metrics) = scheduler(3, DelayRange::new(60.0, 120.0));
        let reply = reply_from("p1", ChainContext::origin("m1", "u1"));
        assert_eq!(scheduler.fan_out(&reply).scheduled_count(), 2);
        let second = scheduler.fan_out(&reply);
        assert_eq!(
            second,
            FanOutOutcome::Scheduled {
                scheduled: Vec::new(),
                deduplicated: 2
            }
        );
        assert_eq!(scheduler.pending(), 2);
        assert_eq!(metrics.snapshot().chains_deduplicated, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_tasks_can_be_replaced() {
        let (scheduler, mut rx, _) = scheduler(3, DelayRange::NONE);
        let reply = reply_from("p1", ChainContext::origin("m1", "u1"));
        scheduler.fan_out(&reply);
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        settle().await;
        assert_eq!(scheduler.fan_out(&reply).scheduled_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn depth_limit_stops_fan_out() {
        let (scheduler, _rx, _) = scheduler(1, DelayRange::NONE);
        let mut chain = ChainContext::origin("m1", "u1");
        chain.is_chain = true;
        chain.depth = 1;
        assert_eq!(
            scheduler.fan_out(&reply_from("p1", chain)),
            FanOutOutcome::DepthExhausted { pruned: 0 }
        );
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_and_empty_replies_do_not_qualify() {
        let (scheduler, _rx, _) = scheduler(3, DelayRange::NONE);
        let mut reply = reply_from("p1", ChainContext::origin("m1", "u1"));
        reply.kind = MessageKind::Direct;
        assert_eq!(
            scheduler.fan_out(&reply),
            FanOutOutcome::NotQualified(NotQualified::NotGroup)
        );
        reply.kind = MessageKind::Group;
        reply.content = vec![MessagePart::text("  ")];
        assert_eq!(
            scheduler.fan_out(&reply),
            FanOutOutcome::NotQualified(NotQualified::EmptyReply)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_root_stops_pending_tasks() {
        let (scheduler, mut rx, metrics) = scheduler(3, DelayRange::new(30.0, 60.0));
        scheduler.fan_out(&reply_from("p1", ChainContext::origin("m1", "u1")));
        scheduler.fan_out(&reply_from("p1", ChainContext::origin("m2", "u1")));
        assert_eq!(scheduler.pending(), 4);

        assert_eq!(scheduler.cancel_root("m1"), 2);
        assert_eq!(scheduler.pending_for_root("m1"), 0);
        assert_eq!(scheduler.pending_for_root("m2"), 2);

        settle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.snapshot().chains_cancelled, 2);

        tokio::time::sleep(Duration::from_secs(61)).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.chain.unwrap().root_message_id, "m2");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_reaches_tasks_blocked_on_a_full_sink() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(InboundMessage::group("p9", "g1", "u1", "filler"))
            .await
            .unwrap();
        let metrics = RelayMetrics::new().into_arc();
        let scheduler = ChainScheduler::new(
            roster(),
            3,
            DelayRange::NONE,
            Arc::new(ScriptedRandom::constant(0.5)),
            Arc::new(tx),
            metrics.clone(),
        );
        scheduler.fan_out(&reply_from("p1", ChainContext::origin("m1", "u1")));
        settle().await;
        assert_eq!(scheduler.pending(), 2);

        assert_eq!(scheduler.cancel_root("m1"), 2);
        settle().await;
        assert_eq!(rx.recv().await.unwrap().platform_id, "p9");
        settle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(metrics.snapshot().chains_emitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn emission_failure_abandons_task() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let metrics = RelayMetrics::new().into_arc();
        let scheduler = ChainScheduler::new(
            roster(),
            3,
            DelayRange::NONE,
            Arc::new(ScriptedRandom::constant(0.5)),
            Arc::new(tx),
            metrics.clone(),
        );
        scheduler.fan_out(&reply_from("p1", ChainContext::origin("m1", "u1")));
        settle().await;
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.pending_keys(), Vec::new());
        assert_eq!(metrics.snapshot().chain_emit_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything() {
        let (scheduler, _rx, _) = scheduler(3, DelayRange::new(30.0, 60.0));
        scheduler.fan_out(&reply_from("p1", ChainContext::origin("m1", "u1")));
        scheduler.fan_out(&reply_from("p2", ChainContext::origin("m2", "u1")));
        assert_eq!(scheduler.shutdown(), 5);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn key_display_is_stable() {
        let key = ChainTaskKey {
            root_message_id: "m1".into(),
            target_platform_id: "p2".into(),
            target_depth: 2,
        };
        assert_eq!(key.to_string(), "m1_to_p2_depth2");
    }
}
