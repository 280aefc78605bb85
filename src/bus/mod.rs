//! In-process relay event bus
//!
//! A broadcast pub/sub bus that carries synthetic chain events back into the
//! host's inbound pipeline.  Each managed platform connection (or a single
//! loopback host) subscribes through a [`BusHandle`] and filters by topic.
//!
//! # Topic routing
//!
//! | Pattern | Semantics |
//! |---------|-----------|
//! | `platform.{id}` | Events addressed to one platform connection |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::relay::chain::{EmitError, EventSink};
use crate::relay::message::InboundMessage;

// ─── Envelope ────────────────────────────────────────────────────────────

/// Metadata wrapper for every event that travels through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Unique id for this envelope
    pub id: String,
    /// Routing topic, `platform.{id}`
    pub topic: String,
    /// Root message id of the chain this event belongs to
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub event: InboundMessage,
}

impl RelayEnvelope {
    pub fn for_event(event: InboundMessage) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: platform_topic(&event.platform_id),
            correlation_id: event.chain.as_ref().map(|c| c.root_message_id.clone()),
            timestamp: Utc::now(),
            event,
        }
    }
}

pub fn platform_topic(platform_id: &str) -> String {
    format!("platform.{platform_id}")
}

// ─── Constants ───────────────────────────────────────────────────────────

/// Default channel capacity (per bus instance)
const DEFAULT_BUS_CAPACITY: usize = 1024;

// ─── EventBus ────────────────────────────────────────────────────────────

/// Internally a `tokio::sync::broadcast` channel so every subscriber sees
/// every envelope; filtering happens on the consumer side.
pub struct EventBus {
    tx: broadcast::Sender<RelayEnvelope>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Create a handle for one subscriber.
    pub fn handle(self: &Arc<Self>, subscriber: impl Into<String>) -> BusHandle {
        BusHandle {
            subscriber: subscriber.into(),
            bus: Arc::clone(self),
            rx: self.tx.subscribe(),
        }
    }

    /// Publish an envelope; returns how many receivers got it.
    pub fn publish(&self, envelope: RelayEnvelope) -> usize {
        self.tx.send(envelope).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn submit(&self, event: InboundMessage) -> Result<(), EmitError> {
        let envelope = RelayEnvelope::for_event(event);
        let topic = envelope.topic.clone();
        match self.publish(envelope) {
            0 => Err(EmitError::NoSubscribers),
            receivers => {
                tracing::debug!(topic = %topic, receivers, "Relay event published");
                Ok(())
            }
        }
    }
}

// ─── BusHandle ───────────────────────────────────────────────────────────

/// A subscriber's view of the bus.
pub struct BusHandle {
    subscriber: String,
    bus: Arc<EventBus>,
    rx: broadcast::Receiver<RelayEnvelope>,
}

impl BusHandle {
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Receive the next envelope (blocks until available).
    pub async fn recv(&mut self) -> Option<RelayEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(env) => return Some(env),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        subscriber = %self.subscriber,
                        skipped = n,
                        "Bus handle lagged, skipping events"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive the next envelope whose topic starts with the given prefix.
    pub async fn recv_topic(&mut self, prefix: &str) -> Option<RelayEnvelope> {
        loop {
            match self.recv().await {
                Some(env) if env.topic.starts_with(prefix) => return Some(env),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Receive the next event for one platform connection.
    pub async fn recv_platform(&mut self, platform_id: &str) -> Option<RelayEnvelope> {
        let topic = platform_topic(platform_id);
        loop {
            match self.recv().await {
                Some(env) if env.topic == topic => return Some(env),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Try to receive without blocking.
    pub fn try_recv(&mut self) -> Option<RelayEnvelope> {
        loop {
            match self.rx.try_recv() {
                Ok(env) => return Some(env),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(
                        subscriber = %self.subscriber,
                        skipped = n,
                        "Bus handle lagged (try_recv), skipping"
                    );
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::message::ChainContext;

    fn chained(platform: &str, root: &str) -> InboundMessage {
        let mut ctx = ChainContext::origin(root, "u1");
        ctx.is_chain = true;
        ctx.depth = 1;
        InboundMessage::group(platform, "g1", "101", "hi").with_chain(ctx)
    }

    #[tokio::test]
    async fn submit_routes_by_platform_topic() {
        let bus = EventBus::new().into_arc();
        let mut host = bus.handle("host");

        bus.submit(chained("p2", "m1")).await.unwrap();

        let env = host.recv().await.unwrap();
        assert_eq!(env.topic, "platform.p2");
        assert_eq!(env.correlation_id.as_deref(), Some("m1"));
        assert_eq!(env.event.platform_id, "p2");
    }

    #[tokio::test]
    async fn submit_without_subscribers_fails() {
        let bus = EventBus::new();
        assert_eq!(
            bus.submit(chained("p2", "m1")).await,
            Err(EmitError::NoSubscribers)
        );
    }

    #[tokio::test]
    async fn recv_platform_skips_other_connections() {
        let bus = EventBus::new().into_arc();
        let mut p3 = bus.handle("p3");

        bus.submit(chained("p2", "m1")).await.unwrap();
        bus.submit(chained("p3", "m1")).await.unwrap();

        let env = p3.recv_platform("p3").await.unwrap();
        assert_eq!(env.event.platform_id, "p3");
        assert!(p3.try_recv().is_none());
    }

    #[tokio::test]
    async fn every_handle_sees_every_event() {
        let bus = EventBus::new().into_arc();
        let mut a = bus.handle("a");
        let mut b = bus.handle("b");
        assert_eq!(bus.receiver_count(), 2);

        bus.submit(chained("p1", "m9")).await.unwrap();
        assert!(a.try_recv().is_some());
        assert_eq!(b.recv_topic("platform.").await.unwrap().topic, "platform.p1");
    }
}
