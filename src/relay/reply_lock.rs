//! Per-conversation reply lock
//!
//! At most one reply generation runs per `(platform kind, conversation)`.
//! Acquisition is an atomic check-and-set on a concurrent map.  Release is
//! deferred by a grace delay and guaranteed through [`ReplyLease`]'s `Drop`.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::message::InboundMessage;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyLockKey {
    pub platform_kind: String,
    pub conversation_id: String,
}

impl ReplyLockKey {
    pub fn new(platform_kind: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            platform_kind: platform_kind.into().to_lowercase(),
            conversation_id: conversation_id.into(),
        }
    }

    /// Lock key for a message: the session, else the sender, else the
    /// message itself.
    pub fn for_message(message: &InboundMessage) -> Self {
        let conversation = [&message.session_id, &message.sender_id, &message.id]
            .into_iter()
            .find(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_default();
        Self::new(&message.platform_kind, conversation)
    }
}

impl fmt::Display for ReplyLockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform_kind, self.conversation_id)
    }
}

/// Shared registry of held reply locks.
#[derive(Debug, Clone, Default)]
pub struct ReplyLockGuard {
    held: Arc<DashMap<ReplyLockKey, Instant>>,
}

impl ReplyLockGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically take the lock; false if someone already holds it.
    pub fn try_acquire(&self, key: &ReplyLockKey) -> bool {
        match self.held.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                tracing::debug!(lock = %key, "Reply lock acquired");
                true
            }
        }
    }

    /// Clear the lock.  Returns whether it was held.
    pub fn release(&self, key: &ReplyLockKey) -> bool {
        let released = self.held.remove(key).is_some();
        if released {
            tracing::debug!(lock = %key, "Reply lock released");
        }
        released
    }

    pub fn is_held(&self, key: &ReplyLockKey) -> bool {
        self.held.contains_key(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Acquire and wrap in a lease that releases `release_delay` after it
    /// is dropped or explicitly released.
    pub fn lease(&self, key: ReplyLockKey, release_delay: Duration) -> Option<ReplyLease> {
        if !self.try_acquire(&key) {
            return None;
        }
        Some(ReplyLease {
            guard: self.clone(),
            key: Some(key),
            release_delay,
        })
    }

    fn schedule_release(&self, key: ReplyLockKey, delay: Duration) {
        if delay.is_zero() {
            self.release(&key);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let guard = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    guard.release(&key);
                });
            }
            Err(_) => {
                self.release(&key);
            }
        }
    }
}

/// A held reply lock.  Dropping it schedules the delayed release.
#[derive(Debug)]
pub struct ReplyLease {
    guard: ReplyLockGuard,
    key: Option<ReplyLockKey>,
    release_delay: Duration,
}

impl ReplyLease {
    pub fn key(&self) -> Option<&ReplyLockKey> {
        self.key.as_ref()
    }

    pub fn release(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(key) = self.key.take() {
            self.guard.schedule_release(key, self.release_delay);
        }
    }
}

impl Drop for ReplyLease {
    fn drop(&mut self) {
        self.finish();
    }
}
