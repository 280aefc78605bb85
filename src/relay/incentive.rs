//! Conversation incentive windows
//!
//! After a persona replies in a session, that `(platform, session)` pair is
//! "warm" for a fixed duration and the persona gets an extra roll at
//! replying.  Entries are overwritten on every confirmed reply and evicted
//! lazily when read after expiry.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::duration_from_secs;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    platform_id: String,
    session_id: String,
}

impl WindowKey {
    fn new(platform_id: &str, session_id: &str) -> Self {
        Self {
            platform_id: platform_id.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct IncentiveTracker {
    duration: Duration,
    windows: DashMap<WindowKey, Instant>,
}

impl IncentiveTracker {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            windows: DashMap::new(),
        }
    }

    /// Build from a configured number of seconds; zero or negative disables.
    pub fn from_secs(seconds: f64) -> Self {
        Self::new(duration_from_secs("incentive_duration", seconds))
    }

    pub fn is_enabled(&self) -> bool {
        !self.duration.is_zero()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Open (or restart) the window for this persona and session.
    pub fn activate(&self, platform_id: &str, session_id: &str, now: Instant) {
        if !self.is_enabled() {
            return;
        }
        let expires_at = now + self.duration;
        self.windows
            .insert(WindowKey::new(platform_id, session_id), expires_at);
        tracing::debug!(
            platform_id = %platform_id,
            session_id = %session_id,
            window_secs = self.duration.as_secs_f64(),
            "Conversation incentive activated"
        );
    }

    /// True iff a window exists and `now` is before its expiry.  An expired
    /// window is removed.
    pub fn is_active(&self, platform_id: &str, session_id: &str, now: Instant) -> bool {
        let key = WindowKey::new(platform_id, session_id);
        let expires_at = match self.windows.get(&key) {
            Some(entry) => *entry.value(),
            None => return false,
        };
        if now < expires_at {
            return true;
        }
        // Only evict if nobody refreshed the window in between.
        self.windows.remove_if(&key, |_, exp| *exp <= now);
        tracing::debug!(platform_id = %platform_id, session_id = %session_id, "Conversation incentive expired");
        false
    }

    /// Whether an entry (expired or not) is still stored.
    pub fn contains(&self, platform_id: &str, session_id: &str) -> bool {
        self.windows
            .contains_key(&WindowKey::new(platform_id, session_id))
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_expires_and_is_evicted() {
        let tracker = IncentiveTracker::from_secs(120.0);
        let now = Instant::now();
        tracker.activate("p1", "g1", now);
        assert!(tracker.is_active("p1", "g1", now + Duration::from_secs(119)));
        assert!(!tracker.is_active("p1", "g2", now));
        assert!(!tracker.is_active("p1", "g1", now + Duration::from_secs(121)));
        assert!(!tracker.contains("p1", "g1"));
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let tracker = IncentiveTracker::from_secs(10.0);
        let now = Instant::now();
        tracker.activate("p1", "g1", now);
        assert!(!tracker.is_active("p1", "g1", now + Duration::from_secs(10)));
    }

    #[test]
    fn activation_overwrites_rather_than_extends() {
        let tracker = IncentiveTracker::from_secs(10.0);
        let now = Instant::now();
        tracker.activate("p1", "g1", now);
        tracker.activate("p1", "g1", now + Duration::from_secs(5));
        assert!(tracker.is_active("p1", "g1", now + Duration::from_secs(14)));
        assert!(!tracker.is_active("p1", "g1", now + Duration::from_secs(15)));
    }

    #[test]
    fn non_positive_duration_disables() {
        for secs in [0.0, -5.0] {
            let tracker = IncentiveTracker::from_secs(secs);
            let now = Instant::now();
            tracker.activate("p1", "g1", now);
            assert!(tracker.is_empty());
            assert!(!tracker.is_active("p1", "g1", now));
        }
    }

    #[test]
    fn oversized_duration_is_clamped() {
        let tracker = IncentiveTracker::from_secs(1e30);
        assert_eq!(tracker.duration(), crate::relay::MAX_CONFIGURED_DURATION);
        let now = Instant::now();
        tracker.activate("p1", "g1", now);
        assert!(tracker.is_active("p1", "g1", now + Duration::from_secs(86_400)));
    }
}
