//! Sliding-window rate limiter, keyed by session id.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Allows at most `max_events` per key within any `window`.
/// A limit of zero disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    max_events: u32,
    window: Duration,
    entries: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_events: u32, window: Duration) -> Self {
        Self {
            max_events,
            window,
            entries: HashMap::new(),
        }
    }

    /// Limiter for `max_events` per second.
    pub fn per_second(max_events: u32) -> Self {
        Self::new(max_events, Duration::from_secs(1))
    }

    /// Record an event for `key` if it fits in the window.
    ///
    /// Returns `true` if allowed, `false` if rate-limited.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        self.check_and_record_at(key, Instant::now())
    }

    fn check_and_record_at(&mut self, key: &str, now: Instant) -> bool {
        if self.max_events == 0 {
            return true;
        }
        let window = self.window;
        let events = self.entries.entry(key.to_string()).or_default();
        while events
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            events.pop_front();
        }
        if events.len() as u32 >= self.max_events {
            return false;
        }
        events.push_back(now);
        true
    }

    /// Drop all history for `key`.
    pub fn forget(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop keys with no events inside the window.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, events| {
            events.retain(|t| now.saturating_duration_since(*t) < window);
            !events.is_empty()
        });
    }

    #[cfg(test)]
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}
