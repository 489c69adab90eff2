//! Per-key alert cooldown.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::types::IdentityId;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Bucket that an alert decision is throttled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleKey {
    Identity(IdentityId),
    /// Shared by every face that could not be identified.
    Unknown,
}

/// Last-notification clock per key.
///
/// Entries are never evicted; the key space is bounded by the number of
/// enrolled identities plus the unknown bucket.
pub struct AlertThrottle {
    cooldown: Duration,
    last_notified: Mutex<HashMap<ThrottleKey, Instant>>,
}

impl AlertThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_notified: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Returns `true` if `key` has never notified or its last notification is
    /// at least one cooldown before `now`. Records `now` only when returning `true`.
    pub fn should_notify(&self, key: ThrottleKey, now: Instant) -> bool {
        let mut last = self
            .last_notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(&previous) = last.get(&key) {
            if now.saturating_duration_since(previous) < self.cooldown {
                return false;
            }
        }
        last.insert(key, now);
        true
    }

    /// Number of keys that have notified at least once.
    pub fn tracked_keys(&self) -> usize {
        self.last_notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for AlertThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
