// src/throttle.rs

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// A per-key time window gate, shared across tasks.
///
/// At most one event per key is admitted inside any `window`; everything in
/// between is dropped rather than queued.
pub struct ThrottleGate {
    /// Minimum spacing between two admitted events for the same key.
    window: Duration,
    /// When each key last got through.
    last_admitted: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ThrottleGate {
    /// A zero window admits everything.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_admitted: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true and records `now` if `key` may emit at `now`.
    pub async fn admit(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut last_admitted = self.last_admitted.lock().await;
        if let Some(last) = last_admitted.get(key) {
            // A clock that went backwards counts as "no time passed".
            let since = (now - *last).to_std().unwrap_or(Duration::ZERO);
            if since < self.window {
                return false;
            }
        }
        last_admitted.insert(key.to_owned(), now);
        true
    }

    /// Drops the history for `key` so its next event passes immediately.
    pub async fn forget(&self, key: &str) {
        self.last_admitted.lock().await.remove(key);
    }
}
