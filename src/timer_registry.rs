// src/timer_registry.rs

use crate::clock::{secs_between, Clock};
use crate::models::progress_for;
use crate::state_manager::{keys, PersistHandle, StateError, StateManager};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Elapsed-time bookkeeping for one install, independent of any scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerEntry {
    pub id: String,
    pub started_at: DateTime<Utc>,
    /// Total seconds needed to reach 100%.
    pub duration: f64,
    /// Seconds already consumed when `started_at` was taken.
    pub accumulated_elapsed: f64,
}

impl TimerEntry {
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> f64 {
        self.accumulated_elapsed + secs_between(self.started_at, now)
    }

    pub fn progress_at(&self, now: DateTime<Utc>) -> f64 {
        progress_for(self.elapsed_at(now), self.duration)
    }
}

/// Named timers that keep counting across backgrounding and restarts.
///
/// Entries are saved on every change, so after a relaunch the progress of an
/// entry is its saved baseline plus the wall-clock gap since `started_at`.
pub struct TimerRegistry {
    entries: Mutex<HashMap<String, TimerEntry>>,
    clock: Arc<dyn Clock>,
    persist: PersistHandle,
}

impl TimerRegistry {
    pub fn new(clock: Arc<dyn Clock>, persist: PersistHandle) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            persist,
        }
    }

    /// Restores the entries saved by a previous process.
    pub async fn load(
        state: &StateManager,
        clock: Arc<dyn Clock>,
        persist: PersistHandle,
    ) -> Result<Self, StateError> {
        let entries: HashMap<String, TimerEntry> =
            state.get(keys::TIMER_ENTRIES).await?.unwrap_or_default();
        debug!(count = entries.len(), "loaded timer entries");
        Ok(Self {
            entries: Mutex::new(entries),
            clock,
            persist,
        })
    }

    /// Creates or replaces the entry for `id`, starting now.
    pub async fn start_timer(&self, id: &str, duration: f64, initial_elapsed: f64) {
        let entry = TimerEntry {
            id: id.to_owned(),
            started_at: self.clock.now(),
            duration,
            accumulated_elapsed: initial_elapsed,
        };
        let mut entries = self.entries.lock().await;
        entries.insert(id.to_owned(), entry);
        self.persist.save(keys::TIMER_ENTRIES, &*entries);
    }

    /// Removes the entry for `id`. Stopping an unknown id does nothing.
    pub async fn stop_timer(&self, id: &str) {
        let mut entries = self.entries.lock().await;
        if entries.remove(id).is_some() {
            self.persist.save(keys::TIMER_ENTRIES, &*entries);
        }
    }

    pub async fn progress(&self, id: &str) -> Option<f64> {
        let now = self.clock.now();
        self.entries.lock().await.get(id).map(|e| e.progress_at(now))
    }

    /// Seconds consumed so far, not clamped to the duration.
    pub async fn elapsed(&self, id: &str) -> Option<f64> {
        let now = self.clock.now();
        self.entries.lock().await.get(id).map(|e| e.elapsed_at(now))
    }

    pub async fn all_completed_ids(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut ids: Vec<String> = self
            .entries
            .lock()
            .await
            .values()
            .filter(|e| e.progress_at(now) >= 1.0)
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn entries(&self) -> Vec<TimerEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.lock().await.contains_key(id)
    }
}
