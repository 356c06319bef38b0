// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A catalog entry that can be installed. Only `id` matters to the engine;
/// the rest is carried along so the installed list can be rendered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadableItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub developer_name: String,
    #[serde(default)]
    pub icon_url: String,
}

impl DownloadableItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            developer_name: String::new(),
            icon_url: String::new(),
        }
    }
}

/// Lifecycle state of a single install.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", content = "progress", rename_all = "snake_case")]
pub enum DownloadState {
    NotStarted,
    Downloading(f64),
    Paused(f64),
    Completed,
    NeedsRedownload,
}

impl DownloadState {
    pub fn is_downloading(&self) -> bool {
        matches!(self, DownloadState::Downloading(_))
    }

    /// The progress fraction implied by the state alone.
    pub fn progress(&self) -> f64 {
        match *self {
            DownloadState::Downloading(p) | DownloadState::Paused(p) => p,
            DownloadState::Completed => 1.0,
            DownloadState::NotStarted | DownloadState::NeedsRedownload => 0.0,
        }
    }
}

/// The engine's per-item state machine record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub id: String,
    pub state: DownloadState,
    pub progress_fraction: f64,
    /// Start of the current uninterrupted run. Never persisted.
    #[serde(skip)]
    pub started_at: Option<DateTime<Utc>>,
    /// Seconds already spent toward the total, carried across pauses and restarts.
    pub accumulated_elapsed: f64,
    /// Snapshot used to fill the installed list when the record completes.
    pub item: DownloadableItem,
}

impl DownloadRecord {
    pub fn new(item: DownloadableItem) -> Self {
        Self {
            id: item.id.clone(),
            state: DownloadState::NotStarted,
            progress_fraction: 0.0,
            started_at: None,
            accumulated_elapsed: 0.0,
            item,
        }
    }

    /// Elapsed seconds including the live run since `started_at`, if any.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> f64 {
        let live = self
            .started_at
            .map(|started| crate::clock::secs_between(started, now))
            .unwrap_or(0.0);
        self.accumulated_elapsed + live
    }

    /// Moves the live run into `accumulated_elapsed` and ends it.
    /// Returns the new accumulated value. Calling it twice folds nothing the second time.
    pub fn fold_elapsed(&mut self, now: DateTime<Utc>) -> f64 {
        self.accumulated_elapsed = self.elapsed_at(now);
        self.started_at = None;
        self.accumulated_elapsed
    }

    pub fn set_state(&mut self, state: DownloadState) {
        self.state = state;
        self.progress_fraction = state.progress();
    }
}

/// Progress for `elapsed` seconds out of `total`, clamped to `[0, 1]`.
pub fn progress_for(elapsed: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 1.0;
    }
    (elapsed / total).clamp(0.0, 1.0)
}
