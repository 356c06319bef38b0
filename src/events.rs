// src/events.rs

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityEvent;
use crate::models::DownloadState;
use crate::throttle::ThrottleGate;
use futures_util::Stream;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::trace;

/// Which refresh rate a progress subscriber wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cadence {
    /// Focused or detail views.
    Fast,
    /// List rows.
    Slow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub id: String,
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateChangedEvent {
    pub id: String,
    pub state: DownloadState,
}

/// "Something changed, re-read what you show."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalStateChanged;

/// One-shot notices meant for banners rather than rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Every install in `ids` was paused by the same connectivity drop.
    DownloadsPausedOffline { ids: Vec<String> },
    ConnectivityRestored,
}

/// Events that belong to a single item can be filtered by id.
pub trait Keyed {
    fn item_id(&self) -> Option<&str> {
        None
    }
}

impl Keyed for ProgressEvent {
    fn item_id(&self) -> Option<&str> {
        Some(&self.id)
    }
}

impl Keyed for StateChangedEvent {
    fn item_id(&self) -> Option<&str> {
        Some(&self.id)
    }
}

impl Keyed for GlobalStateChanged {}
impl Keyed for Notice {}
impl Keyed for ConnectivityEvent {}

/// A live subscription. Dropping it unsubscribes.
///
/// Delivery is best effort: a subscriber that falls behind skips the values
/// it missed and continues with the newest ones.
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
    replay: VecDeque<T>,
    filter: Option<String>,
}

impl<T: Clone + Keyed> Subscription<T> {
    pub(crate) fn new(rx: broadcast::Receiver<T>) -> Self {
        Self {
            rx,
            replay: VecDeque::new(),
            filter: None,
        }
    }

    /// Only deliver events for `id`.
    pub(crate) fn for_item(mut self, id: &str) -> Self {
        self.filter = Some(id.to_owned());
        self
    }

    /// Deliver `events` before anything broadcast after subscribing.
    pub(crate) fn with_replay(mut self, events: impl IntoIterator<Item = T>) -> Self {
        self.replay.extend(events);
        self
    }

    fn matches(&self, event: &T) -> bool {
        match (&self.filter, event.item_id()) {
            (Some(wanted), Some(id)) => wanted == id,
            _ => true,
        }
    }

    /// Waits for the next event. `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    trace!(skipped, "subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drains every event currently available.
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn unsubscribe(self) {}
}

impl<T: Clone + Keyed + Send + 'static> Subscription<T> {
    pub fn into_stream(self) -> impl Stream<Item = T> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

/// Fans store events out to any number of subscribers.
pub struct EventBroadcaster {
    clock: Arc<dyn Clock>,
    fast_tx: broadcast::Sender<ProgressEvent>,
    slow_tx: broadcast::Sender<ProgressEvent>,
    fast_gate: ThrottleGate,
    slow_gate: ThrottleGate,
    state_tx: broadcast::Sender<StateChangedEvent>,
    global_tx: broadcast::Sender<GlobalStateChanged>,
    notice_tx: broadcast::Sender<Notice>,
}

impl EventBroadcaster {
    pub fn new(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.event_capacity.max(1);
        Self {
            clock,
            fast_tx: broadcast::channel(capacity).0,
            slow_tx: broadcast::channel(capacity).0,
            fast_gate: ThrottleGate::new(config.fast_cadence),
            slow_gate: ThrottleGate::new(config.slow_cadence),
            state_tx: broadcast::channel(capacity).0,
            global_tx: broadcast::channel(capacity).0,
            notice_tx: broadcast::channel(capacity).0,
        }
    }

    /// Offers a progress tick to both cadences; each lets it through at most
    /// once per its window for this id.
    pub async fn publish_progress(&self, id: &str, progress: f64) {
        let now = self.clock.now();
        if self.fast_gate.admit(id, now).await {
            let _ = self.fast_tx.send(ProgressEvent { id: id.to_owned(), progress });
        }
        if self.slow_gate.admit(id, now).await {
            let _ = self.slow_tx.send(ProgressEvent { id: id.to_owned(), progress });
        }
    }

    /// Sends progress on both cadences regardless of throttling.
    pub fn publish_progress_now(&self, id: &str, progress: f64) {
        let _ = self.fast_tx.send(ProgressEvent { id: id.to_owned(), progress });
        let _ = self.slow_tx.send(ProgressEvent { id: id.to_owned(), progress });
    }

    pub fn publish_state(&self, id: &str, state: DownloadState) {
        trace!(id, ?state, "state changed");
        let _ = self.state_tx.send(StateChangedEvent { id: id.to_owned(), state });
    }

    pub fn publish_global(&self) {
        let _ = self.global_tx.send(GlobalStateChanged);
    }

    pub fn publish_notice(&self, notice: Notice) {
        let _ = self.notice_tx.send(notice);
    }

    /// Clears throttle history for `id` so a restarted install reports at once.
    pub async fn forget(&self, id: &str) {
        self.fast_gate.forget(id).await;
        self.slow_gate.forget(id).await;
    }

    pub fn subscribe_progress(&self, id: &str, cadence: Cadence) -> Subscription<ProgressEvent> {
        let rx = match cadence {
            Cadence::Fast => self.fast_tx.subscribe(),
            Cadence::Slow => self.slow_tx.subscribe(),
        };
        Subscription::new(rx).for_item(id)
    }

    pub fn subscribe_state(&self, id: &str) -> Subscription<StateChangedEvent> {
        Subscription::new(self.state_tx.subscribe()).for_item(id)
    }

    pub fn subscribe_all_states(&self) -> Subscription<StateChangedEvent> {
        Subscription::new(self.state_tx.subscribe())
    }

    pub fn subscribe_global(&self) -> Subscription<GlobalStateChanged> {
        Subscription::new(self.global_tx.subscribe())
    }

    pub fn subscribe_notices(&self) -> Subscription<Notice> {
        Subscription::new(self.notice_tx.subscribe())
    }
}
