// src/manager.rs

use crate::clock::{secs_between, Clock};
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::events::{
    Cadence, EventBroadcaster, GlobalStateChanged, Notice, ProgressEvent, StateChangedEvent,
    Subscription,
};
use crate::models::{progress_for, DownloadRecord, DownloadState, DownloadableItem};
use crate::state_manager::{keys, PersistHandle, StateError, StateManager};
use crate::timer_registry::TimerRegistry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// What a reconciliation pass did to the in-flight installs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileSummary {
    pub completed: Vec<String>,
    pub resumed: Vec<String>,
    pub paused: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Continue,
    Stop,
}

struct Ticker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything guarded by the store lock. All record mutation happens with it held.
#[derive(Default)]
struct StoreState {
    records: HashMap<String, DownloadRecord>,
    installed: Vec<DownloadableItem>,
    last_backgrounded_at: Option<DateTime<Utc>>,
    tickers: HashMap<String, Ticker>,
    launched: bool,
}

impl StoreState {
    /// Cancels the ticker for `id`, if any. Safe to call from that ticker's own tick.
    fn stop_ticker(&mut self, id: &str) {
        if let Some(ticker) = self.tickers.remove(id) {
            ticker.token.cancel();
        }
    }

    fn downloading_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .values()
            .filter(|r| r.state.is_downloading())
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Owns every install record and the installed list, and drives their
/// transitions.
pub struct DownloadStore {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    persist: PersistHandle,
    connectivity: ConnectivityMonitor,
    timers: Arc<TimerRegistry>,
    events: Arc<EventBroadcaster>,
    state: Mutex<StoreState>,
}

impl DownloadStore {
    /// Restores records, the installed list and the background mark as they
    /// were saved. Nothing is reconciled until [`DownloadStore::launch`].
    pub async fn load(
        config: EngineConfig,
        state_manager: &StateManager,
        persist: PersistHandle,
        clock: Arc<dyn Clock>,
        connectivity: ConnectivityMonitor,
        timers: Arc<TimerRegistry>,
        events: Arc<EventBroadcaster>,
    ) -> Result<Arc<Self>, StateError> {
        let records: HashMap<String, DownloadRecord> = state_manager
            .get(keys::DOWNLOAD_RECORDS)
            .await?
            .unwrap_or_default();
        let installed: Vec<DownloadableItem> = state_manager
            .get(keys::INSTALLED_ITEMS)
            .await?
            .unwrap_or_default();
        let last_backgrounded_at: Option<DateTime<Utc>> =
            state_manager.get(keys::LAST_BACKGROUNDED_AT).await?;

        debug!(
            records = records.len(),
            installed = installed.len(),
            backgrounded = last_backgrounded_at.is_some(),
            "loaded install state"
        );

        Ok(Arc::new(Self {
            config,
            clock,
            persist,
            connectivity,
            timers,
            events,
            state: Mutex::new(StoreState {
                records,
                installed,
                last_backgrounded_at,
                ..StoreState::default()
            }),
        }))
    }

    fn total_secs(&self) -> f64 {
        self.config.total_secs()
    }

    // ---- reads -------------------------------------------------------------

    pub async fn get_state(&self, id: &str) -> DownloadState {
        self.state
            .lock()
            .await
            .records
            .get(id)
            .map(|r| r.state)
            .unwrap_or(DownloadState::NotStarted)
    }

    pub async fn record(&self, id: &str) -> Option<DownloadRecord> {
        self.state.lock().await.records.get(id).cloned()
    }

    pub async fn records(&self) -> Vec<DownloadRecord> {
        let mut records: Vec<DownloadRecord> =
            self.state.lock().await.records.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn installed_items(&self) -> Vec<DownloadableItem> {
        self.state.lock().await.installed.clone()
    }

    pub async fn is_backgrounded(&self) -> bool {
        self.state.lock().await.last_backgrounded_at.is_some()
    }

    pub async fn active_tickers(&self) -> usize {
        self.state.lock().await.tickers.len()
    }

    // ---- user transitions --------------------------------------------------

    /// Starts or resumes an install. Returns false when nothing changed.
    pub async fn start(self: &Arc<Self>, item: DownloadableItem) -> bool {
        let mut st = self.state.lock().await;
        if !self.connectivity.is_connected().await {
            debug!(id = %item.id, "offline, start ignored");
            return false;
        }

        let now = self.clock.now();
        let id = item.id.clone();
        let record = st
            .records
            .entry(id.clone())
            .or_insert_with(|| DownloadRecord::new(item.clone()));

        match record.state {
            DownloadState::Downloading(_) | DownloadState::Completed => return false,
            DownloadState::NotStarted | DownloadState::NeedsRedownload => {
                record.accumulated_elapsed = 0.0;
                record.set_state(DownloadState::Downloading(0.0));
            }
            DownloadState::Paused(p) => record.set_state(DownloadState::Downloading(p)),
        }
        record.item = item;
        record.started_at = Some(now);
        let accumulated = record.accumulated_elapsed;
        let state = record.state;

        self.timers.start_timer(&id, self.total_secs(), accumulated).await;
        self.events.forget(&id).await;
        self.spawn_ticker(&mut st, &id);
        self.save_all(&st);

        info!(%id, progress = state.progress(), "install started");
        self.events.publish_state(&id, state);
        self.events.publish_progress_now(&id, state.progress());
        self.events.publish_global();
        true
    }

    /// Pauses a running install. Pausing anything else is a no-op.
    pub async fn pause(&self, id: &str) -> bool {
        let mut st = self.state.lock().await;
        let now = self.clock.now();
        let Some(state) = self.pause_locked(&mut st, id, now).await else {
            return false;
        };
        self.save_all(&st);

        info!(id, ?state, "install paused");
        self.events.publish_state(id, state);
        self.events.publish_global();
        true
    }

    /// Stops any running install for `id`, uninstalls it, and marks it for redownload.
    pub async fn delete(&self, id: &str) -> bool {
        let mut st = self.state.lock().await;
        st.stop_ticker(id);
        self.timers.stop_timer(id).await;
        self.events.forget(id).await;

        let before = st.installed.len();
        st.installed.retain(|item| item.id != id);
        let uninstalled = st.installed.len() != before;

        let Some(record) = st.records.get_mut(id) else {
            if uninstalled {
                self.save_all(&st);
                self.events.publish_global();
            }
            return uninstalled;
        };
        record.started_at = None;
        record.accumulated_elapsed = 0.0;
        record.set_state(DownloadState::NeedsRedownload);
        self.save_all(&st);

        info!(id, "install deleted");
        self.events.publish_state(id, DownloadState::NeedsRedownload);
        self.events.publish_global();
        true
    }

    // ---- connectivity ------------------------------------------------------

    /// Pauses every running install and announces them in one notice.
    pub async fn handle_connectivity_lost(&self) -> Vec<String> {
        let mut st = self.state.lock().await;
        let now = self.clock.now();

        let mut paused = Vec::new();
        for id in st.downloading_ids() {
            if let Some(state) = self.pause_locked(&mut st, &id, now).await {
                self.events.publish_state(&id, state);
                paused.push(id);
            }
        }
        if paused.is_empty() {
            return paused;
        }

        self.save_all(&st);
        warn!(count = paused.len(), "installs paused, connection lost");
        self.events.publish_notice(Notice::DownloadsPausedOffline { ids: paused.clone() });
        self.events.publish_global();
        paused
    }

    /// Announces the connection is back. Paused installs stay paused until
    /// the user resumes them.
    pub fn handle_connectivity_restored(&self) {
        info!("connection restored");
        self.events.publish_notice(Notice::ConnectivityRestored);
    }

    // ---- reconciliation ----------------------------------------------------

    /// Credits `seconds` of off-screen time to every running install and
    /// clears the background mark, so the same gap is never applied twice.
    pub async fn reconcile_elapsed_background_time(
        self: &Arc<Self>,
        seconds: f64,
    ) -> ReconcileSummary {
        let mut st = self.state.lock().await;
        st.last_backgrounded_at = None;
        let summary = self.reconcile_locked(&mut st, seconds).await;
        self.save_all(&st);
        self.events.publish_global();
        summary
    }

    async fn reconcile_locked(
        self: &Arc<Self>,
        st: &mut StoreState,
        seconds: f64,
    ) -> ReconcileSummary {
        let now = self.clock.now();
        let connected = self.connectivity.is_connected().await;
        let total = self.total_secs();
        let mut summary = ReconcileSummary::default();

        for id in st.downloading_ids() {
            let Some(record) = st.records.get_mut(&id) else {
                continue;
            };
            record.fold_elapsed(now);
            // NaN and negative gaps credit nothing; anything past the total is capped.
            record.accumulated_elapsed = (record.accumulated_elapsed + seconds.max(0.0)).min(total);
            let accumulated = record.accumulated_elapsed;
            let progress = progress_for(accumulated, total);

            let state = if progress >= 1.0 {
                self.complete_locked(st, &id).await;
                summary.completed.push(id.clone());
                DownloadState::Completed
            } else if !connected {
                record.set_state(DownloadState::Paused(progress));
                st.stop_ticker(&id);
                self.timers.stop_timer(&id).await;
                summary.paused.push(id.clone());
                DownloadState::Paused(progress)
            } else {
                record.set_state(DownloadState::Downloading(progress));
                record.started_at = Some(now);
                self.timers.start_timer(&id, total, accumulated).await;
                self.spawn_ticker(st, &id);
                summary.resumed.push(id.clone());
                DownloadState::Downloading(progress)
            };
            self.events.publish_state(&id, state);
        }

        debug!(seconds, ?summary, "reconciled background time");
        summary
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Freezes running installs at the moment the app leaves the screen.
    pub async fn enter_background(&self) {
        {
            let mut st = self.state.lock().await;
            if st.last_backgrounded_at.is_some() {
                return;
            }
            self.freeze_locked(&mut st).await;
            self.save_all(&st);
        }
        self.persist.flush().await;
    }

    /// Credits the time spent in the background. Returns `None` when the
    /// store was not backgrounded.
    pub async fn enter_foreground(self: &Arc<Self>) -> Option<ReconcileSummary> {
        let mut st = self.state.lock().await;
        let since = st.last_backgrounded_at.take()?;
        let gap = secs_between(since, self.clock.now());
        let summary = self.reconcile_locked(&mut st, gap).await;
        self.save_all(&st);

        info!(gap, completed = summary.completed.len(), "returned to foreground");
        self.events.publish_global();
        Some(summary)
    }

    /// Records the termination moment like a backgrounding, stops every
    /// ticker, and waits for pending saves.
    pub async fn terminate(&self) {
        let handles = {
            let mut st = self.state.lock().await;
            if st.last_backgrounded_at.is_none() {
                self.freeze_locked(&mut st).await;
                self.save_all(&st);
            }
            Self::take_tickers(&mut st)
        };
        Self::join_tickers(handles).await;
        self.persist.flush().await;
    }

    /// Brings installs saved as running by a previous process to a
    /// consistent state. Runs once per store.
    ///
    /// Elapsed time comes from the persisted timer entry, which keeps counting
    /// while the app is gone. Installs that reached the total are completed;
    /// the rest are paused and wait for the user to resume them.
    pub async fn launch(&self) -> ReconcileSummary {
        let mut st = self.state.lock().await;
        let mut summary = ReconcileSummary::default();
        if st.launched {
            return summary;
        }
        st.launched = true;

        let now = self.clock.now();
        let total = self.total_secs();
        let gap = st
            .last_backgrounded_at
            .take()
            .map(|since| secs_between(since, now))
            .unwrap_or(0.0);

        let finished = self.timers.all_completed_ids().await;
        for id in st.downloading_ids() {
            let Some(record) = st.records.get(&id) else {
                continue;
            };
            // Started in this process already.
            if record.started_at.is_some() {
                continue;
            }
            let fallback = record.accumulated_elapsed + gap;
            let elapsed = self.timers.elapsed(&id).await.unwrap_or(fallback);

            let Some(record) = st.records.get_mut(&id) else {
                continue;
            };
            record.accumulated_elapsed = elapsed.max(record.accumulated_elapsed).min(total);
            let progress = progress_for(record.accumulated_elapsed, total);

            if progress >= 1.0 || finished.binary_search(&id).is_ok() {
                self.complete_locked(&mut st, &id).await;
                summary.completed.push(id);
            } else {
                record.set_state(DownloadState::Paused(progress));
                self.timers.stop_timer(&id).await;
                summary.paused.push(id);
            }
        }

        // Timer entries whose record is not running any more.
        for entry in self.timers.entries().await {
            let running = st
                .records
                .get(&entry.id)
                .map(|r| r.state.is_downloading())
                .unwrap_or(false);
            if !running {
                debug!(id = %entry.id, "dropping stale timer entry");
                self.timers.stop_timer(&entry.id).await;
            }
        }

        self.save_all(&st);
        info!(
            completed = summary.completed.len(),
            paused = summary.paused.len(),
            "launch reconciliation finished"
        );
        summary
    }

    /// Re-announces every record so freshly mounted views show current state.
    pub async fn replay(&self) {
        let st = self.state.lock().await;
        let mut records: Vec<&DownloadRecord> = st.records.values().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        for record in records {
            self.events.publish_state(&record.id, record.state);
            if matches!(
                record.state,
                DownloadState::Downloading(_) | DownloadState::Paused(_)
            ) {
                self.events.publish_progress_now(&record.id, record.progress_fraction);
            }
        }
        self.events.publish_global();
    }

    /// Stops every ticker. Records keep their state.
    pub async fn shutdown(&self) {
        let handles = Self::take_tickers(&mut *self.state.lock().await);
        Self::join_tickers(handles).await;
        debug!("install store shut down");
    }

    // ---- subscriptions -----------------------------------------------------

    /// Progress for `id` at `cadence`, starting with the current value if the
    /// install is in flight.
    pub async fn on_progress(&self, id: &str, cadence: Cadence) -> Subscription<ProgressEvent> {
        let sub = self.events.subscribe_progress(id, cadence);
        let current = self.get_state(id).await;
        let replay = match current {
            DownloadState::Downloading(p) | DownloadState::Paused(p) => Some(ProgressEvent {
                id: id.to_owned(),
                progress: p,
            }),
            _ => None,
        };
        sub.with_replay(replay)
    }

    /// State changes for `id`, starting with its current state.
    pub async fn on_state_changed(&self, id: &str) -> Subscription<StateChangedEvent> {
        let sub = self.events.subscribe_state(id);
        let state = self.get_state(id).await;
        sub.with_replay([StateChangedEvent { id: id.to_owned(), state }])
    }

    pub fn on_global_state_changed(&self) -> Subscription<GlobalStateChanged> {
        self.events.subscribe_global()
    }

    pub fn on_notice(&self) -> Subscription<Notice> {
        self.events.subscribe_notices()
    }

    // ---- internals ---------------------------------------------------------

    fn spawn_ticker(self: &Arc<Self>, st: &mut StoreState, id: &str) {
        st.stop_ticker(id);

        let token = CancellationToken::new();
        let tick_token = token.clone();
        let store = Arc::clone(self);
        let ticker_id = id.to_owned();
        let period = self.config.tick_interval;

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_persist = store.clock.now();

            loop {
                tokio::select! {
                    _ = tick_token.cancelled() => break,
                    _ = ticks.tick() => {}
                }
                if store.tick(&ticker_id, &tick_token, &mut last_persist).await == TickOutcome::Stop {
                    break;
                }
            }
            trace!(id = %ticker_id, "ticker stopped");
        });

        st.tickers.insert(id.to_owned(), Ticker { token, handle });
    }

    async fn tick(
        &self,
        id: &str,
        token: &CancellationToken,
        last_persist: &mut DateTime<Utc>,
    ) -> TickOutcome {
        let mut st = self.state.lock().await;
        // A pause, delete or restart got the lock first.
        if token.is_cancelled() {
            return TickOutcome::Stop;
        }

        let now = self.clock.now();
        let running = st
            .records
            .get(id)
            .map(|r| r.state.is_downloading())
            .unwrap_or(false);
        if !running {
            warn!(id, "tick without a running record, stopping ticker");
            st.stop_ticker(id);
            return TickOutcome::Stop;
        }

        if !self.connectivity.is_connected().await {
            if let Some(state) = self.pause_locked(&mut st, id, now).await {
                self.save_all(&st);
                self.events.publish_state(id, state);
                self.events.publish_global();
            }
            return TickOutcome::Stop;
        }

        let Some(record) = st.records.get_mut(id) else {
            return TickOutcome::Stop;
        };
        let progress = progress_for(record.elapsed_at(now), self.total_secs());

        if progress >= 1.0 {
            self.complete_locked(&mut st, id).await;
            self.save_all(&st);
            info!(id, "install completed");
            self.events.publish_state(id, DownloadState::Completed);
            self.events.publish_progress_now(id, 1.0);
            self.events.publish_global();
            return TickOutcome::Stop;
        }

        record.set_state(DownloadState::Downloading(progress));
        if secs_between(*last_persist, now) >= self.config.persist_interval.as_secs_f64() {
            self.save_records(&st);
            *last_persist = now;
        }

        // Published under the lock so a restarted run never sees this run's value.
        self.events.publish_progress(id, progress).await;
        TickOutcome::Continue
    }

    /// The pause transition. Folds the live run exactly once; only a
    /// `Downloading` record is touched.
    async fn pause_locked(
        &self,
        st: &mut StoreState,
        id: &str,
        now: DateTime<Utc>,
    ) -> Option<DownloadState> {
        let running = st.records.get(id).map(|r| r.state.is_downloading())?;
        if !running {
            return None;
        }
        st.stop_ticker(id);
        // While backgrounded the record holds no live run; the timer entry
        // kept counting.
        let counted = self.timers.elapsed(id).await.unwrap_or(0.0);
        self.timers.stop_timer(id).await;

        let total = self.total_secs();
        let record = st.records.get_mut(id)?;
        let accumulated = record.fold_elapsed(now).max(counted).min(total);
        record.accumulated_elapsed = accumulated;
        let progress = progress_for(accumulated, total);
        if progress >= 1.0 {
            self.complete_locked(st, id).await;
            return Some(DownloadState::Completed);
        }
        record.set_state(DownloadState::Paused(progress));
        Some(record.state)
    }

    async fn complete_locked(&self, st: &mut StoreState, id: &str) {
        st.stop_ticker(id);
        self.timers.stop_timer(id).await;
        self.events.forget(id).await;

        let Some(record) = st.records.get_mut(id) else {
            return;
        };
        record.started_at = None;
        record.set_state(DownloadState::Completed);
        let item = record.item.clone();
        if !st.installed.iter().any(|installed| installed.id == item.id) {
            st.installed.push(item);
        }
    }

    /// Folds the live run of every running install, stops their tickers and
    /// marks the store as backgrounded. Timer entries are re-based and keep
    /// counting.
    async fn freeze_locked(&self, st: &mut StoreState) {
        let now = self.clock.now();
        let total = self.total_secs();

        for id in st.downloading_ids() {
            st.stop_ticker(&id);
            let Some(record) = st.records.get_mut(&id) else {
                continue;
            };
            let accumulated = record.fold_elapsed(now);
            let progress = progress_for(accumulated, total);
            if progress >= 1.0 {
                self.complete_locked(st, &id).await;
                self.events.publish_state(&id, DownloadState::Completed);
            } else {
                record.set_state(DownloadState::Downloading(progress));
                self.timers.start_timer(&id, total, accumulated).await;
            }
        }
        st.last_backgrounded_at = Some(now);
        debug!(at = %now, "entered background");
    }

    fn take_tickers(st: &mut StoreState) -> Vec<JoinHandle<()>> {
        st.tickers
            .drain()
            .map(|(_, ticker)| {
                ticker.token.cancel();
                ticker.handle
            })
            .collect()
    }

    async fn join_tickers(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn save_records(&self, st: &StoreState) {
        self.persist.save(keys::DOWNLOAD_RECORDS, &st.records);
    }

    fn save_all(&self, st: &StoreState) {
        self.save_records(st);
        self.persist.save(keys::INSTALLED_ITEMS, &st.installed);
        match st.last_backgrounded_at {
            Some(at) => self.persist.save(keys::LAST_BACKGROUNDED_AT, &at),
            None => self.persist.remove(keys::LAST_BACKGROUNDED_AT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connectivity::NetworkPath;
    use std::time::Duration;

    const LONG_TICK: Duration = Duration::from_secs(3600);
    const FAST_TICK: Duration = Duration::from_millis(10);

    struct Harness {
        store: Arc<DownloadStore>,
        clock: Arc<ManualClock>,
        connectivity: ConnectivityMonitor,
        state: StateManager,
        persist: PersistHandle,
        events: Arc<EventBroadcaster>,
        config: EngineConfig,
    }

    impl Harness {
        async fn new(tick: Duration) -> Self {
            let config = EngineConfig {
                tick_interval: tick,
                ..EngineConfig::default()
            };
            let state = StateManager::in_memory().await.unwrap();
            let (persist, _) = state.spawn_writer();
            let clock = Arc::new(ManualClock::default());
            let connectivity = ConnectivityMonitor::new(16);
            let events = Arc::new(EventBroadcaster::new(&config, clock.clone()));
            let timers = Arc::new(TimerRegistry::new(clock.clone(), persist.clone()));
            let store = DownloadStore::load(
                config.clone(),
                &state,
                persist.clone(),
                clock.clone(),
                connectivity.clone(),
                timers,
                events.clone(),
            )
            .await
            .unwrap();
            Self { store, clock, connectivity, state, persist, events, config }
        }

        /// A second store over the same database, as after a process restart.
        async fn reload(&self) -> Arc<DownloadStore> {
            self.persist.flush().await;
            let timers = TimerRegistry::load(&self.state, self.clock.clone(), self.persist.clone())
                .await
                .unwrap();
            DownloadStore::load(
                self.config.clone(),
                &self.state,
                self.persist.clone(),
                self.clock.clone(),
                ConnectivityMonitor::new(16),
                Arc::new(timers),
                self.events.clone(),
            )
            .await
            .unwrap()
        }

        async fn go_offline(&self) {
            self.connectivity.start().await;
            self.connectivity.observe(NetworkPath::offline()).await;
        }
    }

    fn item(id: &str) -> DownloadableItem {
        DownloadableItem::new(id, format!("App {id}"))
    }

    async fn wait_for_state(sub: &mut Subscription<StateChangedEvent>, wanted: fn(&DownloadState) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(event) = sub.recv().await {
                if wanted(&event.state) {
                    return;
                }
            }
        })
        .await
        .expect("state never reached");
    }

    #[tokio::test]
    async fn start_on_running_install_changes_nothing() {
        let h = Harness::new(LONG_TICK).await;
        assert!(h.store.start(item("a")).await);
        h.clock.advance_secs(3.0);
        let before = h.store.record("a").await.unwrap();

        assert!(!h.store.start(item("a")).await);
        assert_eq!(h.store.record("a").await.unwrap(), before);
    }

    #[tokio::test]
    async fn pausing_twice_folds_elapsed_once() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(6.0);

        assert!(h.store.pause("a").await);
        h.clock.advance_secs(10.0);
        assert!(!h.store.pause("a").await);

        let record = h.store.record("a").await.unwrap();
        assert_eq!(record.state, DownloadState::Paused(0.2));
        assert_eq!(record.progress_fraction, 0.2);
        assert_eq!(record.accumulated_elapsed, 6.0);
        assert!(record.started_at.is_none());
        assert_eq!(h.store.active_tickers().await, 0);
    }

    #[tokio::test]
    async fn resume_keeps_accumulated_time() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(6.0);
        h.store.pause("a").await;
        h.clock.advance_secs(100.0);

        assert!(h.store.start(item("a")).await);
        let record = h.store.record("a").await.unwrap();
        assert_eq!(record.state, DownloadState::Downloading(0.2));
        assert_eq!(record.accumulated_elapsed, 6.0);
        assert!(record.started_at.is_some());
    }

    #[tokio::test]
    async fn offline_start_is_refused() {
        let h = Harness::new(LONG_TICK).await;
        h.go_offline().await;
        assert!(!h.store.start(item("a")).await);
        assert_eq!(h.store.get_state("a").await, DownloadState::NotStarted);
    }

    #[tokio::test]
    async fn background_gap_covering_the_rest_completes() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(10.0);
        h.store.enter_background().await;
        assert_eq!(h.store.record("a").await.unwrap().accumulated_elapsed, 10.0);

        let summary = h.store.reconcile_elapsed_background_time(25.0).await;
        assert_eq!(summary.completed, vec!["a".to_string()]);
        assert_eq!(h.store.get_state("a").await, DownloadState::Completed);
        assert_eq!(h.store.installed_items().await, vec![item("a")]);
        assert!(!h.store.is_backgrounded().await);
    }

    #[tokio::test]
    async fn partial_gap_keeps_downloading_when_online() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(10.0);
        h.store.enter_background().await;
        assert_eq!(h.store.active_tickers().await, 0);

        h.store.reconcile_elapsed_background_time(5.0).await;
        let record = h.store.record("a").await.unwrap();
        assert_eq!(record.accumulated_elapsed, 15.0);
        assert!((record.progress_fraction - 0.5).abs() < 1e-9);
        assert_eq!(record.state, DownloadState::Downloading(0.5));
        assert_eq!(h.store.active_tickers().await, 1);
    }

    #[tokio::test]
    async fn partial_gap_pauses_when_offline() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(10.0);
        h.store.enter_background().await;
        h.go_offline().await;

        let summary = h.store.reconcile_elapsed_background_time(5.0).await;
        assert_eq!(summary.paused, vec!["a".to_string()]);
        assert_eq!(h.store.get_state("a").await, DownloadState::Paused(0.5));
        assert_eq!(h.store.active_tickers().await, 0);
    }

    #[tokio::test]
    async fn foreground_credits_the_wall_clock_gap() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(3.0);
        h.store.enter_background().await;
        h.clock.advance_secs(12.0);

        let summary = h.store.enter_foreground().await.unwrap();
        assert_eq!(summary.resumed, vec!["a".to_string()]);
        assert_eq!(h.store.record("a").await.unwrap().accumulated_elapsed, 15.0);
        assert!(h.store.enter_foreground().await.is_none());
    }

    #[tokio::test]
    async fn connectivity_loss_pauses_all_with_one_notice() {
        let h = Harness::new(LONG_TICK).await;
        let mut notices = h.store.on_notice();
        h.store.start(item("a")).await;
        h.store.start(item("b")).await;
        h.clock.advance_secs(3.0);
        h.go_offline().await;

        let paused = h.store.handle_connectivity_lost().await;
        assert_eq!(paused, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            notices.try_recv(),
            Some(Notice::DownloadsPausedOffline { ids: paused.clone() })
        );
        assert!(notices.try_recv().is_none());
        assert_eq!(h.store.get_state("a").await, DownloadState::Paused(0.1));

        h.store.handle_connectivity_restored();
        assert_eq!(notices.try_recv(), Some(Notice::ConnectivityRestored));
        assert_eq!(h.store.get_state("b").await, DownloadState::Paused(0.1));
    }

    #[tokio::test]
    async fn deleting_a_running_install_stops_its_ticker() {
        let h = Harness::new(FAST_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(5.0);

        assert!(h.store.delete("a").await);
        assert_eq!(h.store.active_tickers().await, 0);
        let record = h.store.record("a").await.unwrap();
        assert_eq!(record.state, DownloadState::NeedsRedownload);
        assert_eq!(record.progress_fraction, 0.0);

        let mut progress = h.store.on_progress("a", Cadence::Fast).await;
        h.clock.advance_secs(5.0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(progress.try_recv().is_none());
    }

    #[tokio::test]
    async fn deleting_an_installed_item_allows_redownload() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.store.reconcile_elapsed_background_time(60.0).await;
        assert_eq!(h.store.installed_items().await.len(), 1);

        h.store.delete("a").await;
        assert!(h.store.installed_items().await.is_empty());
        assert!(h.store.start(item("a")).await);
        assert_eq!(h.store.get_state("a").await, DownloadState::Downloading(0.0));
    }

    #[tokio::test]
    async fn ticks_drive_an_install_to_completion() {
        let h = Harness::new(FAST_TICK).await;
        let mut states = h.store.on_state_changed("a").await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(31.0);

        wait_for_state(&mut states, |s| *s == DownloadState::Completed).await;
        assert_eq!(h.store.installed_items().await, vec![item("a")]);
        assert_eq!(h.store.active_tickers().await, 0);
    }

    #[tokio::test]
    async fn tick_pauses_when_the_connection_is_gone() {
        let h = Harness::new(FAST_TICK).await;
        let mut states = h.store.on_state_changed("a").await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(9.0);
        h.go_offline().await;

        wait_for_state(&mut states, |s| matches!(s, DownloadState::Paused(_))).await;
        assert_eq!(h.store.record("a").await.unwrap().accumulated_elapsed, 9.0);
    }

    #[tokio::test]
    async fn progress_never_goes_backwards() {
        let h = Harness::new(FAST_TICK).await;
        let mut progress = h.store.on_progress("a", Cadence::Fast).await;
        h.store.start(item("a")).await;

        for _ in 0..20 {
            h.clock.advance_secs(0.5);
            tokio::time::sleep(Duration::from_millis(15)).await;
        }

        let seen: Vec<f64> = progress.drain().into_iter().map(|e| e.progress).collect();
        assert!(seen.len() > 1);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn reload_restores_records_exactly() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("done")).await;
        h.store.reconcile_elapsed_background_time(45.0).await;

        h.store.start(item("running")).await;
        h.store.start(item("paused")).await;
        h.clock.advance_secs(7.0);
        h.store.pause("paused").await;
        h.store.start(item("deleted")).await;
        h.store.delete("deleted").await;

        let reloaded = h.reload().await;
        let before = h.store.records().await;
        let after = reloaded.records().await;
        assert_eq!(before.len(), 4);
        for (old, new) in before.iter().zip(after.iter()) {
            assert_eq!(old.id, new.id);
            assert_eq!(old.state, new.state);
            assert_eq!(old.progress_fraction.to_bits(), new.progress_fraction.to_bits());
            assert_eq!(old.accumulated_elapsed.to_bits(), new.accumulated_elapsed.to_bits());
            assert_eq!(old.item, new.item);
            assert!(new.started_at.is_none());
        }
        assert_eq!(reloaded.installed_items().await, vec![item("done")]);
    }

    #[tokio::test]
    async fn launch_completes_or_pauses_saved_installs() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(20.0);
        h.store.start(item("b")).await;
        h.clock.advance_secs(2.0);
        h.store.enter_background().await;
        h.store.shutdown().await;

        h.clock.advance_secs(10.0);
        let reloaded = h.reload().await;
        assert!(reloaded.is_backgrounded().await);

        let summary = reloaded.launch().await;
        assert_eq!(summary.completed, vec!["a".to_string()]);
        assert_eq!(summary.paused, vec!["b".to_string()]);
        assert_eq!(reloaded.get_state("b").await, DownloadState::Paused(0.4));
        assert_eq!(reloaded.installed_items().await, vec![item("a")]);
        assert!(!reloaded.is_backgrounded().await);

        assert_eq!(reloaded.launch().await, ReconcileSummary::default());
    }

    #[tokio::test]
    async fn launch_after_a_crash_uses_timer_entries() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(5.0);
        h.store.shutdown().await;

        // No background mark was written; the process just vanished.
        h.clock.advance_secs(5.0);
        let reloaded = h.reload().await;
        reloaded.launch().await;

        let record = reloaded.record("a").await.unwrap();
        assert_eq!(record.accumulated_elapsed, 10.0);
        assert!(matches!(record.state, DownloadState::Paused(p) if (p - 1.0 / 3.0).abs() < 1e-9));
    }

    #[tokio::test]
    async fn terminate_marks_background_and_stops_tickers() {
        let h = Harness::new(FAST_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(4.0);

        h.store.terminate().await;
        assert!(h.store.is_backgrounded().await);
        assert_eq!(h.store.active_tickers().await, 0);
        assert_eq!(h.store.record("a").await.unwrap().accumulated_elapsed, 4.0);

        let reloaded = h.reload().await;
        assert!(reloaded.is_backgrounded().await);
    }

    #[tokio::test]
    async fn replay_reannounces_every_record() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.store.start(item("b")).await;
        h.store.pause("b").await;

        let mut states = h.events.subscribe_all_states();
        let mut global = h.store.on_global_state_changed();
        h.store.replay().await;

        let ids: Vec<String> = states.drain().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(global.drain().len(), 1);
    }

    #[tokio::test]
    async fn new_subscribers_get_current_state_first() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(3.0);
        h.store.pause("a").await;

        let mut states = h.store.on_state_changed("a").await;
        assert_eq!(states.try_recv().unwrap().state, DownloadState::Paused(0.1));
        let mut progress = h.store.on_progress("a", Cadence::Slow).await;
        assert_eq!(progress.try_recv().unwrap().progress, 0.1);
    }

    #[tokio::test]
    async fn connection_lost_while_backgrounded_keeps_the_time_away() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(10.0);
        h.store.enter_background().await;
        h.clock.advance_secs(15.0);
        h.go_offline().await;

        assert_eq!(h.store.handle_connectivity_lost().await, vec!["a".to_string()]);
        let record = h.store.record("a").await.unwrap();
        assert_eq!(record.accumulated_elapsed, 25.0);
        assert!(matches!(record.state, DownloadState::Paused(p) if (p - 25.0 / 30.0).abs() < 1e-9));

        // The gap is already credited; coming back adds nothing.
        h.clock.advance_secs(5.0);
        assert_eq!(h.store.enter_foreground().await, Some(ReconcileSummary::default()));
        assert_eq!(h.store.record("a").await.unwrap().accumulated_elapsed, 25.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_admit_exactly_one() {
        let h = Harness::new(LONG_TICK).await;
        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let store = h.store.clone();
                tokio::spawn(async move { store.start(item("a")).await })
            })
            .collect();

        let mut started = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert_eq!(h.store.active_tickers().await, 1);
    }

    #[tokio::test]
    async fn transitions_apply_after_the_writer_is_gone() {
        let h = Harness::new(LONG_TICK).await;
        h.persist.shutdown().await;

        assert!(h.store.start(item("a")).await);
        h.clock.advance_secs(6.0);
        assert!(h.store.pause("a").await);
        assert_eq!(h.store.get_state("a").await, DownloadState::Paused(0.2));

        h.store.enter_background().await;
        assert!(h.store.is_backgrounded().await);
        assert!(h.store.delete("a").await);
        assert_eq!(h.store.get_state("a").await, DownloadState::NeedsRedownload);
    }

    #[tokio::test]
    async fn restarted_install_never_reports_the_old_run() {
        let h = Harness::new(FAST_TICK).await;
        let mut progress = h.store.on_progress("a", Cadence::Fast).await;
        h.store.start(item("a")).await;
        for _ in 0..5 {
            h.clock.advance_secs(2.0);
            tokio::time::sleep(Duration::from_millis(15)).await;
        }

        h.store.delete("a").await;
        progress.drain();
        h.store.start(item("a")).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let after: Vec<f64> = progress.drain().into_iter().map(|e| e.progress).collect();
        assert!(!after.is_empty());
        assert!(after.iter().all(|p| *p == 0.0));
    }

    #[tokio::test]
    async fn unbounded_gaps_are_capped_and_reload() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.store.reconcile_elapsed_background_time(f64::INFINITY).await;

        let record = h.store.record("a").await.unwrap();
        assert_eq!(record.state, DownloadState::Completed);
        assert_eq!(record.accumulated_elapsed, 30.0);

        h.store.start(item("b")).await;
        let summary = h.store.reconcile_elapsed_background_time(f64::NAN).await;
        assert_eq!(summary.resumed, vec!["b".to_string()]);
        assert_eq!(h.store.record("b").await.unwrap().accumulated_elapsed, 0.0);

        let reloaded = h.reload().await;
        assert_eq!(reloaded.get_state("a").await, DownloadState::Completed);
        assert_eq!(reloaded.record("a").await.unwrap().accumulated_elapsed, 30.0);
    }

    #[tokio::test]
    async fn launch_completes_entries_the_timers_report_finished() {
        let h = Harness::new(LONG_TICK).await;
        h.store.start(item("a")).await;
        h.clock.advance_secs(1.0);
        h.store.shutdown().await;

        h.clock.advance_secs(29.0);
        let reloaded = h.reload().await;
        let summary = reloaded.launch().await;
        assert_eq!(summary.completed, vec!["a".to_string()]);
        assert_eq!(reloaded.installed_items().await, vec![item("a")]);
    }
}
