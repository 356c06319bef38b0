// src/lifecycle.rs

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, EngineConfig};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor, NetworkPath};
use crate::events::{
    Cadence, EventBroadcaster, GlobalStateChanged, Notice, ProgressEvent, StateChangedEvent,
    Subscription,
};
use crate::manager::{DownloadStore, ReconcileSummary};
use crate::models::{DownloadRecord, DownloadState, DownloadableItem};
use crate::state_manager::{PersistHandle, StateError, StateManager};
use crate::timer_registry::TimerRegistry;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Owns the install services and exposes the hooks the host process calls.
pub struct Engine {
    store: Arc<DownloadStore>,
    timers: Arc<TimerRegistry>,
    connectivity: ConnectivityMonitor,
    persist: PersistHandle,
    writer: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Engine {
    /// Opens the database named in `config` and wires everything to the system clock.
    pub async fn init(config: EngineConfig) -> Result<Self, EngineError> {
        let state_manager = StateManager::new(&config.db_path).await?;
        Self::with_parts(config, state_manager, Arc::new(SystemClock)).await
    }

    /// Builds the engine over an already opened database and a chosen clock.
    pub async fn with_parts(
        config: EngineConfig,
        state_manager: StateManager,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let (persist, writer) = state_manager.spawn_writer();

        let connectivity = ConnectivityMonitor::new(config.event_capacity);
        let events = Arc::new(EventBroadcaster::new(&config, clock.clone()));
        let timers =
            Arc::new(TimerRegistry::load(&state_manager, clock.clone(), persist.clone()).await?);
        let store = DownloadStore::load(
            config,
            &state_manager,
            persist.clone(),
            clock,
            connectivity.clone(),
            timers.clone(),
            events,
        )
        .await?;

        connectivity.start().await;
        let cancellation_token = CancellationToken::new();
        let forwarder = Self::spawn_forwarder(
            store.clone(),
            connectivity.subscribe(),
            cancellation_token.clone(),
        );

        info!("install engine ready");
        Ok(Self {
            store,
            timers,
            connectivity,
            persist,
            writer: Some(writer),
            forwarder: Some(forwarder),
            cancellation_token,
        })
    }

    /// Turns connectivity edges into store transitions.
    fn spawn_forwarder(
        store: Arc<DownloadStore>,
        mut edges: Subscription<ConnectivityEvent>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = edges.recv() => event,
                };
                match event {
                    Some(ConnectivityEvent::Disconnected) => {
                        store.handle_connectivity_lost().await;
                    }
                    Some(ConnectivityEvent::Connected(_)) => store.handle_connectivity_restored(),
                    None => break,
                }
            }
            debug!("connectivity forwarder stopped");
        })
    }

    // ---- process lifecycle -------------------------------------------------

    /// Call once the host is up. Settles installs left over from the previous
    /// process, then re-announces every record to subscribers.
    pub async fn on_launch(&self) -> ReconcileSummary {
        let summary = self.store.launch().await;
        self.store.replay().await;
        summary
    }

    pub async fn on_enter_background(&self) {
        self.store.enter_background().await;
    }

    pub async fn on_enter_foreground(&self) -> Option<ReconcileSummary> {
        self.store.enter_foreground().await
    }

    pub async fn on_terminate(&self) {
        self.store.terminate().await;
        info!("install engine state saved for termination");
    }

    /// Host reachability callback.
    pub async fn observe_network(&self, path: NetworkPath) -> Option<ConnectivityEvent> {
        self.connectivity.observe(path).await
    }

    /// Stops every background task. Saves queued before this call are written.
    pub async fn shutdown(mut self) {
        self.cancellation_token.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.await;
        }
        self.connectivity.stop().await;
        self.store.shutdown().await;
        self.persist.shutdown().await;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        info!("install engine shut down");
    }

    // ---- operations --------------------------------------------------------

    pub async fn start(&self, item: DownloadableItem) -> bool {
        self.store.start(item).await
    }

    pub async fn pause(&self, id: &str) -> bool {
        self.store.pause(id).await
    }

    pub async fn delete(&self, id: &str) -> bool {
        self.store.delete(id).await
    }

    pub async fn get_state(&self, id: &str) -> DownloadState {
        self.store.get_state(id).await
    }

    pub async fn record(&self, id: &str) -> Option<DownloadRecord> {
        self.store.record(id).await
    }

    pub async fn installed_items(&self) -> Vec<DownloadableItem> {
        self.store.installed_items().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connectivity.is_connected().await
    }

    pub fn store(&self) -> &Arc<DownloadStore> {
        &self.store
    }

    pub fn timers(&self) -> &Arc<TimerRegistry> {
        &self.timers
    }

    // ---- subscriptions -----------------------------------------------------

    pub async fn on_progress(&self, id: &str, cadence: Cadence) -> Subscription<ProgressEvent> {
        self.store.on_progress(id, cadence).await
    }

    pub async fn on_state_changed(&self, id: &str) -> Subscription<StateChangedEvent> {
        self.store.on_state_changed(id).await
    }

    pub fn on_global_state_changed(&self) -> Subscription<GlobalStateChanged> {
        self.store.on_global_state_changed()
    }

    pub fn on_connectivity_changed(&self) -> Subscription<ConnectivityEvent> {
        self.connectivity.subscribe()
    }

    pub fn on_notice(&self) -> Subscription<Notice> {
        self.store.on_notice()
    }
}
