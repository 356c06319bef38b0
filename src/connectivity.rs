// src/connectivity.rs

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::events::Subscription;

/// Coarse kind of link the device is using.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Transport {
    Wifi,
    Cellular,
    Ethernet,
    #[default]
    Unknown,
}

/// One reachability report from the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkPath {
    pub connected: bool,
    pub transport: Transport,
}

impl NetworkPath {
    pub fn online(transport: Transport) -> Self {
        Self { connected: true, transport }
    }

    pub fn offline() -> Self {
        Self { connected: false, transport: Transport::Unknown }
    }
}

/// Emitted only when the connected flag actually flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Connected(Transport),
    Disconnected,
}

struct MonitorState {
    connected: bool,
    transport: Transport,
    running: bool,
    /// Set once the first post-start observation has been taken as the baseline.
    has_baseline: bool,
}

/// Tracks reachability and turns level reports into edge events.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<Mutex<MonitorState>>,
    tx: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Arc::new(Mutex::new(MonitorState {
                connected: true,
                transport: Transport::Unknown,
                running: false,
                has_baseline: false,
            })),
            tx,
        }
    }

    /// Begins accepting observations. The next observation sets the baseline silently.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        state.running = true;
        state.has_baseline = false;
        debug!("connectivity monitor started");
    }

    pub async fn stop(&self) {
        self.state.lock().await.running = false;
        debug!("connectivity monitor stopped");
    }

    /// Feeds a reachability report. Returns the event it produced, if any.
    pub async fn observe(&self, path: NetworkPath) -> Option<ConnectivityEvent> {
        let mut state = self.state.lock().await;
        if !state.running {
            return None;
        }

        let flipped = state.has_baseline && state.connected != path.connected;
        state.connected = path.connected;
        state.transport = path.transport;
        state.has_baseline = true;

        if !flipped {
            return None;
        }

        let event = if path.connected {
            ConnectivityEvent::Connected(path.transport)
        } else {
            ConnectivityEvent::Disconnected
        };
        info!(?event, "connectivity changed");
        let _ = self.tx.send(event);
        Some(event)
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn transport(&self) -> Transport {
        self.state.lock().await.transport
    }

    pub fn subscribe(&self) -> Subscription<ConnectivityEvent> {
        Subscription::new(self.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_observation_is_silent() {
        let monitor = ConnectivityMonitor::new(8);
        let mut events = monitor.subscribe();
        monitor.start().await;

        assert_eq!(monitor.observe(NetworkPath::offline()).await, None);
        assert!(!monitor.is_connected().await);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn only_flips_emit() {
        let monitor = ConnectivityMonitor::new(8);
        let mut events = monitor.subscribe();
        monitor.start().await;

        monitor.observe(NetworkPath::online(Transport::Wifi)).await;
        assert_eq!(monitor.observe(NetworkPath::online(Transport::Cellular)).await, None);
        assert_eq!(monitor.transport().await, Transport::Cellular);

        assert_eq!(
            monitor.observe(NetworkPath::offline()).await,
            Some(ConnectivityEvent::Disconnected)
        );
        assert_eq!(monitor.observe(NetworkPath::offline()).await, None);
        assert_eq!(
            monitor.observe(NetworkPath::online(Transport::Ethernet)).await,
            Some(ConnectivityEvent::Connected(Transport::Ethernet))
        );

        assert_eq!(events.try_recv(), Some(ConnectivityEvent::Disconnected));
        assert_eq!(
            events.try_recv(),
            Some(ConnectivityEvent::Connected(Transport::Ethernet))
        );
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn stopped_monitor_ignores_reports() {
        let monitor = ConnectivityMonitor::new(8);
        monitor.start().await;
        monitor.observe(NetworkPath::online(Transport::Wifi)).await;
        monitor.stop().await;

        assert_eq!(monitor.observe(NetworkPath::offline()).await, None);
        assert!(monitor.is_connected().await);
    }

    #[tokio::test]
    async fn restart_takes_a_new_baseline() {
        let monitor = ConnectivityMonitor::new(8);
        monitor.start().await;
        monitor.observe(NetworkPath::online(Transport::Wifi)).await;
        monitor.stop().await;
        monitor.start().await;

        assert_eq!(monitor.observe(NetworkPath::offline()).await, None);
    }
}
