pub mod clock;
pub mod config;
pub mod connectivity;
pub mod events;
pub mod lifecycle;
pub mod manager;
pub mod models;
pub mod presentation;
pub mod state_manager;
pub mod throttle;
pub mod timer_registry;

/// The types a host needs to drive the engine.
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::connectivity::{ConnectivityEvent, NetworkPath, Transport};
    pub use crate::events::{Cadence, Notice, ProgressEvent, StateChangedEvent, Subscription};
    pub use crate::lifecycle::{Engine, EngineError};
    pub use crate::manager::{DownloadStore, ReconcileSummary};
    pub use crate::models::{DownloadRecord, DownloadState, DownloadableItem};
    pub use crate::presentation::{InstallButton, NetworkBanner};
    pub use crate::state_manager::StateManager;
}
