// src/state_manager.rs

use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rusqlite::Connection;
use tracing::{debug, error, warn};

/// Keys of the durable key-value layout.
pub mod keys {
    pub const INSTALLED_ITEMS: &str = "installedItems";
    pub const DOWNLOAD_RECORDS: &str = "downloadRecords";
    pub const LAST_BACKGROUNDED_AT: &str = "lastBackgroundedAt";
    pub const TIMER_ENTRIES: &str = "timerEntries";
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Key-value persistence on top of an SQLite database.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Opens (or creates) the database file and its table.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    /// A throwaway database, for tests and ephemeral hosts.
    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS kv (
                        key             TEXT PRIMARY KEY,
                        value           TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces the raw JSON stored under `key`.
    pub async fn put_raw(&self, key: &str, value: String) -> Result<(), StateError> {
        let key = key.to_owned();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StateError> {
        let raw = serde_json::to_string(value)?;
        self.put_raw(key, raw).await
    }

    /// Loads and decodes the value under `key`, if present.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        let key = key.to_owned();
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let value = conn
                    .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                        row.get(0)
                    })
                    .optional()?;
                Ok(value)
            })
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn remove(&self, key: &str) -> Result<(), StateError> {
        let key = key.to_owned();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Starts the background writer that applies queued saves in order.
    pub fn spawn_writer(&self) -> (PersistHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistCommand>();
        let state = self.clone();

        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    PersistCommand::Put { key, value } => {
                        if let Err(e) = state.put_raw(key, value).await {
                            error!(key, error = %e, "failed to persist state");
                        }
                    }
                    PersistCommand::Remove { key } => {
                        if let Err(e) = state.remove(key).await {
                            error!(key, error = %e, "failed to remove persisted state");
                        }
                    }
                    PersistCommand::Flush(ack) => {
                        let _ = ack.send(());
                    }
                    PersistCommand::Shutdown(ack) => {
                        let _ = ack.send(());
                        break;
                    }
                }
            }
            debug!("state writer stopped");
        });

        (PersistHandle { tx }, handle)
    }
}

enum PersistCommand {
    Put { key: &'static str, value: String },
    Remove { key: &'static str },
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap handle for queueing saves without waiting on the database.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistHandle {
    /// Serializes now, writes later. Failures are logged, never returned.
    pub fn save<T: Serialize>(&self, key: &'static str, value: &T) {
        match serde_json::to_string(value) {
            Ok(value) => {
                if self.tx.send(PersistCommand::Put { key, value }).is_err() {
                    warn!(key, "state writer is gone, dropping save");
                }
            }
            Err(e) => error!(key, error = %e, "failed to serialize state"),
        }
    }

    pub fn remove(&self, key: &'static str) {
        if self.tx.send(PersistCommand::Remove { key }).is_err() {
            warn!(key, "state writer is gone, dropping remove");
        }
    }

    /// Resolves once every save queued before this call has been applied.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Applies pending saves, then stops the writer.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(PersistCommand::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }
}
