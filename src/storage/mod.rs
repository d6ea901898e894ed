//! Durable on-device storage.
//!
//! One sled database holds everything the agent must not lose across
//! restarts and power loss: the outbound frame queue and the small
//! settings table (endpoint, tracking flag, operator registration).
//! A lock file guards the directory against a second agent instance,
//! which would corrupt the sled lock.

pub mod lockfile;
pub mod queue;
pub mod settings;

pub use lockfile::{LockError, ProcessLock};
pub use queue::{OutboundQueue, QueueEntry};
pub use settings::SettingsStore;

use std::path::Path;
use std::sync::Arc;

/// Storage errors. Callers report these as failures and keep the
/// pipeline alive; only the initial open is fatal.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Handle to the opened database with its two stores.
#[derive(Clone)]
pub struct Storage {
    pub queue: Arc<OutboundQueue>,
    pub settings: Arc<SettingsStore>,
    db: sled::Db,
}

impl Storage {
    /// Open (or create) the agent database under `data_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        let path = data_dir.as_ref().join("agent.db");
        let db = sled::open(&path)?;

        let queue = Arc::new(OutboundQueue::open(&db)?);
        let settings = Arc::new(SettingsStore::open(&db)?);

        tracing::info!(path = %path.display(), pending = queue.count(), "Storage opened");

        Ok(Self { queue, settings, db })
    }

    /// Flush all trees to disk. Called on shutdown.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
