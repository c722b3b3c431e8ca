//! Opaque key to blob persistence.
//!
//! Components persist JSON snapshots of their state through a
//! [`StateSlot`], which pairs a [`BlobStore`] with a namespaced key. A failed
//! load is treated as "no prior state"; a failed save is reported to the
//! event sink and retried implicitly by the next full-snapshot write.

mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::clock::{SystemClock, TimeSource};
use crate::error::PersistenceError;
use crate::events::{publish, Event, EventSink, NullSink};

/// Per-component keys, all under the `courier.` namespace.
pub const RATE_LIMITER_KEY: &str = "courier.rate_limiter";
pub const QUIET_HOURS_KEY: &str = "courier.quiet_hours";
pub const ENGAGEMENT_KEY: &str = "courier.engagement";
pub const EXPERIMENTS_KEY: &str = "courier.experiments";

/// Opaque blob persistence.
pub trait BlobStore: Send + Sync {
    /// Bytes stored under `key`, `None` if absent.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Store `bytes` under `key`, replacing any previous value.
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError>;
}

/// A component's view of the store: one key plus failure reporting.
#[derive(Clone)]
pub struct StateSlot {
    store: Arc<dyn BlobStore>,
    key: String,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn TimeSource>,
}

impl StateSlot {
    pub fn new(
        store: Arc<dyn BlobStore>,
        key: impl Into<String>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            events,
            clock,
        }
    }

    /// Slot backed by a private in-memory store. Useful for standalone
    /// components and tests.
    pub fn detached(key: impl Into<String>) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            key,
            Arc::new(NullSink),
            Arc::new(SystemClock::utc()),
        )
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Decodes the stored snapshot. Missing, unreadable or undecodable
    /// state all yield `None`.
    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        match self.store.load(&self.key) {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "discarding undecodable snapshot");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "snapshot load failed, starting empty");
                None
            }
        }
    }

    /// Writes the snapshot. Returns `false` when the write failed; the
    /// failure has already been logged and reported.
    pub fn save<T: Serialize>(&self, value: &T) -> bool {
        let result = serde_json::to_vec(value)
            .map_err(PersistenceError::from)
            .and_then(|bytes| self.store.save(&self.key, &bytes));
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "snapshot save failed");
                publish(
                    self.events.as_ref(),
                    &Event::PersistenceSaveFailed {
                        key: self.key.clone(),
                        message: e.to_string(),
                        at: self.clock.now(),
                    },
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for StateSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSlot").field("key", &self.key).finish()
    }
}

/// Returns `~/.local/share/courier[-dev]/` (platform data dir) based on
/// COURIER_ENV.
///
/// Set COURIER_ENV=dev to use a development data directory.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, std::io::Error> {
    let base_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));

    let env = std::env::var("COURIER_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("courier-dev")
    } else {
        base_dir.join("courier")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
