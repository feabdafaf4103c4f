//! Bounded, ordered key-value storage for queued telemetry.
//!
//! Items are keyed by a string path. Paths double as namespaces: the event
//! queue writes under one prefix, cached settings under another, and prefix
//! scoped reads keep each consumer inside its own namespace.
//!
//! Every backend preserves three invariants:
//! - at most one item per path (re-saving overwrites in place)
//! - items are ordered by insertion sequence, oldest first
//! - the item count never exceeds the configured capacity; the globally
//!   oldest items are evicted first
//!
//! # Backends
//!
//! - [`InMemoryStorage`]: process-local, lost on exit
//! - [`FileStorage`]: JSONL append log replayed on open

pub mod file;
pub mod index;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::FileStorage;
pub use index::BoundedIndex;
pub use memory::InMemoryStorage;

/// Default capacity for storage backends
pub const DEFAULT_MAX_ITEMS: usize = 250;

/// A single stored entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageItem<T> {
    /// Unique key of the entry
    pub path: String,

    /// Stored value
    pub value: T,
}

/// Errors raised by storage backends
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage path must not be empty")]
    InvalidPath,

    #[error("Storage is locked by another process: {0}")]
    Locked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage backend contract.
///
/// Methods are async so disk-backed implementations can suspend on I/O.
/// A single `save` (including any eviction it triggers) is atomic with
/// respect to other calls on the same backend.
#[async_trait]
pub trait Storage<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Insert or overwrite the value at `path`
    async fn save(&self, path: &str, value: T) -> Result<(), StorageError>;

    /// Look up the value at `path`; `None` when absent
    async fn get(&self, path: &str) -> Result<Option<T>, StorageError>;

    /// List items oldest-first, optionally scoped to a path prefix and
    /// truncated to `limit` entries
    async fn get_list(
        &self,
        prefix: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<StorageItem<T>>, StorageError>;

    /// Delete the item at `path` if present
    async fn remove(&self, path: &str) -> Result<(), StorageError>;

    /// Number of stored items
    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.get_list(None, None).await?.len())
    }

    /// Whether the store holds no items
    async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len().await? == 0)
    }
}
