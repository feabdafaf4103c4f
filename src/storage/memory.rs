//! Process-local storage backend.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{BoundedIndex, Storage, StorageError, StorageItem, DEFAULT_MAX_ITEMS};

/// In-memory bounded storage
pub struct InMemoryStorage<T> {
    index: Mutex<BoundedIndex<T>>,
}

impl<T: Clone> Default for InMemoryStorage<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS)
    }
}

impl<T: Clone> InMemoryStorage<T> {
    /// Create a store holding at most `max_items` entries
    pub fn new(max_items: usize) -> Self {
        Self {
            index: Mutex::new(BoundedIndex::new(max_items)),
        }
    }

    /// Configured capacity
    pub fn max_items(&self) -> usize {
        self.lock().max_items()
    }

    // A panic while holding the lock cannot leave the index half-updated,
    // so a poisoned guard is still usable.
    fn lock(&self) -> MutexGuard<'_, BoundedIndex<T>> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<T> Storage<T> for InMemoryStorage<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn save(&self, path: &str, value: T) -> Result<(), StorageError> {
        if path.is_empty() {
            return Err(StorageError::InvalidPath);
        }

        let evicted = self.lock().insert(path, value);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), oldest = %evicted[0], "Evicted items over capacity");
        }

        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<T>, StorageError> {
        Ok(self.lock().get(path).cloned())
    }

    async fn get_list(
        &self,
        prefix: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<StorageItem<T>>, StorageError> {
        Ok(self.lock().list(prefix, limit))
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        self.lock().remove(path);
        Ok(())
    }

    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.lock().len())
    }
}
