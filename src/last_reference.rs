//! Tracks the reference id of the most recently submitted event.

use std::sync::{Mutex, MutexGuard};

/// Single-slot store for the last reference id
pub trait LastReferenceIdManager: Send + Sync {
    /// Last recorded id, if any
    fn get_last(&self) -> Option<String>;

    /// Record `id`; empty ids are ignored
    fn set_last(&self, id: &str);

    /// Forget the recorded id
    fn clear_last(&self);
}

/// Process-local implementation
#[derive(Debug, Default)]
pub struct InMemoryLastReferenceIdManager {
    last: Mutex<Option<String>>,
}

impl InMemoryLastReferenceIdManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<String>> {
        self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LastReferenceIdManager for InMemoryLastReferenceIdManager {
    fn get_last(&self) -> Option<String> {
        self.slot().clone()
    }

    fn set_last(&self, id: &str) {
        if id.is_empty() {
            return;
        }
        *self.slot() = Some(id.to_string());
    }

    fn clear_last(&self) {
        *self.slot() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_reference_slot() {
        let manager = InMemoryLastReferenceIdManager::new();
        assert_eq!(manager.get_last(), None);

        manager.set_last("abc123");
        assert_eq!(manager.get_last().as_deref(), Some("abc123"));

        manager.set_last("");
        assert_eq!(manager.get_last().as_deref(), Some("abc123"));

        manager.set_last("def456");
        assert_eq!(manager.get_last().as_deref(), Some("def456"));

        manager.clear_last();
        assert_eq!(manager.get_last(), None);
    }
}
