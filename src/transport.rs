//! Delivery interface for queued events.
//!
//! A transport takes a batch read from the event queue, attempts delivery to
//! the remote collector, and reports which paths made it. Retry and backoff
//! are the transport's own business; the queue only removes what was
//! reported as delivered.

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::Event;
use crate::storage::StorageItem;

/// Outcome of one delivery attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Paths accepted by the collector
    pub delivered: Vec<String>,
}

impl Delivery {
    /// Every item in the batch was delivered
    pub fn all(batch: &[StorageItem<Event>]) -> Self {
        Self {
            delivered: batch.iter().map(|item| item.path.clone()).collect(),
        }
    }

    /// Nothing was delivered
    pub fn none() -> Self {
        Self::default()
    }
}

/// Remote collector client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the transport name
    fn name(&self) -> &str;

    /// Attempt delivery of `batch` (oldest first)
    async fn deliver(&self, batch: &[StorageItem<Event>]) -> Result<Delivery>;
}
