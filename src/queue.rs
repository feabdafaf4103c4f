//! The events namespace of a storage backend.
//!
//! Submitted events are saved under `<prefix><unix-millis>-<counter>`, which
//! keeps concurrent submissions from ever sharing a path. A transport drains
//! the namespace oldest-first in batches.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::domain::Event;
use crate::storage::{Storage, StorageError, StorageItem};
use crate::transport::Transport;

/// Default path prefix for queued events
pub const DEFAULT_QUEUE_PREFIX: &str = "ex-q-";

/// Default number of events handed to a transport per pass
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Shared by every queue in the process, so two queues over one backend
/// never generate the same path
static PATH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    /// Items handed to the transport
    pub attempted: usize,

    /// Items removed after delivery
    pub delivered: usize,

    /// Items still queued in the namespace after the pass
    pub remaining: usize,

    /// Transport error, if the attempt failed outright
    pub error: Option<String>,
}

/// Event queue over a shared storage backend
pub struct EventQueue {
    storage: Arc<dyn Storage<Event>>,
    prefix: String,
    batch_size: usize,
}

impl EventQueue {
    pub fn new(storage: Arc<dyn Storage<Event>>, prefix: impl Into<String>, batch_size: usize) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            batch_size: batch_size.max(1),
        }
    }

    /// Namespace prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Underlying storage backend
    pub fn storage(&self) -> &Arc<dyn Storage<Event>> {
        &self.storage
    }

    /// Persist `event` under a fresh path, returning the path
    pub async fn enqueue(&self, event: Event) -> Result<String, StorageError> {
        let path = self.next_path().await?;
        self.storage.save(&path, event).await?;
        debug!(%path, "Enqueued event");
        Ok(path)
    }

    /// Oldest-first events in the namespace
    pub async fn pending(&self, limit: Option<usize>) -> Result<Vec<StorageItem<Event>>, StorageError> {
        self.storage.get_list(Some(&self.prefix), limit).await
    }

    /// Remove a queued event
    pub async fn remove(&self, path: &str) -> Result<(), StorageError> {
        self.storage.remove(path).await
    }

    /// Number of queued events (other namespaces excluded)
    pub async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.pending(None).await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.pending(Some(1)).await?.is_empty())
    }

    /// Drop every queued event
    pub async fn purge(&self) -> Result<usize, StorageError> {
        let items = self.pending(None).await?;
        for item in &items {
            self.storage.remove(&item.path).await?;
        }
        Ok(items.len())
    }

    /// Run one drain pass through `transport`.
    ///
    /// Delivered items are removed; anything else stays queued for a later
    /// pass. A transport error is reported in the summary, not returned.
    pub async fn process(&self, transport: &dyn Transport) -> Result<ProcessSummary, StorageError> {
        let batch = self.pending(Some(self.batch_size)).await?;
        let mut summary = ProcessSummary {
            attempted: batch.len(),
            ..Default::default()
        };

        if batch.is_empty() {
            return Ok(summary);
        }

        match transport.deliver(&batch).await {
            Ok(delivery) => {
                let mut in_batch: HashSet<&str> = batch.iter().map(|item| item.path.as_str()).collect();
                for path in &delivery.delivered {
                    // Each batch item counts once, however often it is reported
                    if in_batch.remove(path.as_str()) {
                        self.storage.remove(path).await?;
                        summary.delivered += 1;
                    }
                }
                info!(
                    transport = transport.name(),
                    attempted = summary.attempted,
                    delivered = summary.delivered,
                    "Processed queue batch"
                );
            }
            Err(e) => {
                warn!(transport = transport.name(), error = %e, "Delivery failed, events left queued");
                summary.error = Some(e.to_string());
            }
        }

        summary.remaining = self.len().await?;
        Ok(summary)
    }

    async fn next_path(&self) -> Result<String, StorageError> {
        loop {
            let seq = PATH_COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = format!("{}{}-{:06}", self.prefix, Utc::now().timestamp_millis(), seq);
            // A store reopened from disk may already hold this path
            if self.storage.get(&path).await?.is_none() {
                return Ok(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::transport::Delivery;
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    struct AcceptFirst;

    #[async_trait]
    impl Transport for AcceptFirst {
        fn name(&self) -> &str {
            "accept-first"
        }

        async fn deliver(&self, batch: &[StorageItem<Event>]) -> Result<Delivery> {
            Ok(Delivery {
                delivered: vec![batch[0].path.clone(), "unknown-path".to_string()],
            })
        }
    }

    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn deliver(&self, batch: &[StorageItem<Event>]) -> Result<Delivery> {
            let mut delivery = Delivery::all(batch);
            delivery.delivered.extend(Delivery::all(batch).delivered);
            Ok(delivery)
        }
    }

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        fn name(&self) -> &str {
            "offline"
        }

        async fn deliver(&self, _batch: &[StorageItem<Event>]) -> Result<Delivery> {
            bail!("collector unreachable")
        }
    }

    fn queue(batch_size: usize) -> EventQueue {
        EventQueue::new(
            Arc::new(InMemoryStorage::<Event>::new(100)),
            DEFAULT_QUEUE_PREFIX,
            batch_size,
        )
    }

    #[tokio::test]
    async fn test_enqueue_paths_are_unique_and_ordered() {
        let queue = queue(10);
        let mut paths = Vec::new();
        for i in 0..20 {
            let mut event = Event::new("log");
            event.message = Some(format!("m{}", i));
            paths.push(queue.enqueue(event).await.unwrap());
        }

        let unique: HashSet<&String> = paths.iter().collect();
        assert_eq!(unique.len(), 20);
        assert!(paths.iter().all(|p| p.starts_with("ex-q-")));

        let pending = queue.pending(None).await.unwrap();
        assert_eq!(pending.len(), 20);
        assert_eq!(pending[0].value.message.as_deref(), Some("m0"));
        assert_eq!(pending[19].value.message.as_deref(), Some("m19"));
    }

    #[tokio::test]
    async fn test_len_ignores_other_namespaces() {
        let queue = queue(10);
        queue.storage().save("ex-server-settings.json", Event::default()).await.unwrap();
        queue.enqueue(Event::new("log")).await.unwrap();

        assert_eq!(queue.len().await.unwrap(), 1);
        assert_eq!(queue.storage().len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_process_removes_only_delivered() {
        let queue = queue(2);
        for _ in 0..3 {
            queue.enqueue(Event::new("log")).await.unwrap();
        }
        let first = queue.pending(Some(1)).await.unwrap()[0].path.clone();

        let summary = queue.process(&AcceptFirst).await.unwrap();
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.remaining, 2);
        assert!(summary.error.is_none());
        assert!(queue.storage().get(&first).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_process_counts_repeated_paths_once() {
        let queue = queue(5);
        for _ in 0..3 {
            queue.enqueue(Event::new("log")).await.unwrap();
        }

        let summary = queue.process(&Echo).await.unwrap();
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.delivered, 3);
        assert_eq!(summary.remaining, 0);
    }

    #[tokio::test]
    async fn test_queues_sharing_storage_never_collide() {
        let storage: Arc<dyn Storage<Event>> = Arc::new(InMemoryStorage::<Event>::new(500));
        let first = EventQueue::new(Arc::clone(&storage), DEFAULT_QUEUE_PREFIX, 10);
        let second = EventQueue::new(Arc::clone(&storage), DEFAULT_QUEUE_PREFIX, 10);

        let mut paths = HashSet::new();
        for _ in 0..100 {
            paths.insert(first.enqueue(Event::new("log")).await.unwrap());
            paths.insert(second.enqueue(Event::new("log")).await.unwrap());
        }

        assert_eq!(paths.len(), 200);
        assert_eq!(first.len().await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_process_failure_keeps_items() {
        let queue = queue(5);
        queue.enqueue(Event::new("log")).await.unwrap();

        let summary = queue.process(&Offline).await.unwrap();
        assert_eq!(summary.delivered, 0);
        assert_eq!(summary.remaining, 1);
        assert_eq!(summary.error.as_deref(), Some("collector unreachable"));
    }

    #[tokio::test]
    async fn test_process_empty_queue() {
        let queue = queue(5);
        let summary = queue.process(&Offline).await.unwrap();
        assert_eq!(summary, ProcessSummary::default());
    }

    #[tokio::test]
    async fn test_purge() {
        let queue = queue(5);
        queue.storage().save("ex-server-settings.json", Event::default()).await.unwrap();
        queue.enqueue(Event::new("log")).await.unwrap();
        queue.enqueue(Event::new("log")).await.unwrap();

        assert_eq!(queue.purge().await.unwrap(), 2);
        assert!(queue.is_empty().await.unwrap());
        assert_eq!(queue.storage().len().await.unwrap(), 1);
    }
}
