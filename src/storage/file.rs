//! File-backed storage using an append-only JSONL log.
//!
//! Each mutation is appended to `queue.jsonl` as one record. On open the log
//! is replayed through a [`BoundedIndex`] with the same capacity, which
//! reproduces overwrites and removals. Evictions are logged as removals in
//! the same write as the save that caused them, so reopening with a larger
//! capacity never resurrects an evicted item. Once the log grows past a
//! threshold it is compacted into a snapshot of the live items; a failed
//! compaction is retried after another threshold's worth of records.

use std::fs::OpenOptions as StdOpenOptions;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BoundedIndex, Storage, StorageError, StorageItem};

const LOG_FILE: &str = "queue.jsonl";
const LOCK_FILE: &str = "queue.lock";
const MIN_COMPACT_RECORDS: usize = 64;

/// A record as written to the log
#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RecordRef<'a, T> {
    Save { path: &'a str, value: &'a T },
    Remove { path: &'a str },
}

/// A record as read back from the log
#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record<T> {
    Save { path: String, value: T },
    Remove { path: String },
}

struct FileState<T> {
    index: BoundedIndex<T>,

    /// Records currently in the log file
    records: usize,

    /// Record count above which the log is compacted
    compact_at: usize,
}

/// Durable bounded storage rooted at a directory
pub struct FileStorage<T> {
    /// Path to the JSONL log
    log_path: PathBuf,

    /// Index and log bookkeeping; held across one append
    state: Mutex<FileState<T>>,

    /// Open handle carrying the exclusive advisory lock
    _lock: std::fs::File,

    _marker: PhantomData<fn() -> T>,
}

impl<T> FileStorage<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open (or create) a store in `dir` holding at most `max_items` entries
    pub async fn open(dir: impl AsRef<Path>, max_items: usize) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = StdOpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| StorageError::Locked(lock_path.display().to_string()))?;

        let log_path = dir.join(LOG_FILE);
        let (index, records) = replay(&log_path, max_items).await?;
        info!(
            path = %log_path.display(),
            items = index.len(),
            records,
            "Opened file storage"
        );

        let compact_at = compact_threshold(index.max_items());
        let storage = Self {
            log_path,
            state: Mutex::new(FileState {
                index,
                records,
                compact_at,
            }),
            _lock: lock,
            _marker: PhantomData,
        };

        {
            let mut state = storage.state.lock().await;
            storage.compact_if_due(&mut state).await;
        }

        Ok(storage)
    }

    /// Path to the underlying log file
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Rewrite the log as a snapshot of the live items
    pub async fn compact_now(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        self.compact(&mut state).await
    }

    /// Append `records` to the log in a single write
    async fn append(&self, records: &[RecordRef<'_, T>]) -> Result<(), StorageError> {
        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&serde_json::to_string(record)?);
            buffer.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    /// Compact when the log is over its threshold. Failure leaves the log
    /// valid, so it is logged and the next attempt is pushed back.
    async fn compact_if_due(&self, state: &mut FileState<T>) {
        if state.records <= state.compact_at {
            return;
        }

        if let Err(e) = self.compact(state).await {
            state.compact_at = state.records + compact_threshold(state.index.max_items());
            warn!(
                path = %self.log_path.display(),
                records = state.records,
                error = %e,
                "Storage log compaction failed"
            );
        }
    }

    async fn compact(&self, state: &mut FileState<T>) -> Result<(), StorageError> {
        let tmp_path = self.log_path.with_extension("jsonl.tmp");
        let items = state.index.list(None, None);

        let mut buffer = String::new();
        for item in &items {
            let record = RecordRef::Save {
                path: &item.path,
                value: &item.value,
            };
            buffer.push_str(&serde_json::to_string(&record)?);
            buffer.push('\n');
        }

        let mut file = File::create(&tmp_path).await?;
        file.write_all(buffer.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &self.log_path).await?;

        debug!(before = state.records, after = items.len(), "Compacted storage log");
        state.records = items.len();
        state.compact_at = compact_threshold(state.index.max_items());

        Ok(())
    }
}

#[async_trait]
impl<T> Storage<T> for FileStorage<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn save(&self, path: &str, value: T) -> Result<(), StorageError> {
        if path.is_empty() {
            return Err(StorageError::InvalidPath);
        }

        let mut state = self.state.lock().await;
        let evicting = state.index.evictions_for(path);

        let written = {
            let mut records = Vec::with_capacity(1 + evicting.len());
            records.push(RecordRef::Save { path, value: &value });
            records.extend(
                evicting
                    .iter()
                    .map(|evicted| RecordRef::Remove { path: evicted.as_str() }),
            );
            self.append(&records).await?;
            records.len()
        };
        state.records += written;

        let evicted = state.index.insert(path, value);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), oldest = %evicted[0], "Evicted items over capacity");
        }

        self.compact_if_due(&mut state).await;

        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<T>, StorageError> {
        Ok(self.state.lock().await.index.get(path).cloned())
    }

    async fn get_list(
        &self,
        prefix: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<StorageItem<T>>, StorageError> {
        Ok(self.state.lock().await.index.list(prefix, limit))
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if !state.index.contains(path) {
            return Ok(());
        }

        self.append(&[RecordRef::Remove { path }]).await?;
        state.records += 1;
        state.index.remove(path);
        self.compact_if_due(&mut state).await;

        Ok(())
    }

    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.state.lock().await.index.len())
    }
}

fn compact_threshold(max_items: usize) -> usize {
    max_items.saturating_mul(4).max(MIN_COMPACT_RECORDS)
}

/// Rebuild the index from the log, returning it with the record count
async fn replay<T>(log_path: &Path, max_items: usize) -> Result<(BoundedIndex<T>, usize), StorageError>
where
    T: DeserializeOwned + Clone,
{
    let mut index = BoundedIndex::new(max_items);
    let mut records = 0;

    if !log_path.exists() {
        return Ok((index, records));
    }

    let file = File::open(log_path).await?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Record<T>>(&line) {
            Ok(Record::Save { path, value }) => {
                index.insert(&path, value);
            }
            Ok(Record::Remove { path }) => {
                index.remove(&path);
            }
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping unreadable storage record");
                continue;
            }
        }
        records += 1;
    }

    Ok((index, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_items_survive_reopen() {
        let temp = TempDir::new().unwrap();

        {
            let storage: FileStorage<Value> = FileStorage::open(temp.path(), 10).await.unwrap();
            storage.save("ex-q-1", json!({ "type": "log" })).await.unwrap();
            storage.save("ex-q-2", json!({ "type": "usage" })).await.unwrap();
            storage.save("ex-q-1", json!({ "type": "error" })).await.unwrap();
            storage.remove("ex-q-2").await.unwrap();
            storage.save("ex-q-3", json!({ "type": "404" })).await.unwrap();
        }

        let storage: FileStorage<Value> = FileStorage::open(temp.path(), 10).await.unwrap();
        let items = storage.get_list(None, None).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path, "ex-q-1");
        assert_eq!(items[0].value, json!({ "type": "error" }));
        assert_eq!(items[1].path, "ex-q-3");
    }

    #[tokio::test]
    async fn test_eviction_replays_after_reopen() {
        let temp = TempDir::new().unwrap();

        {
            let storage = FileStorage::open(temp.path(), 3).await.unwrap();
            for i in 0..5 {
                storage.save(&format!("ex-q-{}", i), i).await.unwrap();
            }
        }

        let storage: FileStorage<i32> = FileStorage::open(temp.path(), 3).await.unwrap();
        let paths: Vec<String> = storage
            .get_list(None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.path)
            .collect();
        assert_eq!(paths, vec!["ex-q-2", "ex-q-3", "ex-q-4"]);
    }

    #[tokio::test]
    async fn test_evicted_items_stay_gone_with_larger_capacity() {
        let temp = TempDir::new().unwrap();

        {
            let storage = FileStorage::open(temp.path(), 3).await.unwrap();
            for i in 0..5 {
                storage.save(&format!("ex-q-{}", i), i).await.unwrap();
            }
        }

        let storage: FileStorage<i32> = FileStorage::open(temp.path(), 10).await.unwrap();
        let paths: Vec<String> = storage
            .get_list(None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.path)
            .collect();
        assert_eq!(paths, vec!["ex-q-2", "ex-q-3", "ex-q-4"]);
        assert!(storage.get("ex-q-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_compaction_does_not_fail_save() {
        let temp = TempDir::new().unwrap();
        let tmp_path = temp.path().join("queue.jsonl.tmp");
        std::fs::create_dir(&tmp_path).unwrap();

        {
            let storage = FileStorage::open(temp.path(), 2).await.unwrap();
            for i in 0..(MIN_COMPACT_RECORDS * 2) {
                let path = format!("ex-q-{}", i);
                storage.save(&path, i).await.unwrap();
                assert_eq!(storage.get(&path).await.unwrap(), Some(i));
            }
            assert_eq!(storage.len().await.unwrap(), 2);

            std::fs::remove_dir(&tmp_path).unwrap();
            storage.compact_now().await.unwrap();
            let content = std::fs::read_to_string(storage.log_path()).unwrap();
            assert_eq!(content.lines().count(), 2);
        }

        let last = MIN_COMPACT_RECORDS * 2 - 1;
        let storage: FileStorage<usize> = FileStorage::open(temp.path(), 2).await.unwrap();
        assert_eq!(storage.get(&format!("ex-q-{}", last)).await.unwrap(), Some(last));
        assert_eq!(storage.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_second_open_is_locked() {
        let temp = TempDir::new().unwrap();
        let _first: FileStorage<i32> = FileStorage::open(temp.path(), 10).await.unwrap();

        let second = FileStorage::<i32>::open(temp.path(), 10).await;
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[tokio::test]
    async fn test_log_is_compacted() {
        let temp = TempDir::new().unwrap();
        let storage = FileStorage::open(temp.path(), 2).await.unwrap();

        for i in 0..(MIN_COMPACT_RECORDS + 10) {
            storage.save(&format!("ex-q-{}", i), i).await.unwrap();
        }

        let content = std::fs::read_to_string(storage.log_path()).unwrap();
        let lines = content.lines().filter(|l| !l.trim().is_empty()).count();
        assert!(lines <= MIN_COMPACT_RECORDS);
        assert_eq!(storage.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_line_is_skipped() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join(LOG_FILE);
        std::fs::write(
            &log,
            "{\"op\":\"save\",\"path\":\"a\",\"value\":1}\nnot json\n{\"op\":\"save\",\"path\":\"b\",\"value\":2}\n",
        )
        .unwrap();

        let storage: FileStorage<i32> = FileStorage::open(temp.path(), 10).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), Some(1));
        assert_eq!(storage.get("b").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_remove_absent_does_not_grow_log() {
        let temp = TempDir::new().unwrap();
        let storage: FileStorage<i32> = FileStorage::open(temp.path(), 10).await.unwrap();
        storage.remove("missing").await.unwrap();
        assert!(!storage.log_path().exists());
    }
}
