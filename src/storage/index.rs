//! Capacity-bounded ordered index shared by the storage backends.
//!
//! Order is tracked with a monotonic sequence number rather than timestamps,
//! so two saves within the same clock tick still evict deterministically.

use std::collections::{BTreeMap, HashMap};

use super::StorageItem;

#[derive(Debug, Clone)]
struct Slot<T> {
    seq: u64,
    value: T,
}

/// Path-keyed map with insertion ordering and oldest-first eviction
#[derive(Debug, Clone)]
pub struct BoundedIndex<T> {
    /// Path -> (sequence, value)
    entries: HashMap<String, Slot<T>>,

    /// Sequence -> path, oldest first
    order: BTreeMap<u64, String>,

    /// Next sequence number to hand out
    next_seq: u64,

    /// Maximum number of retained items (always >= 1)
    max_items: usize,
}

impl<T: Clone> BoundedIndex<T> {
    /// Create an empty index; a capacity of zero is raised to one
    pub fn new(max_items: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            max_items: max_items.max(1),
        }
    }

    /// Configured capacity
    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Insert or overwrite `path`, returning the paths evicted to stay
    /// within capacity
    pub fn insert(&mut self, path: &str, value: T) -> Vec<String> {
        if let Some(slot) = self.entries.get_mut(path) {
            slot.value = value;
            return Vec::new();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(path.to_string(), Slot { seq, value });
        self.order.insert(seq, path.to_string());

        let mut evicted = Vec::new();
        while self.entries.len() > self.max_items {
            match self.order.pop_first() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                    evicted.push(oldest);
                }
                None => break,
            }
        }

        evicted
    }

    /// Paths that inserting `path` would evict, oldest first
    pub fn evictions_for(&self, path: &str) -> Vec<String> {
        if self.entries.contains_key(path) {
            return Vec::new();
        }

        let overflow = (self.entries.len() + 1).saturating_sub(self.max_items);
        self.order.values().take(overflow).cloned().collect()
    }

    /// Current value at `path`
    pub fn get(&self, path: &str) -> Option<&T> {
        self.entries.get(path).map(|slot| &slot.value)
    }

    /// Whether `path` is present
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Remove `path`, returning whether it existed
    pub fn remove(&mut self, path: &str) -> bool {
        match self.entries.remove(path) {
            Some(slot) => {
                self.order.remove(&slot.seq);
                true
            }
            None => false,
        }
    }

    /// Oldest-first listing filtered by prefix and truncated to limit
    pub fn list(&self, prefix: Option<&str>, limit: Option<usize>) -> Vec<StorageItem<T>> {
        let prefix = prefix.unwrap_or("");
        let limit = limit.unwrap_or(usize::MAX);

        self.order
            .values()
            .filter(|path| path.starts_with(prefix))
            .take(limit)
            .filter_map(|path| {
                self.entries.get(path).map(|slot| StorageItem {
                    path: path.clone(),
                    value: slot.value.clone(),
                })
            })
            .collect()
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overwrite_keeps_position() {
        let mut index = BoundedIndex::new(10);
        index.insert("a", 1);
        index.insert("b", 2);
        index.insert("a", 3);

        let items = index.list(None, None);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path, "a");
        assert_eq!(items[0].value, 3);
        assert_eq!(items[1].path, "b");
    }

    #[test]
    fn test_eviction_reports_oldest() {
        let mut index = BoundedIndex::new(2);
        assert!(index.insert("a", 1).is_empty());
        assert!(index.insert("b", 2).is_empty());

        assert!(index.evictions_for("b").is_empty());
        assert_eq!(index.evictions_for("c"), vec!["a".to_string()]);

        let evicted = index.insert("c", 3);
        assert_eq!(evicted, vec!["a".to_string()]);
        assert!(!index.contains("a"));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let mut index = BoundedIndex::new(0);
        assert_eq!(index.max_items(), 1);

        index.insert("a", 1);
        index.insert("b", 2);
        let items = index.list(None, None);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, "b");
    }

    #[test]
    fn test_remove_then_reinsert_goes_to_back() {
        let mut index = BoundedIndex::new(10);
        index.insert("a", 1);
        index.insert("b", 2);
        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        index.insert("a", 1);

        let paths: Vec<String> = index.list(None, None).into_iter().map(|i| i.path).collect();
        assert_eq!(paths, vec!["b", "a"]);
    }
}
