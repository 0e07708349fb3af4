//! In-memory cache index ordered by recency
//!
//! Entries live in an arena of slots addressed by integer index. A hash map
//! from key to slot gives O(1) lookup, and the slots are threaded into a
//! doubly-linked list from least to most recently accessed, so touching an
//! entry and finding the LRU victim are both O(1).

use crate::types::CacheEntry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Name of the record the index snapshot is persisted under
pub const INDEX_RECORD: &str = "image_cache_index";

#[derive(Debug)]
struct Node {
    entry: CacheEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Map from resource key to [`CacheEntry`], iterated oldest access first
#[derive(Debug, Default)]
pub struct CacheIndex {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    by_key: HashMap<String, usize>,
    /// Least recently accessed
    head: Option<usize>,
    /// Most recently accessed
    tail: Option<usize>,
    known_bytes: u64,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index from a persisted snapshot
    ///
    /// The snapshot is a list of `[key, entry]` pairs. Entries are ordered by
    /// `last_accessed`; equal timestamps keep their snapshot order. A snapshot
    /// whose sizes add up past `u64::MAX` is rejected as corrupt.
    pub fn from_snapshot(snapshot: &str) -> serde_json::Result<Self> {
        let mut pairs: Vec<(String, CacheEntry)> = serde_json::from_str(snapshot)?;
        let total = pairs.iter().try_fold(0u64, |total, (_, entry)| {
            total.checked_add(entry.size.unwrap_or(0))
        });
        if total.is_none() {
            return Err(serde::de::Error::custom("entry sizes overflow u64"));
        }
        pairs.sort_by_key(|(_, entry)| entry.last_accessed);

        let mut index = Self::new();
        for (key, mut entry) in pairs {
            entry.key = key;
            index.insert(entry);
        }
        Ok(index)
    }

    /// Serialize to the snapshot format, least recently accessed first
    pub fn to_snapshot(&self) -> serde_json::Result<String> {
        let pairs: Vec<(&str, &CacheEntry)> =
            self.iter().map(|entry| (entry.key.as_str(), entry)).collect();
        serde_json::to_string(&pairs)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        let slot = *self.by_key.get(key)?;
        self.node(slot).map(|node| &node.entry)
    }

    /// Sum of the sizes that are known
    pub fn known_bytes(&self) -> u64 {
        self.known_bytes
    }

    /// Insert as the most recently accessed entry, returning any entry it replaced
    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let replaced = self.remove(&entry.key);

        self.known_bytes = self.known_bytes.saturating_add(entry.size.unwrap_or(0));
        let key = entry.key.clone();
        let node = Node {
            entry,
            prev: self.tail,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => {
                if let Some(node) = self.node_mut(tail) {
                    node.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.by_key.insert(key, slot);

        replaced
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.by_key.remove(key)?;
        self.unlink(slot);
        let node = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        self.known_bytes = self
            .known_bytes
            .saturating_sub(node.entry.size.unwrap_or(0));
        Some(node.entry)
    }

    /// Record a successful read: bump `last_accessed` and `hits`, and move
    /// the entry to the most recent end
    pub fn touch(&mut self, key: &str, now: DateTime<Utc>) -> Option<&CacheEntry> {
        let slot = *self.by_key.get(key)?;
        self.unlink(slot);

        let prev_tail = self.tail;
        let node = self.node_mut(slot)?;
        node.entry.last_accessed = node.entry.last_accessed.max(now);
        node.entry.hits += 1;
        node.prev = prev_tail;
        node.next = None;

        match prev_tail {
            Some(tail) => {
                if let Some(node) = self.node_mut(tail) {
                    node.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);

        self.node(slot).map(|node| &node.entry)
    }

    /// The entry with the oldest `last_accessed`
    pub fn least_recent(&self) -> Option<&CacheEntry> {
        self.head.and_then(|slot| self.node(slot)).map(|node| &node.entry)
    }

    /// Iterate from least to most recently accessed
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            index: self,
            cursor: self.head,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn node(&self, slot: usize) -> Option<&Node> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Detach a slot from the recency list, leaving it in the arena
    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.node(slot) {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(prev) => {
                if let Some(node) = self.node_mut(prev) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next) => {
                if let Some(node) = self.node_mut(next) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = None;
        }
    }
}

/// Recency-ordered iterator over a [`CacheIndex`]
pub struct Iter<'a> {
    index: &'a CacheIndex,
    cursor: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a CacheEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.index.node(self.cursor?)?;
        self.cursor = node.next;
        Some(&node.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::PathBuf;

    fn entry(key: &str, size: Option<u64>, at: DateTime<Utc>) -> CacheEntry {
        CacheEntry::new(
            key,
            PathBuf::from(format!("/cache/{}.jpg", key)),
            size,
            at,
            Duration::days(7),
        )
    }

    fn keys(index: &CacheIndex) -> Vec<&str> {
        index.iter().map(|e| e.key.as_str()).collect()
    }

    #[test]
    fn test_insert_orders_by_recency() {
        let now = Utc::now();
        let mut index = CacheIndex::new();
        index.insert(entry("a", Some(1), now));
        index.insert(entry("b", Some(2), now));
        index.insert(entry("c", None, now));

        assert_eq!(index.len(), 3);
        assert_eq!(keys(&index), vec!["a", "b", "c"]);
        assert_eq!(index.least_recent().unwrap().key, "a");
        assert_eq!(index.known_bytes(), 3);
    }

    #[test]
    fn test_touch_moves_to_most_recent() {
        let now = Utc::now();
        let mut index = CacheIndex::new();
        index.insert(entry("a", None, now));
        index.insert(entry("b", None, now));
        index.insert(entry("c", None, now));

        let later = now + Duration::seconds(5);
        let touched = index.touch("a", later).unwrap();
        assert_eq!(touched.hits, 1);
        assert_eq!(touched.last_accessed, later);

        assert_eq!(keys(&index), vec!["b", "c", "a"]);
        assert_eq!(index.least_recent().unwrap().key, "b");
        assert!(index.touch("missing", later).is_none());
    }

    #[test]
    fn test_touch_never_moves_last_accessed_backwards() {
        let now = Utc::now();
        let mut index = CacheIndex::new();
        index.insert(entry("a", None, now));

        let touched = index.touch("a", now - Duration::seconds(30)).unwrap();
        assert_eq!(touched.last_accessed, now);
    }

    #[test]
    fn test_remove_relinks_and_reuses_slots() {
        let now = Utc::now();
        let mut index = CacheIndex::new();
        index.insert(entry("a", Some(10), now));
        index.insert(entry("b", Some(20), now));
        index.insert(entry("c", Some(30), now));

        let removed = index.remove("b").unwrap();
        assert_eq!(removed.key, "b");
        assert_eq!(keys(&index), vec!["a", "c"]);
        assert_eq!(index.known_bytes(), 40);
        assert!(index.remove("b").is_none());

        index.insert(entry("d", Some(1), now));
        assert_eq!(index.slots.len(), 3);
        assert_eq!(keys(&index), vec!["a", "c", "d"]);

        index.remove("a");
        index.remove("d");
        assert_eq!(keys(&index), vec!["c"]);
        assert_eq!(index.least_recent().unwrap().key, "c");
    }

    #[test]
    fn test_insert_replaces_existing_key() {
        let now = Utc::now();
        let mut index = CacheIndex::new();
        index.insert(entry("a", Some(10), now));
        index.insert(entry("b", Some(10), now));
        index.touch("a", now);

        let replaced = index.insert(entry("a", Some(5), now)).unwrap();
        assert_eq!(replaced.hits, 1);
        assert_eq!(index.get("a").unwrap().hits, 0);
        assert_eq!(index.len(), 2);
        assert_eq!(index.known_bytes(), 15);
        assert_eq!(keys(&index), vec!["b", "a"]);
    }

    #[test]
    fn test_snapshot_restores_recency_order() {
        let now = Utc::now();
        let mut index = CacheIndex::new();
        index.insert(entry("a", Some(3), now));
        index.insert(entry("b", None, now));
        index.touch("a", now + Duration::seconds(1));

        let snapshot = index.to_snapshot().unwrap();
        let restored = CacheIndex::from_snapshot(&snapshot).unwrap();

        assert_eq!(keys(&restored), vec!["b", "a"]);
        assert_eq!(restored.get("a").unwrap().hits, 1);
        assert_eq!(restored.known_bytes(), 3);
    }

    #[test]
    fn test_snapshot_is_list_of_key_entry_pairs() {
        let now = Utc::now();
        let mut index = CacheIndex::new();
        index.insert(entry("https://example.com/a.png", None, now));

        let value: serde_json::Value =
            serde_json::from_str(&index.to_snapshot().unwrap()).unwrap();
        assert_eq!(value[0][0], "https://example.com/a.png");
        assert_eq!(value[0][1]["key"], "https://example.com/a.png");
    }

    #[test]
    fn test_snapshot_sorts_by_last_accessed() {
        let now = Utc::now();
        let older = entry("old", None, now - Duration::hours(1));
        let newer = entry("new", None, now);
        let snapshot = serde_json::to_string(&vec![("new", &newer), ("old", &older)]).unwrap();

        let index = CacheIndex::from_snapshot(&snapshot).unwrap();
        assert_eq!(keys(&index), vec!["old", "new"]);
    }

    #[test]
    fn test_snapshot_with_overflowing_sizes_is_an_error() {
        let now = Utc::now();
        let a = entry("a", Some(u64::MAX), now);
        let b = entry("b", Some(u64::MAX), now);
        let snapshot = serde_json::to_string(&vec![("a", &a), ("b", &b)]).unwrap();

        assert!(CacheIndex::from_snapshot(&snapshot).is_err());

        let single = serde_json::to_string(&vec![("a", &a)]).unwrap();
        let index = CacheIndex::from_snapshot(&single).unwrap();
        assert_eq!(index.known_bytes(), u64::MAX);
    }

    #[test]
    fn test_known_bytes_saturates() {
        let now = Utc::now();
        let mut index = CacheIndex::new();
        index.insert(entry("a", Some(u64::MAX), now));
        index.insert(entry("b", Some(1), now));

        assert_eq!(index.known_bytes(), u64::MAX);
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        assert!(CacheIndex::from_snapshot("{not json").is_err());
        assert!(CacheIndex::from_snapshot("{\"a\": 1}").is_err());
    }

    #[test]
    fn test_clear() {
        let now = Utc::now();
        let mut index = CacheIndex::new();
        index.insert(entry("a", Some(1), now));
        index.clear();

        assert!(index.is_empty());
        assert_eq!(index.known_bytes(), 0);
        assert!(index.least_recent().is_none());
        assert_eq!(index.iter().count(), 0);
    }
}
