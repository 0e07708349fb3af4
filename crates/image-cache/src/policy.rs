//! LRU + TTL eviction policy
//!
//! The functions here only decide and mutate the index. Deleting the files of
//! the entries they hand back is left to the caller.

use crate::error::{CacheError, Result};
use crate::index::CacheIndex;
use crate::store::DurableStore;
use crate::types::CacheEntry;
use chrono::{DateTime, Utc};
use tracing::warn;

/// Admission limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_size: u64,
    /// A limit of 0 is treated as 1: the entry being admitted always fits
    pub max_entries: usize,
}

/// Whether an index entry may be served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// Past its expiry
    Stale,
    /// The backing file is gone
    Missing,
}

impl Validity {
    pub fn is_valid(self) -> bool {
        self == Validity::Valid
    }
}

/// Check an entry against the clock and the durable store
pub async fn validate(entry: &CacheEntry, now: DateTime<Utc>, store: &DurableStore) -> Validity {
    if entry.is_expired(now) {
        return Validity::Stale;
    }

    let Some(path) = entry.local_path.as_deref() else {
        return Validity::Missing;
    };
    match store.exists(path).await {
        Ok(Some(_)) => Validity::Valid,
        Ok(None) => Validity::Missing,
        Err(e) => {
            warn!(key = %entry.key, path = ?path, error = %e, "Failed to stat cached file");
            Validity::Missing
        }
    }
}

/// The least recently accessed entry
///
/// Ties on `last_accessed` resolve to whichever entry reached that
/// timestamp first.
pub fn choose_victim(index: &CacheIndex) -> Option<&CacheEntry> {
    index.least_recent()
}

/// Make room for `incoming_key` with `new_size` bytes
///
/// An existing entry for the same key stays in the index, since a failed
/// write must leave it servable, but it neither counts against the limits nor
/// is ever chosen as a victim: the commit replaces it wholesale. One victim is
/// evicted if the entry limit is reached, then further victims oldest-first
/// until the known byte total plus `new_size` fits in `max_size`.
///
/// Returns the evicted entries; their files still have to be deleted.
pub fn admit(
    index: &mut CacheIndex,
    incoming_key: &str,
    new_size: u64,
    limits: &Limits,
) -> Result<Vec<CacheEntry>> {
    if new_size > limits.max_size {
        return Err(CacheError::EntryTooLarge {
            size: new_size,
            max_size: limits.max_size,
        });
    }

    let max_entries = limits.max_entries.max(1);
    let mut evicted = Vec::new();
    while footprint_without(index, incoming_key).0 >= max_entries {
        match evict_one(index, incoming_key) {
            Some(victim) => evicted.push(victim),
            None => break,
        }
    }
    while footprint_without(index, incoming_key)
        .1
        .saturating_add(new_size)
        > limits.max_size
    {
        match evict_one(index, incoming_key) {
            Some(victim) => evicted.push(victim),
            None => break,
        }
    }

    Ok(evicted)
}

/// Entry count and known bytes of everything except `key`
fn footprint_without(index: &CacheIndex, key: &str) -> (usize, u64) {
    match index.get(key) {
        Some(current) => (
            index.len() - 1,
            index
                .known_bytes()
                .saturating_sub(current.size.unwrap_or(0)),
        ),
        None => (index.len(), index.known_bytes()),
    }
}

/// Evict the least recent entry other than `keep`
fn evict_one(index: &mut CacheIndex, keep: &str) -> Option<CacheEntry> {
    let key = match choose_victim(index) {
        Some(victim) if victim.key == keep => index.iter().nth(1)?.key.clone(),
        Some(victim) => victim.key.clone(),
        None => return None,
    };
    index.remove(&key)
}

/// Remove every expired entry, returning them
pub fn sweep_expired(index: &mut CacheIndex, now: DateTime<Utc>) -> Vec<CacheEntry> {
    let expired: Vec<String> = index
        .iter()
        .filter(|entry| entry.is_expired(now))
        .map(|entry| entry.key.clone())
        .collect();

    expired
        .iter()
        .filter_map(|key| index.remove(key))
        .collect()
}
