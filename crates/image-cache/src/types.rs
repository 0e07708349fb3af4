//! Cache types

use crate::error::CacheError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for one cached image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Resource URI, the identity of the entry
    pub key: String,
    /// Location of the cached file
    pub local_path: Option<PathBuf>,
    /// When the entry was created
    pub timestamp: DateTime<Utc>,
    /// Last successful read, drives LRU ordering
    pub last_accessed: DateTime<Utc>,
    /// Size in bytes, when the write path could measure it
    pub size: Option<u64>,
    /// Fixed at creation, never renewed in place
    pub expires_at: DateTime<Utc>,
    pub hits: u64,
}

impl CacheEntry {
    /// Create a fresh entry with no hits
    pub fn new(
        key: impl Into<String>,
        local_path: PathBuf,
        size: Option<u64>,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            local_path: Some(local_path),
            timestamp: now,
            last_accessed: now,
            size,
            expires_at: now.checked_add_signed(max_age).unwrap_or(now),
            hits: 0,
        }
    }

    /// An entry is stale once `now` is strictly past its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Statistics about the cache
///
/// `total_size` only counts entries with a recorded size, so it undercounts
/// when some sizes could not be measured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size: u64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    pub total_hits: u64,
    pub avg_hits_per_entry: f64,
}

/// Outcome of a batch preload
#[derive(Debug, Default)]
pub struct PreloadReport {
    /// Keys that were fetched and committed
    pub cached: Vec<String>,
    /// Keys that failed, with the reason
    pub failed: Vec<(String, CacheError)>,
}

impl PreloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of a full index/directory reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Index entries dropped because their file was gone
    pub missing_entries: usize,
    /// Files deleted because no index entry referenced them
    pub orphan_files: usize,
}
