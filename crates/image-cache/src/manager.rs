//! Cache manager: the public face of the image cache

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::flight::{KeyLocks, SingleFlight};
use crate::fs::{FileSystem, TokioFileSystem};
use crate::index::{CacheIndex, INDEX_RECORD};
use crate::policy::{self, Limits, Validity};
use crate::record::{FileRecordStore, RecordStore};
use crate::store::DurableStore;
use crate::transport::Transport;
use crate::types::{CacheEntry, CacheStats, PreloadReport, ReconcileReport};
use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

/// Keys fetched concurrently by [`CacheManager::preload`]
const PRELOAD_CONCURRENCY: usize = 8;
/// Attempts at recreating the cache directory during [`CacheManager::clear`]
const RECREATE_ATTEMPTS: u32 = 3;
const RECREATE_BACKOFF_MS: u64 = 50;

/// Persistent, size- and age-bounded image cache
///
/// Cloning is cheap; every clone drives the same cache. Construct one at
/// startup and hand it to whatever needs it.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: DurableStore,
    records: Arc<dyn RecordStore>,
    transport: Arc<dyn Transport>,
    limits: Limits,
    ttl: Duration,
    index: RwLock<CacheIndex>,
    /// Serializes index saves so a stale snapshot never overwrites a newer one
    persist_lock: Mutex<()>,
    /// Shared by writers; taken exclusively when the directory as a whole is
    /// rewritten or scanned
    dir_gate: RwLock<()>,
    init: OnceCell<()>,
    keys: KeyLocks,
    lookups: SingleFlight<Option<PathBuf>>,
    downloads: SingleFlight<Result<()>>,
}

impl CacheManager {
    /// Create a manager over the local filesystem, persisting its index as a
    /// JSON record in `config.state_dir`
    pub fn new(config: CacheConfig, transport: Arc<dyn Transport>) -> Self {
        let records = Arc::new(FileRecordStore::new(config.state_dir.clone()));
        Self::with_collaborators(config, Arc::new(TokioFileSystem), records, transport)
    }

    pub fn with_collaborators(
        config: CacheConfig,
        fs: Arc<dyn FileSystem>,
        records: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let inner = Inner {
            store: DurableStore::new(fs, config.cache_dir.clone()),
            records,
            transport,
            limits: config.limits(),
            ttl: config.entry_ttl(),
            index: RwLock::new(CacheIndex::new()),
            persist_lock: Mutex::new(()),
            dir_gate: RwLock::new(()),
            init: OnceCell::new(),
            keys: KeyLocks::new(),
            lookups: SingleFlight::new(),
            downloads: SingleFlight::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Prepare the cache directory, load the persisted index and sweep
    /// expired entries
    ///
    /// Idempotent, and concurrent callers share one run. A missing or corrupt
    /// index is logged and replaced by an empty one. Only a failure to create
    /// the cache directory is returned, and a later call retries it.
    pub async fn initialize(&self) -> Result<()> {
        self.inner
            .init
            .get_or_try_init(|| self.inner.initialize())
            .await
            .map(|_| ())
    }

    /// Path of the cached file for `key`, or `None` on a miss
    ///
    /// Expired entries and entries whose file has disappeared are removed
    /// before the miss is reported.
    pub async fn get(&self, key: &str) -> Option<PathBuf> {
        self.ensure_initialized().await;
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        self.inner
            .lookups
            .run(key, move || async move { inner.lookup(&owned_key).await })
            .await
    }

    /// Store `key`, either from caller-supplied bytes or by fetching it
    /// through the transport
    ///
    /// Always creates a fresh entry. On a transport or write failure nothing
    /// is committed. Concurrent fetches of one key share a single download.
    pub async fn set(&self, key: &str, bytes: Option<Vec<u8>>) -> Result<()> {
        self.ensure_initialized().await;
        match bytes {
            Some(bytes) => self.inner.commit(key, Some(bytes)).await,
            None => {
                let inner = Arc::clone(&self.inner);
                let owned_key = key.to_string();
                self.inner
                    .downloads
                    .run(key, move || async move { inner.commit(&owned_key, None).await })
                    .await
            }
        }
    }

    /// Drop `key` and its file; absent keys are a no-op
    ///
    /// For an absent key the file at the key's path is still deleted, in
    /// case an eviction left it behind while the key was busy.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.ensure_initialized().await;
        let inner = &self.inner;
        let _key = inner.keys.acquire(key).await;

        let Some(entry) = inner.index.write().await.remove(key) else {
            let path = inner.store.path_for(key);
            if let Err(e) = inner.store.delete(&path).await {
                warn!(key, path = ?path, error = %e, "Failed to delete leftover cache file");
            }
            return Ok(());
        };
        inner.persist().await;

        if let Some(path) = entry.local_path {
            inner.store.delete(&path).await?;
        }
        debug!(key, "Removed cache entry");
        Ok(())
    }

    /// Delete every cached file and empty the index
    ///
    /// The directory is removed, recreated (retrying on failure) and only
    /// then is the index cleared. If recreation keeps failing the index is
    /// still cleared, since the files are gone, and the error is returned;
    /// the next write recreates the directory.
    pub async fn clear(&self) -> Result<()> {
        self.ensure_initialized().await;
        let inner = &self.inner;
        let _dir = inner.dir_gate.write().await;

        inner.store.destroy().await?;
        let recreated = inner.recreate_dir().await;
        let dropped = {
            let mut index = inner.index.write().await;
            let dropped = index.len();
            index.clear();
            dropped
        };
        inner.persist().await;

        info!(dropped, "Cleared image cache");
        recreated.map_err(CacheError::from)
    }

    pub async fn stats(&self) -> CacheStats {
        self.ensure_initialized().await;
        let index = self.inner.index.read().await;

        let mut stats = CacheStats {
            entry_count: index.len(),
            ..CacheStats::default()
        };
        for entry in index.iter() {
            stats.total_size += entry.size.unwrap_or(0);
            stats.total_hits += entry.hits;
            stats.oldest_entry = Some(match stats.oldest_entry {
                Some(oldest) => oldest.min(entry.timestamp),
                None => entry.timestamp,
            });
            stats.newest_entry = Some(match stats.newest_entry {
                Some(newest) => newest.max(entry.timestamp),
                None => entry.timestamp,
            });
        }
        if stats.entry_count > 0 {
            stats.avg_hits_per_entry = stats.total_hits as f64 / stats.entry_count as f64;
        }
        stats
    }

    /// Fetch and cache every key; one key failing does not affect the others
    pub async fn preload<I, S>(&self, keys: I) -> PreloadReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let results: Vec<(String, Result<()>)> = stream::iter(keys.into_iter().map(Into::into))
            .map(|key: String| async move {
                let result = self.set(&key, None).await;
                (key, result)
            })
            .buffered(PRELOAD_CONCURRENCY)
            .collect()
            .await;

        let mut report = PreloadReport::default();
        for (key, result) in results {
            match result {
                Ok(()) => report.cached.push(key),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to preload image");
                    report.failed.push((key, e));
                }
            }
        }
        info!(
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Preload finished"
        );
        report
    }

    /// Whether the index holds an unexpired entry for `key`
    ///
    /// Unlike [`get`](Self::get) this does not check that the file exists.
    pub async fn is_cached(&self, key: &str) -> bool {
        self.ensure_initialized().await;
        let now = Utc::now();
        self.inner
            .index
            .read()
            .await
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Snapshot of the entry for `key`, without touching it
    pub async fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.ensure_initialized().await;
        self.inner.index.read().await.get(key).cloned()
    }

    /// Persist the index now, returning the failure instead of logging it
    pub async fn flush(&self) -> Result<()> {
        self.ensure_initialized().await;
        self.inner.save_index().await
    }

    /// Bring the index and the cache directory back in agreement
    ///
    /// Drops entries whose file is missing and deletes files no entry
    /// references, such as those left behind when deleting an evicted file
    /// failed.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.ensure_initialized().await;
        let inner = &self.inner;
        let _dir = inner.dir_gate.write().await;
        let mut report = ReconcileReport::default();

        let entries: Vec<CacheEntry> = inner.index.read().await.iter().cloned().collect();
        let now = Utc::now();
        for entry in entries {
            let Some(_key) = inner.keys.try_acquire(&entry.key) else {
                continue;
            };
            if policy::validate(&entry, now, &inner.store).await == Validity::Missing
                && inner.index.write().await.remove(&entry.key).is_some()
            {
                report.missing_entries += 1;
            }
        }

        let referenced: HashSet<PathBuf> = inner
            .index
            .read()
            .await
            .iter()
            .filter_map(|entry| entry.local_path.clone())
            .collect();
        for file in inner.store.list().await? {
            if referenced.contains(&file) {
                continue;
            }
            match inner.store.delete(&file).await {
                Ok(()) => report.orphan_files += 1,
                Err(e) => warn!(path = ?file, error = %e, "Failed to delete orphaned cache file"),
            }
        }

        if report.missing_entries > 0 {
            inner.persist().await;
        }
        info!(
            missing_entries = report.missing_entries,
            orphan_files = report.orphan_files,
            "Reconciled image cache"
        );
        Ok(report)
    }

    async fn ensure_initialized(&self) {
        if let Err(e) = self.initialize().await {
            warn!(error = %e, "Image cache not initialized; continuing with an empty index");
        }
    }
}

impl Inner {
    async fn initialize(&self) -> Result<()> {
        self.store
            .ensure_ready()
            .await
            .map_err(|e| CacheError::Initialization(Arc::new(e)))?;

        let loaded = self.load_index().await;
        let (entries, expired) = {
            let mut index = self.index.write().await;
            if index.is_empty() {
                *index = loaded;
            } else {
                warn!("Index already populated; ignoring persisted snapshot");
            }
            let expired = policy::sweep_expired(&mut index, Utc::now());
            (index.len(), expired)
        };

        let swept = expired.len();
        for entry in expired {
            self.discard_file(&entry).await;
        }
        if swept > 0 {
            self.persist().await;
        }

        info!(
            cache_dir = ?self.store.dir(),
            entries,
            swept,
            "Image cache initialized"
        );
        Ok(())
    }

    async fn load_index(&self) -> CacheIndex {
        match self.records.load_record(INDEX_RECORD).await {
            Ok(Some(snapshot)) => CacheIndex::from_snapshot(&snapshot).unwrap_or_else(|e| {
                warn!(error = %e, "Corrupt cache index; starting empty");
                CacheIndex::new()
            }),
            Ok(None) => CacheIndex::new(),
            Err(e) => {
                warn!(error = %e, "Failed to load cache index; starting empty");
                CacheIndex::new()
            }
        }
    }

    async fn lookup(&self, key: &str) -> Option<PathBuf> {
        let _key = self.keys.acquire(key).await;

        let Some(entry) = self.index.read().await.get(key).cloned() else {
            debug!(key, "Cache miss");
            return None;
        };

        let now = Utc::now();
        let validity = policy::validate(&entry, now, &self.store).await;
        if !validity.is_valid() {
            if validity == Validity::Missing {
                let err = CacheError::FileIntegrity {
                    key: key.to_string(),
                    path: entry.local_path.clone(),
                };
                debug!(error = %err, "Self-healing cache entry");
            } else {
                debug!(key, "Cache entry expired");
            }
            // Delete even if an eviction got to the entry first; it left the
            // file to us since we hold the key
            let removed = self.index.write().await.remove(key).is_some();
            if removed {
                self.persist().await;
            }
            self.delete_file(&entry).await;
            return None;
        }

        let touched = self.index.write().await.touch(key, now).is_some();
        if !touched {
            // Evicted while validating; the evictor left the file to us
            self.delete_file(&entry).await;
            return None;
        }
        self.persist().await;

        debug!(key, "Cache hit");
        entry.local_path
    }

    async fn commit(&self, key: &str, bytes: Option<Vec<u8>>) -> Result<()> {
        let _key = self.keys.acquire(key).await;
        let _dir = self.dir_gate.read().await;

        let written = match bytes {
            Some(bytes) => match self.make_room(key, bytes.len() as u64).await {
                Ok(()) => self.store.write(key, &bytes).await.map_err(CacheError::from),
                Err(e) => Err(e),
            },
            None => {
                self.store
                    .fetch_and_write(key, self.transport.as_ref(), |len| self.make_room(key, len))
                    .await
            }
        };

        let (path, size) = match written {
            Ok(written) => written,
            Err(e) => {
                // Victims may already be gone from the index
                self.persist().await;
                return Err(e);
            }
        };

        let entry = CacheEntry::new(key, path, size, Utc::now(), self.ttl);
        self.index.write().await.insert(entry);
        self.persist().await;

        debug!(key, size, "Cached image");
        Ok(())
    }

    async fn make_room(&self, key: &str, new_size: u64) -> Result<()> {
        let evicted = {
            let mut index = self.index.write().await;
            policy::admit(&mut index, key, new_size, &self.limits)?
        };

        for victim in evicted {
            debug!(key = %victim.key, "Evicted least recently used entry");
            self.discard_file(&victim).await;
        }
        Ok(())
    }

    /// Delete the file of an entry that has left the index
    ///
    /// Skipped when another operation holds the entry's key: that operation
    /// either rewrites the file or finds the entry gone and deletes it.
    async fn discard_file(&self, entry: &CacheEntry) {
        let Some(_key) = self.keys.try_acquire(&entry.key) else {
            debug!(key = %entry.key, "Key busy; leaving its file to the owning operation");
            return;
        };
        self.delete_file(entry).await;
    }

    /// Delete an entry's file while the caller owns its key
    async fn delete_file(&self, entry: &CacheEntry) {
        let Some(path) = entry.local_path.as_deref() else {
            return;
        };
        if let Err(e) = self.store.delete(path).await {
            let err = CacheError::Eviction {
                path: path.to_path_buf(),
                source: Arc::new(e),
            };
            warn!(key = %entry.key, error = %err, "Orphaned cache file left on disk");
        }
    }

    async fn recreate_dir(&self) -> io::Result<()> {
        let mut attempt = 1;
        loop {
            match self.store.ensure_ready().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < RECREATE_ATTEMPTS => {
                    warn!(attempt, error = %e, "Failed to recreate cache directory; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        RECREATE_BACKOFF_MS * u64::from(attempt),
                    ))
                    .await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Save the index, logging failures; the in-memory index stays
    /// authoritative and the next mutation saves it again
    async fn persist(&self) {
        if let Err(e) = self.save_index().await {
            warn!(error = %e, "Keeping unsaved cache index in memory");
        }
    }

    async fn save_index(&self) -> Result<()> {
        let _serial = self.persist_lock.lock().await;
        let snapshot = self
            .index
            .read()
            .await
            .to_snapshot()
            .map_err(|e| CacheError::PersistenceWrite(Arc::new(io::Error::from(e))))?;
        self.records
            .save_record(INDEX_RECORD, &snapshot)
            .await
            .map_err(|e| CacheError::PersistenceWrite(Arc::new(e)))
    }
}
