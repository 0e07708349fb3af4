use crate::policy::Limits;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60; // 7 days
const DEFAULT_MAX_SIZE: u64 = 100 * 1024 * 1024; // 100 MiB
const DEFAULT_MAX_ENTRIES: usize = 500;
/// Upper bound for `max_age` so expiry arithmetic cannot overflow
const MAX_AGE_CAP: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding one file per cached image
    pub cache_dir: PathBuf,
    /// Directory holding the persisted index record
    pub state_dir: PathBuf,
    pub max_age: Duration,
    /// Byte budget, enforced at admission
    pub max_size: u64,
    /// Entry limit; 0 behaves as 1
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::with_root("./cache")
    }
}

impl CacheConfig {
    /// Default limits with `images/` and `state/` under `root`
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            cache_dir: root.join("images"),
            state_dir: root.join("state"),
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS),
            max_size: DEFAULT_MAX_SIZE,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    /// Parse configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cache_dir = env::var("IMAGE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let state_dir = env::var("IMAGE_CACHE_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);

        let max_age = env::var("IMAGE_CACHE_MAX_AGE_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_age);

        let max_size = env::var("IMAGE_CACHE_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.max_size);

        let max_entries = env::var("IMAGE_CACHE_MAX_ENTRIES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(defaults.max_entries);

        Self {
            cache_dir,
            state_dir,
            max_age,
            max_size,
            max_entries,
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_size: self.max_size,
            max_entries: self.max_entries,
        }
    }

    /// `max_age` as a chrono duration, capped at roughly a century
    pub fn entry_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.max_age.min(MAX_AGE_CAP))
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_MAX_AGE_SECS as i64))
    }
}
