//! Persistent image cache with TTL expiration and LRU eviction
//!
//! Remote images are stored one file per URI in a dedicated cache directory.
//! A metadata index keyed by URI lives in memory and is written through to a
//! key-value record after every mutation. Entries are validated on read:
//! expired entries and entries whose file has disappeared are removed and
//! reported as misses.
//!
//! The filesystem, the key-value persistence and the network transport are
//! injected collaborators (see [`FileSystem`], [`RecordStore`] and
//! [`Transport`]); tokio-backed defaults are provided for the first two.

mod config;
mod error;
mod flight;
mod fs;
mod index;
mod manager;
mod policy;
mod record;
mod store;
mod transport;
mod types;

pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use fs::{FileSystem, TokioFileSystem};
pub use index::{CacheIndex, INDEX_RECORD};
pub use manager::CacheManager;
pub use policy::{Limits, Validity};
pub use record::{FileRecordStore, RecordStore};
pub use store::{file_name_for, DurableStore, DEFAULT_EXTENSION};
pub use transport::{Fetched, Transport, TransportError};
pub use types::{CacheEntry, CacheStats, PreloadReport, ReconcileReport};
