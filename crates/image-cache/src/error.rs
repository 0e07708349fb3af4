//! Error types for the image cache

use crate::transport::TransportError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors surfaced by cache operations
///
/// I/O sources are held in `Arc` so one result can be shared between every
/// caller waiting on the same in-flight operation.
#[derive(Debug, Clone)]
pub enum CacheError {
    /// The cache directory could not be created
    Initialization(Arc<io::Error>),
    /// The index snapshot could not be saved
    PersistenceWrite(Arc<io::Error>),
    /// Fetching the bytes for a key failed
    Transport(TransportError),
    /// An index entry points at a file that is no longer there
    FileIntegrity { key: String, path: Option<PathBuf> },
    /// An evicted entry's file could not be deleted
    Eviction { path: PathBuf, source: Arc<io::Error> },
    /// The entry alone exceeds the byte budget
    EntryTooLarge { size: u64, max_size: u64 },
    Io(Arc<io::Error>),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Initialization(err) => write!(f, "Initialization error: {}", err),
            CacheError::PersistenceWrite(err) => write!(f, "Failed to persist index: {}", err),
            CacheError::Transport(err) => write!(f, "Transport error: {}", err),
            CacheError::FileIntegrity { key, path } => match path {
                Some(path) => write!(f, "Cached file for {} is missing: {:?}", key, path),
                None => write!(f, "Cache entry for {} has no file", key),
            },
            CacheError::Eviction { path, source } => {
                write!(f, "Failed to delete evicted file {:?}: {}", path, source)
            }
            CacheError::EntryTooLarge { size, max_size } => write!(
                f,
                "Entry of {} bytes exceeds cache size limit of {} bytes",
                size, max_size
            ),
            CacheError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Initialization(err)
            | CacheError::PersistenceWrite(err)
            | CacheError::Io(err) => Some(err.as_ref()),
            CacheError::Eviction { source, .. } => Some(source.as_ref()),
            CacheError::Transport(err) => Some(err),
            CacheError::FileIntegrity { .. } | CacheError::EntryTooLarge { .. } => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}

impl From<TransportError> for CacheError {
    fn from(err: TransportError) -> Self {
        CacheError::Transport(err)
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
