//! Durable blob storage in the cache directory

use crate::error::Result;
use crate::fs::FileSystem;
use crate::transport::Transport;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Extension used when a key's last path segment has none
pub const DEFAULT_EXTENSION: &str = "jpg";

const MAX_EXTENSION_LEN: usize = 5;
/// Suffix of the file a write goes to before it replaces the cached file
const STAGING_SUFFIX: &str = "part";

/// File name for a key: hex SHA-256 of the key plus the key's extension
///
/// The same key always maps to the same name, so re-writes overwrite.
pub fn file_name_for(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{}.{}", hex::encode(hasher.finalize()), extension_of(key))
}

fn extension_of(key: &str) -> String {
    let path = match Url::parse(key) {
        Ok(url) => url.path().to_string(),
        Err(_) => key.split(['?', '#']).next().unwrap_or(key).to_string(),
    };
    let segment = path.rsplit('/').next().unwrap_or_default();

    match segment.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

/// Stores cached blobs as files in one directory
#[derive(Clone)]
pub struct DurableStore {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
}

impl DurableStore {
    pub fn new(fs: Arc<dyn FileSystem>, dir: PathBuf) -> Self {
        Self { fs, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name_for(key))
    }

    /// Create the cache directory if it does not exist
    pub async fn ensure_ready(&self) -> io::Result<()> {
        self.fs.ensure_dir(&self.dir).await
    }

    /// Write `bytes` for `key`, returning the file path and the measured size
    ///
    /// The bytes go to a staging file that is then renamed over the cached
    /// file, so a failed write leaves any previous file for `key` untouched
    /// and removes only its own partial output.
    pub async fn write(&self, key: &str, bytes: &[u8]) -> io::Result<(PathBuf, Option<u64>)> {
        self.ensure_ready().await?;

        let path = self.path_for(key);
        let staging = self
            .dir
            .join(format!("{}.{}", file_name_for(key), STAGING_SUFFIX));
        let staged = match self.fs.write_file(&staging, bytes).await {
            Ok(()) => self.fs.rename(&staging, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = staged {
            if let Err(cleanup) = self.fs.delete_file(&staging).await {
                warn!(path = ?staging, error = %cleanup, "Failed to remove partial cache file");
            }
            return Err(e);
        }

        let size = match self.fs.stat(&path).await {
            Ok(size) => size,
            Err(e) => {
                debug!(path = ?path, error = %e, "Could not measure cached file");
                None
            }
        };
        debug!(key, path = ?path, size, "Wrote cache file");
        Ok((path, size))
    }

    /// Fetch `key` through the transport and write the result
    ///
    /// `admit` is called with the fetched length before anything is written,
    /// so the caller can make room or refuse. The returned size is the one
    /// measured on disk, falling back to the size the transport reported.
    pub async fn fetch_and_write<A, F>(
        &self,
        key: &str,
        transport: &dyn Transport,
        admit: A,
    ) -> Result<(PathBuf, Option<u64>)>
    where
        A: FnOnce(u64) -> F,
        F: Future<Output = Result<()>>,
    {
        let fetched = transport.fetch(key).await?;
        admit(fetched.bytes.len() as u64).await?;
        let (path, size) = self.write(key, &fetched.bytes).await?;
        Ok((path, size.or(fetched.size)))
    }

    /// Delete a cached file; a missing file is not an error
    pub async fn delete(&self, path: &Path) -> io::Result<()> {
        self.fs.delete_file(path).await
    }

    /// Size of the file if it exists
    pub async fn exists(&self, path: &Path) -> io::Result<Option<u64>> {
        self.fs.stat(path).await
    }

    /// Every file currently in the cache directory
    pub async fn list(&self) -> io::Result<Vec<PathBuf>> {
        self.fs.list_dir(&self.dir).await
    }

    /// Delete the whole cache directory
    pub async fn destroy(&self) -> io::Result<()> {
        self.fs.remove_dir_all(&self.dir).await
    }
}
