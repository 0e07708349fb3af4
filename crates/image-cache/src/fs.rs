//! Filesystem collaborator

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Filesystem primitives the durable store is built on
///
/// Deletions are idempotent: removing something that does not exist succeeds.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn ensure_dir(&self, dir: &Path) -> io::Result<()>;
    async fn remove_dir_all(&self, dir: &Path) -> io::Result<()>;
    async fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    /// Move `from` over `to`, replacing it
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    async fn delete_file(&self, path: &Path) -> io::Result<()>;
    /// Size of the file, or `None` if it does not exist
    async fn stat(&self, path: &Path) -> io::Result<Option<u64>>;
    /// Regular files directly inside `dir`
    async fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
}

/// [`FileSystem`] over `tokio::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn ensure_dir(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir).await
    }

    async fn remove_dir_all(&self, dir: &Path) -> io::Result<()> {
        ignore_not_found(fs::remove_dir_all(dir).await)
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(path, data).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to).await
    }

    async fn delete_file(&self, path: &Path) -> io::Result<()> {
        ignore_not_found(fs::remove_file(path).await)
    }

    async fn stat(&self, path: &Path) -> io::Result<Option<u64>> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }
}

/// [`TokioFileSystem`] that fails chosen operations on demand
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FaultyFileSystem {
    pub(crate) fail_writes: std::sync::atomic::AtomicBool,
    pub(crate) fail_deletes: std::sync::atomic::AtomicBool,
    /// Number of upcoming `ensure_dir` calls that fail
    pub(crate) ensure_dir_failures: std::sync::atomic::AtomicUsize,
    pub(crate) ensure_dir_calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FaultyFileSystem {
    fn injected(op: &str) -> io::Error {
        io::Error::other(format!("injected {} failure", op))
    }
}

#[cfg(test)]
#[async_trait]
impl FileSystem for FaultyFileSystem {
    async fn ensure_dir(&self, dir: &Path) -> io::Result<()> {
        use std::sync::atomic::Ordering;
        self.ensure_dir_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .ensure_dir_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Self::injected("ensure_dir"));
        }
        TokioFileSystem.ensure_dir(dir).await
    }

    async fn remove_dir_all(&self, dir: &Path) -> io::Result<()> {
        TokioFileSystem.remove_dir_all(dir).await
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            // Leave a partial file behind, as a real failed write can
            TokioFileSystem.write_file(path, &data[..data.len() / 2]).await?;
            return Err(Self::injected("write"));
        }
        TokioFileSystem.write_file(path, data).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        TokioFileSystem.rename(from, to).await
    }

    async fn delete_file(&self, path: &Path) -> io::Result<()> {
        if self.fail_deletes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Self::injected("delete"));
        }
        TokioFileSystem.delete_file(path).await
    }

    async fn stat(&self, path: &Path) -> io::Result<Option<u64>> {
        TokioFileSystem.stat(path).await
    }

    async fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        TokioFileSystem.list_dir(dir).await
    }
}
