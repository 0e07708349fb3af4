//! Key-value persistence collaborator

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use tokio::fs;

/// Stores named string records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns `None` if the record was never saved
    async fn load_record(&self, name: &str) -> io::Result<Option<String>>;
    async fn save_record(&self, name: &str, value: &str) -> io::Result<()>;
}

/// [`RecordStore`] keeping one JSON file per record in a directory
///
/// Saves go through a temporary file and a rename, so a crash mid-write
/// leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    dir: PathBuf,
}

impl FileRecordStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn load_record(&self, name: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.record_path(name)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save_record(&self, name: &str, value: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(name);
        let tmp = self.dir.join(format!("{}.json.tmp", name));
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await
    }
}
