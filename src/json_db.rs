use crate::error::{MonitorError, Result};
use crate::storage::SnapshotBackend;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Stores each snapshot as a JSON file inside one data directory.
///
/// Writes go to `<file>.tmp` first and are renamed over the target, so a
/// failed write never touches the last committed snapshot.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    base_path: PathBuf,
}

impl JsonFileBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            base_path: path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Create the data directory if it does not exist yet.
    pub async fn init(&self) -> Result<()> {
        if !self.base_path.exists() {
            fs::create_dir_all(&self.base_path).await.map_err(|e| {
                MonitorError::StorageError(format!(
                    "Failed to create data directory {}: {}",
                    self.base_path.display(),
                    e
                ))
            })?;
            info!("Created data directory {}", self.base_path.display());
        }
        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    async fn write_temp(&self, temp_path: &Path, contents: &str) -> Result<()> {
        let mut file = fs::File::create(temp_path).await.map_err(|e| {
            MonitorError::StorageError(format!("Failed to create temp file: {}", e))
        })?;

        file.write_all(contents.as_bytes()).await.map_err(|e| {
            MonitorError::StorageError(format!("Failed to write to temp file: {}", e))
        })?;

        file.flush()
            .await
            .map_err(|e| MonitorError::StorageError(format!("Failed to flush temp file: {}", e)))?;

        file.sync_all()
            .await
            .map_err(|e| MonitorError::StorageError(format!("Failed to sync temp file: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl SnapshotBackend for JsonFileBackend {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let file_path = self.path_for(key);

        match fs::read(&file_path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} does not exist yet", file_path.display());
                Ok(None)
            }
            Err(e) => Err(MonitorError::StorageError(format!(
                "Failed to read {}: {}",
                file_path.display(),
                e
            ))),
        }
    }

    async fn save(&self, key: &str, contents: &str) -> Result<()> {
        let file_path = self.path_for(key);
        let temp_path = self.path_for(&format!("{}.tmp", key));

        if let Err(e) = self.write_temp(&temp_path, contents).await {
            if fs::remove_file(&temp_path).await.is_ok() {
                debug!("Removed partial temp file {}", temp_path.display());
            }
            return Err(e);
        }

        fs::rename(&temp_path, &file_path)
            .await
            .map_err(|e| MonitorError::StorageError(format!("Failed to rename temp file: {}", e)))?;

        Ok(())
    }

    async fn quarantine(&self, key: &str) -> Result<Option<String>> {
        let file_path = self.path_for(key);
        if !file_path.exists() {
            return Ok(None);
        }

        let moved = format!("{}.corrupt-{}", key, Utc::now().format("%Y%m%d%H%M%S"));
        fs::rename(&file_path, self.path_for(&moved))
            .await
            .map_err(|e| {
                MonitorError::StorageError(format!(
                    "Failed to move {} aside: {}",
                    file_path.display(),
                    e
                ))
            })?;

        warn!("Moved unreadable {} to {}", key, moved);
        Ok(Some(moved))
    }
}
