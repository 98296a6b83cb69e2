use crate::error::{MonitorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Whole-snapshot persistence for the tracker and the listing archive.
///
/// Each snapshot is a JSON document stored under a key (a file name for the
/// on-disk backend). Every store has exactly one writer.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Read the raw bytes stored under `key`, `None` if it was never written.
    /// Decoding is left to the caller so that undecodable content can be told
    /// apart from a failed read.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the snapshot under `key`. A failed save leaves the previous
    /// snapshot readable.
    async fn save(&self, key: &str, contents: &str) -> Result<()>;

    /// Move an unreadable snapshot out of the way so the next save cannot
    /// overwrite it. Returns where it was moved, `None` if there was nothing
    /// to move.
    async fn quarantine(&self, key: &str) -> Result<Option<String>>;
}

/// Snapshot backend kept entirely in memory.
#[derive(Default)]
pub struct MemoryBackend {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
    fail_saves: Mutex<bool>,
    failing_loads: Mutex<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(self, key: &str, contents: &str) -> Self {
        self.with_bytes(key, contents.as_bytes())
    }

    pub fn with_bytes(self, key: &str, contents: &[u8]) -> Self {
        self.snapshots
            .lock()
            .insert(key.to_string(), contents.to_vec());
        self
    }

    /// The snapshot under `key` as text, `None` if missing or not UTF-8.
    pub fn snapshot(&self, key: &str) -> Option<String> {
        let bytes = self.snapshots.lock().get(key).cloned()?;
        String::from_utf8(bytes).ok()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.snapshots.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Make every subsequent save fail until switched off again.
    pub fn set_failing(&self, failing: bool) {
        *self.fail_saves.lock() = failing;
    }

    /// Make the next `count` loads fail as if the snapshot could not be read.
    pub fn fail_next_loads(&self, count: usize) {
        *self.failing_loads.lock() = count;
    }
}

#[async_trait]
impl SnapshotBackend for MemoryBackend {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        {
            let mut failing = self.failing_loads.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(MonitorError::StorageError(format!(
                    "injected read failure for {}",
                    key
                )));
            }
        }
        Ok(self.snapshots.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, contents: &str) -> Result<()> {
        if *self.fail_saves.lock() {
            return Err(MonitorError::StorageError(format!(
                "injected write failure for {}",
                key
            )));
        }
        self.snapshots
            .lock()
            .insert(key.to_string(), contents.as_bytes().to_vec());
        Ok(())
    }

    async fn quarantine(&self, key: &str) -> Result<Option<String>> {
        let mut snapshots = self.snapshots.lock();
        match snapshots.remove(key) {
            Some(contents) => {
                let moved = format!("{}.corrupt", key);
                snapshots.insert(moved.clone(), contents);
                Ok(Some(moved))
            }
            None => Ok(None),
        }
    }
}
