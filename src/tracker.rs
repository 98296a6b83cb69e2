use crate::detector::{detect_change, Observation};
use crate::error::Result;
use crate::storage::SnapshotBackend;
use crate::types::{SavedSearch, SearchState};
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-search counters, persisted as one `{search_id: SearchState}` snapshot.
pub struct SearchStateTracker {
    backend: Arc<dyn SnapshotBackend>,
    key: String,
    states: BTreeMap<String, SearchState>,
}

impl SearchStateTracker {
    pub fn new(backend: Arc<dyn SnapshotBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            states: BTreeMap::new(),
        }
    }

    /// Replace the in-memory states with the persisted snapshot.
    ///
    /// A missing, unreadable or malformed snapshot leaves the tracker empty
    /// and logs a warning. Returns the number of searches loaded.
    pub async fn load(&mut self) -> usize {
        self.states.clear();

        let content = match self.backend.load(&self.key).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                info!("No saved search state in {}, starting fresh", self.key);
                return 0;
            }
            Err(e) => {
                warn!("Could not load state file {}: {}", self.key, e);
                return 0;
            }
        };

        let snapshot: BTreeMap<String, SearchState> = match serde_json::from_slice(&content) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Could not load state file {}: {}", self.key, e);
                return 0;
            }
        };

        for (_, mut state) in snapshot {
            if state.total_items_seen < state.last_total_count {
                debug!("Raising total_items_seen for {} to its last total", state.id);
                state.total_items_seen = state.last_total_count;
            }
            self.states.insert(state.id.clone(), state);
        }

        info!("Loaded state for {} saved searches", self.states.len());
        self.states.len()
    }

    /// Record a live snapshot of one search and return its updated state
    /// together with the number of items that appeared since the last poll.
    pub fn observe(
        &mut self,
        search_id: &str,
        name: &str,
        current_total: u64,
        current_new: u64,
    ) -> Observation {
        let snapshot = SavedSearch {
            id: search_id.to_string(),
            name: name.to_string(),
            total_count: current_total,
            new_count: current_new,
        };
        let observation = detect_change(self.states.get(search_id), &snapshot, Utc::now());
        self.states
            .insert(search_id.to_string(), observation.state.clone());
        observation
    }

    pub async fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.states)?;
        self.backend.save(&self.key, &json).await?;
        debug!("Saved state for {} saved searches", self.states.len());
        Ok(())
    }

    pub fn get(&self, search_id: &str) -> Option<&SearchState> {
        self.states.get(search_id)
    }

    pub fn states(&self) -> impl Iterator<Item = &SearchState> {
        self.states.values()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    const KEY: &str = "bevakningar_state.json";

    #[test]
    fn observe_tracks_delta_and_baseline() {
        let backend = Arc::new(MemoryBackend::new());
        let mut tracker = SearchStateTracker::new(backend, KEY);

        let first = tracker.observe("1", "Cyklar", 10, 0);
        assert_eq!(first.new_items_found, 0);

        let second = tracker.observe("1", "Cyklar", 14, 2);
        assert_eq!(second.new_items_found, 4);
        assert_eq!(tracker.get("1").unwrap().last_total_count, 14);
        assert_eq!(tracker.get("1").unwrap().new_items_since_start, 4);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn persisted_state_survives_reload() {
        let backend = Arc::new(MemoryBackend::new());
        let mut tracker = SearchStateTracker::new(backend.clone(), KEY);
        tracker.observe("1", "Cyklar", 10, 0);
        tracker.observe("1", "Cyklar", 13, 3);
        tracker.observe("2", "Hjälmar", 4, 0);
        tracker.persist().await.unwrap();

        let mut reloaded = SearchStateTracker::new(backend, KEY);
        assert_eq!(reloaded.load().await, 2);
        assert_eq!(reloaded.get("1"), tracker.get("1"));

        let next = reloaded.observe("1", "Cyklar", 15, 0);
        assert_eq!(next.new_items_found, 2);
        assert_eq!(next.state.new_items_since_start, 5);
    }

    #[tokio::test]
    async fn invalid_json_yields_empty_state() {
        let backend = Arc::new(MemoryBackend::new().with_snapshot(KEY, "{ not json"));
        let mut tracker = SearchStateTracker::new(backend, KEY);

        assert_eq!(tracker.load().await, 0);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn missing_file_yields_empty_state() {
        let backend = Arc::new(MemoryBackend::new());
        let mut tracker = SearchStateTracker::new(backend, KEY);
        assert_eq!(tracker.load().await, 0);
    }

    #[tokio::test]
    async fn loads_snapshot_with_naive_timestamps() {
        let snapshot = r#"{
          "11998349": {
            "id": "11998349",
            "name": "Cyklar",
            "last_total_count": 57,
            "last_new_count": 0,
            "last_check": "2025-08-23T20:26:07.652325",
            "new_items_since_start": 3,
            "total_items_seen": 57
          }
        }"#;
        let backend = Arc::new(MemoryBackend::new().with_snapshot(KEY, snapshot));
        let mut tracker = SearchStateTracker::new(backend, KEY);

        assert_eq!(tracker.load().await, 1);
        let state = tracker.get("11998349").unwrap();
        assert_eq!(state.new_items_since_start, 3);
        assert_eq!(state.total_items_seen, 57);
    }

    #[tokio::test]
    async fn failed_persist_is_reported() {
        let backend = Arc::new(MemoryBackend::new());
        let mut tracker = SearchStateTracker::new(backend.clone(), KEY);
        tracker.observe("1", "Cyklar", 1, 0);

        backend.set_failing(true);
        assert!(tracker.persist().await.is_err());
        assert!(backend.snapshot(KEY).is_none());

        backend.set_failing(false);
        tracker.persist().await.unwrap();
        assert!(backend.snapshot(KEY).is_some());
    }
}
