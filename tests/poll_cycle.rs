use async_trait::async_trait;
use bevakning_monitor::{
    JsonFileBackend, ListingStore, MarketplaceApi, MemoryBackend, Monitor, MonitorSettings,
    Result, SavedSearch, SearchStateTracker, Shutdown,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const STATE: &str = "bevakningar_state.json";
const LISTINGS: &str = "bevakningar_listings.json";

/// Replays one list of saved searches per cycle.
struct ReplayApi {
    rounds: Mutex<VecDeque<Vec<SavedSearch>>>,
    listings: Mutex<HashMap<String, Vec<Value>>>,
}

impl ReplayApi {
    fn new(rounds: Vec<Vec<(&str, &str, u64)>>) -> Self {
        let rounds = rounds
            .into_iter()
            .map(|round| {
                round
                    .into_iter()
                    .map(|(id, name, total)| SavedSearch {
                        id: id.to_string(),
                        name: name.to_string(),
                        total_count: total,
                        new_count: 0,
                    })
                    .collect()
            })
            .collect();
        Self {
            rounds: Mutex::new(rounds),
            listings: Mutex::new(HashMap::new()),
        }
    }

    fn set_listings(&self, search_id: &str, ad_ids: &[&str]) {
        let batch = ad_ids
            .iter()
            .map(|id| json!({"ad": {"ad_id": id, "subject": format!("Annons {}", id)}}))
            .collect();
        self.listings.lock().insert(search_id.to_string(), batch);
    }
}

#[async_trait]
impl MarketplaceApi for ReplayApi {
    async fn list_searches(&self) -> Result<Vec<SavedSearch>> {
        Ok(self.rounds.lock().pop_front().unwrap_or_default())
    }

    async fn fetch_listings(&self, search_id: &str, limit: u32) -> Result<Vec<Value>> {
        let batch = self.listings.lock().get(search_id).cloned().unwrap_or_default();
        Ok(batch.into_iter().take(limit as usize).collect())
    }
}

fn settings(max_iterations: Option<u64>) -> MonitorSettings {
    MonitorSettings {
        interval: Duration::from_millis(1),
        max_iterations,
        ..MonitorSettings::default()
    }
}

#[tokio::test]
async fn three_cycles_accumulate_new_items_per_search() {
    let api = Arc::new(ReplayApi::new(vec![
        vec![("s1", "Cyklar", 5), ("s2", "Hjälmar", 3)],
        vec![("s1", "Cyklar", 5), ("s2", "Hjälmar", 3)],
        vec![("s1", "Cyklar", 9), ("s2", "Hjälmar", 3)],
    ]));
    let backend = Arc::new(MemoryBackend::new());
    let mut monitor = Monitor::new(
        api,
        SearchStateTracker::new(backend.clone(), STATE),
        ListingStore::new(backend.clone(), LISTINGS),
        settings(Some(3)),
    );

    assert_eq!(monitor.run(Shutdown::never()).await, 3);

    let s1 = monitor.tracker().get("s1").unwrap();
    let s2 = monitor.tracker().get("s2").unwrap();
    assert_eq!(s1.new_items_since_start, 4);
    assert_eq!(s1.total_items_seen, 9);
    assert_eq!(s2.new_items_since_start, 0);
    assert_eq!(s2.total_items_seen, 3);

    let persisted: Value = serde_json::from_str(&backend.snapshot(STATE).unwrap()).unwrap();
    assert_eq!(persisted["s1"]["new_items_since_start"], json!(4));
    assert_eq!(persisted["s2"]["new_items_since_start"], json!(0));
}

#[tokio::test]
async fn restart_on_disk_keeps_counters_and_dedup() {
    let dir = TempDir::new().unwrap();

    let api = Arc::new(ReplayApi::new(vec![vec![("s1", "Cyklar", 2)]]));
    api.set_listings("s1", &["100", "101"]);
    let backend = Arc::new(JsonFileBackend::new(dir.path()));
    let mut first = Monitor::new(
        api,
        SearchStateTracker::new(backend.clone(), STATE),
        ListingStore::new(backend.clone(), LISTINGS),
        settings(None),
    );
    first.load().await;
    first.run_once(&Shutdown::never()).await.unwrap();
    assert_eq!(first.store().total_listings(), 2);

    let api = Arc::new(ReplayApi::new(vec![vec![("s1", "Cyklar", 3)]]));
    api.set_listings("s1", &["101", "102"]);
    let backend = Arc::new(JsonFileBackend::new(dir.path()));
    let mut second = Monitor::new(
        api,
        SearchStateTracker::new(backend.clone(), STATE),
        ListingStore::new(backend.clone(), LISTINGS),
        settings(None),
    );
    second.load().await;
    let report = second.run_once(&Shutdown::never()).await.unwrap();

    assert_eq!(report.new_items_found, 1);
    assert_eq!(report.archived, 1);
    assert_eq!(second.tracker().get("s1").unwrap().new_items_since_start, 1);

    let archive: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join(LISTINGS)).unwrap())
            .unwrap();
    let ids: Vec<_> = archive["s1"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["ad"]["ad_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["100", "101", "102"]);
}

#[tokio::test]
async fn corrupt_state_file_does_not_block_the_archive() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(STATE), "{ this is not json").unwrap();

    let api = Arc::new(ReplayApi::new(vec![vec![("s1", "Cyklar", 1)]]));
    api.set_listings("s1", &["1"]);
    let backend = Arc::new(JsonFileBackend::new(dir.path()));
    let mut monitor = Monitor::new(
        api,
        SearchStateTracker::new(backend.clone(), STATE),
        ListingStore::new(backend.clone(), LISTINGS),
        settings(None),
    );

    monitor.load().await;
    assert!(monitor.tracker().is_empty());

    let report = monitor.run_once(&Shutdown::never()).await.unwrap();
    assert_eq!(report.archived, 1);

    let state: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join(STATE)).unwrap()).unwrap();
    assert_eq!(state["s1"]["last_total_count"], json!(1));
}

#[tokio::test]
async fn undecodable_archive_on_disk_is_moved_aside_not_overwritten() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(LISTINGS), b"{\"s1\": [\xff\xfe").unwrap();

    let api = Arc::new(ReplayApi::new(vec![vec![("s1", "Cyklar", 1)]]));
    api.set_listings("s1", &["1"]);
    let backend = Arc::new(JsonFileBackend::new(dir.path()));
    let mut monitor = Monitor::new(
        api,
        SearchStateTracker::new(backend.clone(), STATE),
        ListingStore::new(backend.clone(), LISTINGS),
        settings(None),
    );
    monitor.load().await;
    monitor.run_once(&Shutdown::never()).await.unwrap();

    let moved: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(&format!("{}.corrupt-", LISTINGS)))
        .collect();
    assert_eq!(moved.len(), 1);
    assert_eq!(
        std::fs::read(dir.path().join(&moved[0])).unwrap(),
        b"{\"s1\": [\xff\xfe".to_vec()
    );
}

#[tokio::test]
async fn archive_with_an_undated_entry_still_deduplicates() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(LISTINGS),
        r#"{"s1": [
            {"ad": {"ad_id": "a"}, "discovered_at": "2025-08-23T20:26:07Z"},
            {"ad": {"ad_id": "b"}, "discovered_at": null}
        ]}"#,
    )
    .unwrap();

    let api = Arc::new(ReplayApi::new(vec![vec![("s1", "Cyklar", 3)]]));
    api.set_listings("s1", &["a", "b", "c"]);
    let backend = Arc::new(JsonFileBackend::new(dir.path()));
    let mut monitor = Monitor::new(
        api,
        SearchStateTracker::new(backend.clone(), STATE),
        ListingStore::new(backend.clone(), LISTINGS),
        settings(None),
    );
    monitor.load().await;
    let report = monitor.run_once(&Shutdown::never()).await.unwrap();

    assert_eq!(report.archived, 1);
    assert_eq!(monitor.store().total_listings(), 3);
}
