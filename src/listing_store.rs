use crate::error::{MonitorError, Result};
use crate::storage::SnapshotBackend;
use crate::types::{ArchivedListing, Listing};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Outcome of offering a batch of fetched listings to the archive.
#[derive(Debug, Default)]
pub struct RecordOutcome {
    /// Listings seen for the first time, in batch order.
    pub inserted: Vec<Listing>,
    pub duplicates: usize,
    pub malformed: usize,
}

impl RecordOutcome {
    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }
}

/// Append-only archive of every listing seen, grouped by saved search and
/// deduplicated by `ad_id` within each search.
///
/// The archive never overwrites a snapshot it could not read. After a failed
/// load every write first reads the snapshot again and merges into it; while
/// that read keeps failing, nothing is written.
pub struct ListingStore {
    backend: Arc<dyn SnapshotBackend>,
    key: String,
    archive: BTreeMap<String, Vec<ArchivedListing>>,
    seen: HashMap<String, HashSet<String>>,
    unsaved: bool,
    unreadable: bool,
}

impl ListingStore {
    pub fn new(backend: Arc<dyn SnapshotBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            archive: BTreeMap::new(),
            seen: HashMap::new(),
            unsaved: false,
            unreadable: false,
        }
    }

    /// Replace the in-memory archive with the persisted snapshot.
    ///
    /// A missing snapshot is an empty archive. A snapshot that is not a JSON
    /// object of lists fails with [`MonitorError::CorruptArchive`], and one
    /// that cannot be read returns the backend error. Either way the archive
    /// is left empty and writes are held back until the snapshot is read or
    /// moved aside with [`quarantine`](Self::quarantine). Returns the number
    /// of archived listings.
    pub async fn load(&mut self) -> Result<usize> {
        self.archive.clear();
        self.seen.clear();
        self.unsaved = false;
        self.unreadable = true;

        let Some(archive) = self.read_snapshot().await? else {
            self.unreadable = false;
            info!("Starting with empty listings database");
            return Ok(0);
        };
        self.unreadable = false;
        self.archive = archive;
        self.rebuild_seen();

        let total = self.total_listings();
        info!("Loaded {} existing listings", total);
        Ok(total)
    }

    /// Append every listing in `candidates` whose `ad_id` is not yet archived
    /// for `search_id`, stamping it with the current time.
    ///
    /// Candidates without a usable `ad_id` are skipped. Calling this twice
    /// with the same batch archives each listing once. When anything was
    /// inserted the archive is written through to the backend; a failed write
    /// is logged and retried by the next [`flush`](Self::flush).
    pub async fn record_new(&mut self, search_id: &str, candidates: Vec<Value>) -> RecordOutcome {
        if self.unreadable {
            if let Err(e) = self.recover().await {
                warn!("Listings file is still unreadable: {}", e);
            }
        }

        let mut outcome = RecordOutcome::default();
        let now = Utc::now();

        let ids = self.seen.entry(search_id.to_string()).or_default();
        let listings = self.archive.entry(search_id.to_string()).or_default();

        for candidate in candidates {
            let Some(listing) = Listing::from_payload(candidate) else {
                outcome.malformed += 1;
                continue;
            };
            if !ids.insert(listing.ad_id.clone()) {
                outcome.duplicates += 1;
                continue;
            }
            listings.push(ArchivedListing {
                payload: listing.payload.clone(),
                discovered_at: Some(now),
            });
            outcome.inserted.push(listing);
        }

        if outcome.malformed > 0 {
            warn!(
                "Skipped {} listings without an ad_id for search {}",
                outcome.malformed, search_id
            );
        }

        if !outcome.inserted.is_empty() {
            info!(
                "Added {} new listings to database for search {}",
                outcome.inserted_count(),
                search_id
            );
            self.unsaved = true;
            if let Err(e) = self.persist().await {
                error!("Could not save listings file: {}", e);
            }
        }

        outcome
    }

    /// Write the full archive as one snapshot.
    ///
    /// If the last load failed, the snapshot is read again and merged first;
    /// when it still cannot be read the write is refused.
    pub async fn persist(&mut self) -> Result<()> {
        if self.unreadable {
            self.recover().await?;
        }
        let json = serde_json::to_string_pretty(&self.archive)?;
        self.backend.save(&self.key, &json).await?;
        self.unsaved = false;
        debug!("Saved {} listings to database", self.total_listings());
        Ok(())
    }

    /// Persist only if an earlier write-through failed.
    pub async fn flush(&mut self) -> Result<()> {
        if self.unsaved {
            self.persist().await?;
        }
        Ok(())
    }

    /// Move the unreadable snapshot aside so the next persist does not
    /// overwrite it. Writes are allowed again once it is out of the way.
    pub async fn quarantine(&mut self) -> Result<Option<String>> {
        let moved = self.backend.quarantine(&self.key).await?;
        self.unreadable = false;
        Ok(moved)
    }

    /// True while the snapshot could not be read and must not be written over.
    pub fn is_blocked(&self) -> bool {
        self.unreadable
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved
    }

    pub fn listings(&self, search_id: &str) -> &[ArchivedListing] {
        self.archive
            .get(search_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains(&self, search_id: &str, ad_id: &str) -> bool {
        self.seen
            .get(search_id)
            .is_some_and(|ids| ids.contains(ad_id))
    }

    pub fn total_listings(&self) -> usize {
        self.archive.values().map(Vec::len).sum()
    }

    /// Read and decode the snapshot, one entry at a time. `None` if there is
    /// no snapshot yet.
    async fn read_snapshot(&self) -> Result<Option<BTreeMap<String, Vec<ArchivedListing>>>> {
        let Some(bytes) = self.backend.load(&self.key).await? else {
            return Ok(None);
        };

        let raw: BTreeMap<String, Vec<Value>> =
            serde_json::from_slice(&bytes).map_err(|source| MonitorError::CorruptArchive {
                key: self.key.clone(),
                source,
            })?;

        let mut archive = BTreeMap::new();
        let mut undated = 0;
        for (search_id, entries) in raw {
            let mut listings = Vec::with_capacity(entries.len());
            for entry in entries {
                match ArchivedListing::from_value(entry) {
                    Some(listing) => {
                        if listing.discovered_at.is_none() {
                            undated += 1;
                        }
                        listings.push(listing);
                    }
                    None => warn!("Dropping archived entry in {} that is not an object", search_id),
                }
            }
            archive.insert(search_id, listings);
        }
        if undated > 0 {
            warn!("{} archived listings have no readable discovered_at", undated);
        }

        Ok(Some(archive))
    }

    /// Re-read a snapshot that failed to load and merge the listings
    /// recorded since into it. Stored entries come first and win on `ad_id`.
    async fn recover(&mut self) -> Result<()> {
        let stored = match self.read_snapshot().await {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e @ MonitorError::CorruptArchive { .. }) => {
                error!("{}", e);
                if let Some(moved) = self.backend.quarantine(&self.key).await? {
                    warn!("Corrupt archive kept as {}", moved);
                }
                self.unreadable = false;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let pending = std::mem::replace(&mut self.archive, stored);
        for (search_id, listings) in pending {
            let merged = self.archive.entry(search_id).or_default();
            let mut ids: HashSet<String> = merged.iter().filter_map(|l| l.ad_id()).collect();
            for listing in listings {
                let stored_already = listing.ad_id().is_some_and(|ad_id| !ids.insert(ad_id));
                if !stored_already {
                    merged.push(listing);
                }
            }
        }
        self.rebuild_seen();
        self.unreadable = false;

        info!(
            "Listings file is readable again, {} listings archived",
            self.total_listings()
        );
        Ok(())
    }

    fn rebuild_seen(&mut self) {
        self.seen.clear();
        for (search_id, listings) in &self.archive {
            let ids = self.seen.entry(search_id.clone()).or_default();
            for listing in listings {
                match listing.ad_id() {
                    Some(ad_id) => {
                        ids.insert(ad_id);
                    }
                    None => debug!("Archived listing in {} has no ad_id", search_id),
                }
            }
        }
    }
}
