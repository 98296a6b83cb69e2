use crate::api::MarketplaceApi;
use crate::listing_store::ListingStore;
use crate::tracker::SearchStateTracker;
use crate::types::{Listing, SavedSearch, SearchState};
use chrono::{DateTime, Utc};
use log::{debug, error, info};

/// Images listed per new listing in the log.
const REPORTED_IMAGES: usize = 3;

/// Result of comparing a saved search's live counts with its stored state.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub state: SearchState,
    pub new_items_found: u64,
    pub first_sighting: bool,
}

/// Compute the next state of a search from its previous state and a live snapshot.
///
/// The first sighting of a search is a baseline and reports no new items.
/// A drop in the remote total reports zero new items and is recorded as the
/// new `last_total_count`; no counter ever decreases.
pub fn detect_change(
    previous: Option<&SearchState>,
    search: &SavedSearch,
    now: DateTime<Utc>,
) -> Observation {
    let Some(previous) = previous else {
        return Observation {
            state: SearchState {
                id: search.id.clone(),
                name: search.name.clone(),
                last_total_count: search.total_count,
                last_new_count: search.new_count,
                last_check: now,
                new_items_since_start: 0,
                total_items_seen: search.total_count,
            },
            new_items_found: 0,
            first_sighting: true,
        };
    };

    let new_items_found = search.total_count.saturating_sub(previous.last_total_count);

    Observation {
        state: SearchState {
            id: previous.id.clone(),
            name: search.name.clone(),
            last_total_count: search.total_count,
            last_new_count: search.new_count,
            last_check: now,
            new_items_since_start: previous.new_items_since_start + new_items_found,
            // TODO: count arrivals hidden when the total dips and then rises past the old maximum
            total_items_seen: previous.total_items_seen.max(search.total_count),
        },
        new_items_found,
        first_sighting: false,
    }
}

/// What happened to one search during a poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub observation: Observation,
    pub fetched: usize,
    pub archived: usize,
    pub fetch_failed: bool,
}

/// Feeds one saved search through the tracker and the listing archive.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    listing_limit: u32,
}

impl ChangeDetector {
    pub fn new(listing_limit: u32) -> Self {
        Self { listing_limit }
    }

    pub fn listing_limit(&self) -> u32 {
        self.listing_limit
    }

    /// Observe the search, then hand the whole fetched batch to the archive.
    ///
    /// Deduplication is left to the archive: the remote totals and the
    /// fetched page are independent and may disagree. A failed listing fetch
    /// is logged and reported in the outcome, never returned as an error.
    pub async fn process(
        &self,
        api: &dyn MarketplaceApi,
        search: &SavedSearch,
        tracker: &mut SearchStateTracker,
        store: &mut ListingStore,
    ) -> SearchOutcome {
        let observation =
            tracker.observe(&search.id, &search.name, search.total_count, search.new_count);
        log_observation(search, &observation);

        let batch = match api.fetch_listings(&search.id, self.listing_limit).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(
                    "Error getting listings for {} (ID: {}): {}",
                    search.name, search.id, e
                );
                return SearchOutcome {
                    observation,
                    fetched: 0,
                    archived: 0,
                    fetch_failed: true,
                };
            }
        };

        let fetched = batch.len();
        debug!("{}: fetched {} listings", search.name, fetched);

        let recorded = store.record_new(&search.id, batch).await;
        for (i, listing) in recorded.inserted.iter().enumerate() {
            log_new_listing(&search.name, i + 1, listing);
        }

        SearchOutcome {
            observation,
            fetched,
            archived: recorded.inserted_count(),
            fetch_failed: false,
        }
    }
}

fn log_observation(search: &SavedSearch, observation: &Observation) {
    if observation.first_sighting {
        info!("New saved search discovered: {} (ID: {})", search.name, search.id);
        return;
    }
    if observation.new_items_found > 0 {
        info!(
            "{}: found {} new items (total now {})",
            search.name, observation.new_items_found, search.total_count
        );
    }
    if search.new_count > 0 {
        info!("{}: {} new items available", search.name, search.new_count);
    }
}

fn log_new_listing(search_name: &str, index: usize, listing: &Listing) {
    info!("New listing #{} from {}: {}", index, search_name, listing.title());
    info!("   Price: {}", listing.price_label());
    info!("   Location: {}", listing.location());
    info!("   Listed: {}", listing.listed_at());
    info!("   Status: {}", listing.status());
    if let Some(body) = listing.ad.body.as_deref().filter(|b| !b.is_empty()) {
        debug!("   Description: {}", body);
    }
    if !listing.ad.images.is_empty() {
        info!("   Images: {} available", listing.ad.images.len());
        for (j, url) in listing.image_urls().take(REPORTED_IMAGES).enumerate() {
            info!("      Image {}: {}", j + 1, url);
        }
    }
    info!("   Seller: {}", listing.seller());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search(total: u64, new: u64) -> SavedSearch {
        SavedSearch {
            id: "11998349".to_string(),
            name: "Cyklar".to_string(),
            total_count: total,
            new_count: new,
        }
    }

    #[test]
    fn first_sighting_is_a_baseline() {
        let obs = detect_change(None, &search(57, 3), Utc::now());
        assert!(obs.first_sighting);
        assert_eq!(obs.new_items_found, 0);
        assert_eq!(obs.state.last_total_count, 57);
        assert_eq!(obs.state.total_items_seen, 57);
        assert_eq!(obs.state.last_new_count, 3);
        assert_eq!(obs.state.new_items_since_start, 0);
    }

    #[test]
    fn growth_is_reported_as_new_items() {
        let first = detect_change(None, &search(10, 0), Utc::now());
        let obs = detect_change(Some(&first.state), &search(14, 4), Utc::now());
        assert_eq!(obs.new_items_found, 4);
        assert_eq!(obs.state.last_total_count, 14);
        assert_eq!(obs.state.last_new_count, 4);
        assert_eq!(obs.state.new_items_since_start, 4);
        assert_eq!(obs.state.total_items_seen, 14);
    }

    #[test]
    fn drop_in_total_reports_nothing_and_keeps_counters() {
        let first = detect_change(None, &search(10, 0), Utc::now());
        let grown = detect_change(Some(&first.state), &search(12, 0), Utc::now());
        let dropped = detect_change(Some(&grown.state), &search(7, 0), Utc::now());

        assert_eq!(dropped.new_items_found, 0);
        assert_eq!(dropped.state.last_total_count, 7);
        assert_eq!(dropped.state.total_items_seen, 12);
        assert_eq!(dropped.state.new_items_since_start, 2);
    }

    #[test]
    fn counters_never_decrease() {
        let totals = [5u64, 9, 3, 3, 11, 0, 20, 19];
        let mut state = detect_change(None, &search(totals[0], 0), Utc::now()).state;
        for &total in &totals[1..] {
            let next = detect_change(Some(&state), &search(total, 0), Utc::now()).state;
            assert!(next.total_items_seen >= state.total_items_seen);
            assert!(next.new_items_since_start >= state.new_items_since_start);
            assert!(next.total_items_seen >= next.last_total_count);
            state = next;
        }
    }

    #[test]
    fn renamed_search_keeps_identity() {
        let first = detect_change(None, &search(1, 0), Utc::now());
        let mut renamed = search(1, 0);
        renamed.name = "Racercyklar".to_string();
        let obs = detect_change(Some(&first.state), &renamed, Utc::now());
        assert_eq!(obs.state.id, "11998349");
        assert_eq!(obs.state.name, "Racercyklar");
    }
}
