pub mod api;
pub mod config;
pub mod detector;
pub mod error;
pub mod json_db;
pub mod listing_store;
pub mod monitor;
pub mod storage;
pub mod tracker;
pub mod types;

pub use api::{BlocketClient, MarketplaceApi};
pub use config::MonitorConfig;
pub use detector::{ChangeDetector, Observation};
pub use error::{MonitorError, Result};
pub use json_db::JsonFileBackend;
pub use listing_store::{ListingStore, RecordOutcome};
pub use monitor::{relay_interrupts, CycleReport, Monitor, MonitorSettings, Shutdown};
pub use storage::{MemoryBackend, SnapshotBackend};
pub use tracker::SearchStateTracker;
pub use types::{ArchivedListing, Listing, SavedSearch, SearchState};
