use crate::api::MarketplaceApi;
use crate::detector::{ChangeDetector, SearchOutcome};
use crate::error::{MonitorError, Result};
use crate::listing_store::ListingStore;
use crate::tracker::SearchStateTracker;
use chrono::Local;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_SUMMARY_EVERY: u64 = 5;

/// Interrupt flag shared between the signal handler and the monitor.
///
/// The monitor checks it between searches and while sleeping between
/// cycles; in-flight requests are allowed to finish.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown { rx })
    }

    /// A flag that is never raised.
    pub fn never() -> Shutdown {
        Self::channel().1
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is raised. Never resolves if the sender is gone
    /// without raising it.
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Raise `stop` on the first interrupt. Returns `true` once a second
/// interrupt arrives, `false` if signals can no longer be received.
pub async fn relay_interrupts<F, Fut>(mut next_interrupt: F, stop: watch::Sender<bool>) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let mut received = 0;
    loop {
        if let Err(e) = next_interrupt().await {
            warn!("Could not listen for interrupts: {}", e);
            return false;
        }
        received += 1;
        if received > 1 {
            return true;
        }
        info!("Interrupt received, finishing up (interrupt again to exit immediately)");
        let _ = stop.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub max_iterations: Option<u64>,
    pub listing_limit: u32,
    /// Log a summary every N cycles; 0 disables the periodic summary.
    pub summary_every: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_iterations: None,
            listing_limit: crate::config::DEFAULT_LISTING_LIMIT,
            summary_every: DEFAULT_SUMMARY_EVERY,
        }
    }
}

/// Totals for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub searches: usize,
    pub failed_fetches: usize,
    pub new_items_found: u64,
    pub archived: usize,
    pub interrupted: bool,
}

impl CycleReport {
    fn absorb(&mut self, outcome: &SearchOutcome) {
        self.searches += 1;
        self.new_items_found += outcome.observation.new_items_found;
        self.archived += outcome.archived;
        if outcome.fetch_failed {
            self.failed_fetches += 1;
        }
    }
}

/// Drives poll cycles over all saved searches and owns both stores.
pub struct Monitor {
    api: Arc<dyn MarketplaceApi>,
    detector: ChangeDetector,
    tracker: SearchStateTracker,
    store: ListingStore,
    settings: MonitorSettings,
}

impl Monitor {
    pub fn new(
        api: Arc<dyn MarketplaceApi>,
        tracker: SearchStateTracker,
        store: ListingStore,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            api,
            detector: ChangeDetector::new(settings.listing_limit),
            tracker,
            store,
            settings,
        }
    }

    pub fn tracker(&self) -> &SearchStateTracker {
        &self.tracker
    }

    pub fn store(&self) -> &ListingStore {
        &self.store
    }

    /// Load both snapshots. Neither failure stops the monitor; a corrupt
    /// archive is moved aside before starting with an empty one. An archive
    /// that cannot be read, or cannot be moved aside, is left in place and
    /// the store holds its writes until it becomes readable.
    pub async fn load(&mut self) {
        self.tracker.load().await;

        match self.store.load().await {
            Ok(_) => {}
            Err(e @ MonitorError::CorruptArchive { .. }) => {
                error!("{}; starting with an empty archive", e);
                match self.store.quarantine().await {
                    Ok(Some(moved)) => warn!("Corrupt archive kept as {}", moved),
                    Ok(None) => {}
                    Err(e) => error!(
                        "Could not move corrupt archive aside, it will not be overwritten: {}",
                        e
                    ),
                }
            }
            Err(e) => warn!(
                "Could not load listings file, it will not be overwritten until it can be read: {}",
                e
            ),
        }
    }

    /// Poll every saved search once.
    ///
    /// Fails only when the saved searches themselves cannot be fetched.
    /// Search state is persisted after every search has been processed.
    pub async fn run_cycle(&mut self, shutdown: &Shutdown) -> Result<CycleReport> {
        let searches = self.api.list_searches().await?;
        if searches.is_empty() {
            warn!("No saved searches found");
        } else {
            info!("Found {} active saved searches", searches.len());
        }

        let mut report = CycleReport::default();
        for search in &searches {
            if shutdown.is_triggered() {
                info!("Interrupted, skipping the remaining searches");
                report.interrupted = true;
                break;
            }
            let outcome = self
                .detector
                .process(self.api.as_ref(), search, &mut self.tracker, &mut self.store)
                .await;
            report.absorb(&outcome);
        }

        if let Err(e) = self.tracker.persist().await {
            error!("Could not save state file: {}", e);
        }
        if let Err(e) = self.store.flush().await {
            error!("Could not save listings file: {}", e);
        }

        Ok(report)
    }

    /// Run a single cycle, then persist and summarise.
    pub async fn run_once(&mut self, shutdown: &Shutdown) -> Result<CycleReport> {
        info!("Running single check...");
        let report = self.run_cycle(shutdown).await;
        if let Err(e) = &report {
            error!("Check failed: {}", e);
        }
        self.finalize().await;
        report
    }

    /// Repeat cycles until the iteration limit is reached or `shutdown` is
    /// raised. Cycle errors are logged and the loop carries on. Both stores
    /// are persisted before returning. Returns the number of cycles started.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> u64 {
        info!(
            "Starting saved search monitor, checking every {:?}",
            self.settings.interval
        );
        let mut iteration = 0;

        while self.has_iterations_left(iteration) && !shutdown.is_triggered() {
            iteration += 1;
            info!(
                "Check #{} at {}",
                iteration,
                Local::now().format("%Y-%m-%d %H:%M:%S")
            );

            match self.run_cycle(&shutdown).await {
                Ok(report) => info!(
                    "Check #{} done: {} searches, {} new items, {} listings archived, {} failed fetches",
                    iteration,
                    report.searches,
                    report.new_items_found,
                    report.archived,
                    report.failed_fetches
                ),
                Err(e) => error!("Check #{} failed: {}", iteration, e),
            }

            if self.settings.summary_every > 0 && iteration % self.settings.summary_every == 0 {
                self.log_summary();
            }

            if !self.has_iterations_left(iteration) || shutdown.is_triggered() {
                break;
            }

            debug!("Waiting {:?} until next check", self.settings.interval);
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = shutdown.triggered() => info!("Monitoring stopped by user"),
            }
        }

        self.finalize().await;
        iteration
    }

    /// Persist both stores and log a summary. The archive is only written
    /// over a snapshot this run was able to read.
    pub async fn finalize(&mut self) {
        info!("Saving final state and listings...");
        if let Err(e) = self.tracker.persist().await {
            error!("Could not save state file: {}", e);
        }
        if let Err(e) = self.store.persist().await {
            error!("Could not save listings file: {}", e);
        }
        self.log_summary();
        info!("Monitor stopped");
    }

    pub fn log_summary(&self) {
        info!("Saved search summary ({} searches)", self.tracker.len());
        for state in self.tracker.states() {
            info!(
                "  {} (ID: {}): total {}, new {}, new since start {}, seen {}, archived {}, last check {}",
                state.name,
                state.id,
                state.last_total_count,
                state.last_new_count,
                state.new_items_since_start,
                state.total_items_seen,
                self.store.listings(&state.id).len(),
                state
                    .last_check
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
            );
        }
        info!("  {} listings archived in total", self.store.total_listings());
    }

    fn has_iterations_left(&self, iteration: u64) -> bool {
        self.settings
            .max_iterations
            .map_or(true, |max| iteration < max)
    }
}
