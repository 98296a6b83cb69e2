use anyhow::{Context, Result};
use bevakning_monitor::{
    relay_interrupts, BlocketClient, JsonFileBackend, ListingStore, Monitor, MonitorConfig,
    MonitorSettings, SearchStateTracker, Shutdown,
};
use clap::Parser;
use log::{info, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bevakning-monitor")]
#[command(about = "Monitor Blocket saved searches for new items", long_about = None)]
struct Cli {
    /// Check interval in seconds
    #[arg(short, long, default_value_t = 300)]
    interval: u64,

    /// Maximum number of checks to run (default: run indefinitely)
    #[arg(short = 'n', long)]
    iterations: Option<u64>,

    /// Run a single check and exit
    #[arg(short, long)]
    once: bool,

    /// Directory holding the state and listings files
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();

    let mut config = MonitorConfig::from_env()?;
    init_logging(config.log_file.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let client = BlocketClient::new(&config.api_url, config.api_token.as_deref())
        .context("could not create the Blocket API client")?;

    let backend = Arc::new(JsonFileBackend::new(&config.data_dir));
    if let Err(e) = backend.init().await {
        warn!("{}", e);
    }
    info!("Storing snapshots in {}", backend.base_path().display());

    let tracker = SearchStateTracker::new(backend.clone(), config.state_file.clone());
    let store = ListingStore::new(backend, config.listings_file.clone());
    let settings = MonitorSettings {
        interval: Duration::from_secs(cli.interval),
        max_iterations: cli.iterations,
        listing_limit: config.listing_limit,
        ..MonitorSettings::default()
    };

    let mut monitor = Monitor::new(Arc::new(client), tracker, store, settings);
    monitor.load().await;

    let (stop, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        if relay_interrupts(tokio::signal::ctrl_c, stop).await {
            warn!("Second interrupt received, exiting immediately");
            std::process::exit(130);
        }
    });

    if cli.once {
        // Failures are logged by the monitor; a failed check is not a startup failure.
        let _ = monitor.run_once(&shutdown).await;
    } else {
        monitor.run(shutdown).await;
    }

    Ok(())
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("could not open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
    }
    builder.init();
    Ok(())
}

/// Writes log output to stderr and the log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.file.flush()
    }
}
