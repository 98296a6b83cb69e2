use crate::api::BLOCKET_API_BASE;
use crate::error::{MonitorError, Result};
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_STATE_FILE: &str = "bevakningar_state.json";
pub const DEFAULT_LISTINGS_FILE: &str = "bevakningar_listings.json";
pub const DEFAULT_LISTING_LIMIT: u32 = 99;

/// Settings read from the environment (after `.env` has been applied).
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    pub data_dir: PathBuf,
    pub state_file: String,
    pub listings_file: String,
    pub listing_limit: u32,
    /// Also append log output to this file.
    pub log_file: Option<PathBuf>,
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            api_url: var("BLOCKET_API_URL", BLOCKET_API_BASE),
            api_token: lookup("BLOCKET_API_TOKEN"),
            data_dir: PathBuf::from(var("MONITOR_DATA_DIR", ".")),
            state_file: var("MONITOR_STATE_FILE", DEFAULT_STATE_FILE),
            listings_file: var("MONITOR_LISTINGS_FILE", DEFAULT_LISTINGS_FILE),
            listing_limit: parse_var(&lookup, "MONITOR_LISTING_LIMIT", DEFAULT_LISTING_LIMIT)?,
            log_file: lookup("MONITOR_LOG_FILE")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| MonitorError::ConfigError(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}
