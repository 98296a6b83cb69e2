use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("invalid response data: {0}")]
    InvalidResponse(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("listing archive `{key}` is corrupt: {source}")]
    CorruptArchive {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
