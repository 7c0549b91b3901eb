use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WardenErr>;

#[derive(Error, Debug)]
pub enum WardenErr {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("event log unavailable: {0}")]
    EventLog(String),

    /// Retry limit exceeded while talking to an external fetcher.
    #[error("exceeded retry limit fetching {0}")]
    RetryLimit(String),

    #[error("memory store error: {0}")]
    MemoryStore(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
}
