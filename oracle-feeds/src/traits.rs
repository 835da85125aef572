//! Common traits for threat feeds

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oracle_core::{FeedEvent, FeedSource};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

/// Errors from feed operations
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Feed returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Fetch deadline exceeded")]
    Timeout,

    #[error("Response body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Invalid feed configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FeedError::Timeout
        } else if err.is_decode() {
            FeedError::Parse(err.to_string())
        } else {
            FeedError::Network(err.to_string())
        }
    }
}

/// Any source that can be polled for a batch of normalized threat events
#[async_trait]
pub trait ThreatFeed: Send + Sync {
    /// Fixed identity of this feed
    fn source(&self) -> FeedSource;

    /// Human-readable name for logs
    fn name(&self) -> String {
        self.source().to_string()
    }

    /// Fetch new events, giving up at `deadline`
    async fn fetch(&self, deadline: Instant) -> Result<Vec<FeedEvent>, FeedError>;

    /// Advisory: lets the feed narrow its next query window
    fn set_last_fetch_time(&self, at: DateTime<Utc>);
}

/// Thread-safe feed handle
pub type SharedFeed = Arc<dyn ThreatFeed>;
