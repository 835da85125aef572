//! Threat Oracle Feeds
//!
//! Sources of normalized threat events:
//! - **ThreatFeed**: the polling abstraction the service depends on
//! - **InternalFeed**: findings from our own scanners, always registered
//! - **JsonFeed**: any HTTP endpoint that serves pre-normalized events

pub mod traits;
pub mod internal;
pub mod json;

pub use traits::*;
pub use internal::*;
pub use json::*;

use std::sync::Arc;

/// Create a shared JSON feed from its configuration
pub fn create_json_feed(config: JsonFeedConfig) -> Result<SharedFeed, FeedError> {
    Ok(Arc::new(JsonFeed::new(config)?))
}
