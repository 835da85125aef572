//! Generic JSON feed - polls an endpoint that already serves normalized events
//!
//! The endpoint returns either a JSON array of events or `{"events": [...]}`.
//! Vendor-specific parsing stays on the provider side; this feed only:
//! - Narrows the query window with `since=<RFC3339>` once a fetch succeeded
//! - Forces the configured source and stamps the fetch time
//! - Extracts target addresses from free text when an event names none

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use oracle_core::{
    extract_addresses, ChainId, Evidence, FeedEvent, FeedSource, TargetRef, ThreatEventType, ThreatLevel,
};

use crate::{FeedError, ThreatFeed};

const USER_AGENT: &str = concat!("threat-oracle/", env!("CARGO_PKG_VERSION"));

/// Bytes of an error response kept for the error message
const MAX_ERROR_BODY_BYTES: usize = 4096;

/// Configuration for one JSON feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonFeedConfig {
    /// Source every event from this feed is attributed to
    pub source: FeedSource,
    pub url: String,
    /// Sent as a bearer token when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Events beyond this many per fetch are dropped
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Responses larger than this are rejected without being parsed
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Chain assumed for addresses extracted from free text
    #[serde(default = "default_chain_id")]
    pub chain_id: ChainId,
}

fn default_enabled() -> bool {
    true
}

fn default_max_results() -> usize {
    500
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_chain_id() -> ChainId {
    ChainId::ETHEREUM
}

impl JsonFeedConfig {
    pub fn new(source: FeedSource, url: &str) -> Self {
        Self {
            source,
            url: url.to_string(),
            api_key: None,
            enabled: default_enabled(),
            max_results: default_max_results(),
            timeout_secs: default_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            chain_id: default_chain_id(),
        }
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Event as served by a provider; identity and fetch time are ours to assign
#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default = "default_event_type")]
    event_type: ThreatEventType,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_severity")]
    severity: ThreatLevel,
    #[serde(default)]
    targets: Vec<TargetRef>,
    #[serde(default)]
    evidence: Evidence,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    external_url: Option<String>,
}

fn default_event_type() -> ThreatEventType {
    ThreatEventType::Suspicious
}

fn default_severity() -> ThreatLevel {
    ThreatLevel::Medium
}

fn default_confidence() -> f64 {
    0.5
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FeedPayload {
    List(Vec<WireEvent>),
    Wrapped { events: Vec<WireEvent> },
}

/// Read a response body, failing once it grows past `limit` bytes
async fn read_capped(mut response: Response, limit: usize) -> Result<Vec<u8>, FeedError> {
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(FeedError::TooLarge { limit });
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Err(FeedError::TooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Feed that polls a JSON endpoint
pub struct JsonFeed {
    config: JsonFeedConfig,
    url: Url,
    client: Client,
    last_fetch: Mutex<Option<DateTime<Utc>>>,
}

impl JsonFeed {
    pub fn new(config: JsonFeedConfig) -> Result<Self, FeedError> {
        let url = Url::parse(&config.url).map_err(|e| FeedError::Config(format!("{}: {}", config.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FeedError::Config(format!("unsupported scheme in {}", config.url)));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FeedError::Config(e.to_string()))?;

        Ok(Self {
            config,
            url,
            client,
            last_fetch: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &JsonFeedConfig {
        &self.config
    }

    /// Endpoint URL for the next fetch
    fn request_url(&self) -> Url {
        let mut url = self.url.clone();
        if let Some(since) = *self.last_fetch.lock() {
            url.query_pairs_mut().append_pair("since", &since.to_rfc3339());
        }
        url
    }

    /// Parse a response body into normalized events
    fn parse_events(&self, body: &[u8], fetched_at: DateTime<Utc>) -> Result<Vec<FeedEvent>, FeedError> {
        let payload: FeedPayload = serde_json::from_slice(body).map_err(|e| FeedError::Parse(e.to_string()))?;
        let wire = match payload {
            FeedPayload::List(events) => events,
            FeedPayload::Wrapped { events } => events,
        };

        Ok(wire
            .into_iter()
            .take(self.config.max_results)
            .map(|event| self.normalize(event, fetched_at))
            .collect())
    }

    fn normalize(&self, wire: WireEvent, fetched_at: DateTime<Utc>) -> FeedEvent {
        let mut targets = wire.targets;
        if targets.is_empty() {
            let text = format!("{} {}", wire.title, wire.description);
            targets = extract_addresses(&text)
                .iter()
                .map(|address| TargetRef::contract(self.config.chain_id.0, address))
                .collect();
        }

        let mut builder = FeedEvent::builder(self.config.source, wire.event_type, &wire.title)
            .description(&wire.description)
            .severity(wire.severity)
            .evidence(wire.evidence)
            .confidence(wire.confidence)
            .fetched_at(fetched_at);

        for target in targets {
            builder = builder.target(target);
        }
        for tag in &wire.tags {
            builder = builder.tag(tag);
        }
        if let Some(id) = wire.id.filter(|id| !id.is_empty()) {
            builder = builder.id(&id);
        }
        if let Some(published_at) = wire.published_at {
            builder = builder.published_at(published_at);
        }
        if let Some(url) = &wire.external_url {
            builder = builder.external_url(url);
        }

        builder.build()
    }
}

#[async_trait]
impl ThreatFeed for JsonFeed {
    fn source(&self) -> FeedSource {
        self.config.source
    }

    fn name(&self) -> String {
        format!("{} ({})", self.config.source, self.url.host_str().unwrap_or("json"))
    }

    async fn fetch(&self, deadline: Instant) -> Result<Vec<FeedEvent>, FeedError> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(FeedError::Timeout);
        }

        let url = self.request_url();
        debug!("Fetching {} from {}", self.config.source, url);

        let timeout = remaining.min(Duration::from_secs(self.config.timeout_secs.max(1)));
        let mut request = self.client.get(url).timeout(timeout);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = read_capped(response, MAX_ERROR_BODY_BYTES)
                .await
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();
            return Err(FeedError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = read_capped(response, self.config.max_body_bytes).await?;
        let events = self.parse_events(&body, Utc::now())?;
        debug!("{} returned {} events", self.config.source, events.len());

        Ok(events)
    }

    fn set_last_fetch_time(&self, at: DateTime<Utc>) {
        *self.last_fetch.lock() = Some(at);
    }
}
