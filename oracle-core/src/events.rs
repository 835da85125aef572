//! Normalized threat events as reported by feeds
//!
//! A [`FeedEvent`] is one report about one or more on-chain targets:
//! - Each event carries its [`FeedSource`], which fixes its default trust weight
//! - Targets are identified by `(chain id, address)` through [`TargetRef::key`]
//! - Events are immutable once built; the aggregator only ever clones them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing model values out of configuration or user input
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Unknown feed source: {0}")]
    UnknownSource(String),

    #[error("Unknown threat level: {0}")]
    UnknownThreatLevel(String),
}

/// Origin of a piece of threat intelligence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSource {
    /// GitHub exploit repositories
    #[serde(rename = "github")]
    GitHub,
    /// NIST National Vulnerability Database
    Nvd,
    /// Chainabuse community reports
    #[serde(rename = "chainabuse")]
    ChainAbuse,
    /// BlockSec alerts
    #[serde(rename = "blocksec")]
    BlockSec,
    /// CertiK Skynet
    #[serde(rename = "certik")]
    CertiK,
    /// SlowMist hacked list
    #[serde(rename = "slowmist")]
    SlowMist,
    /// Forta network alerts
    Forta,
    /// Findings from our own scanners
    Internal,
}

impl FeedSource {
    pub const ALL: [FeedSource; 8] = [
        FeedSource::GitHub,
        FeedSource::Nvd,
        FeedSource::ChainAbuse,
        FeedSource::BlockSec,
        FeedSource::CertiK,
        FeedSource::SlowMist,
        FeedSource::Forta,
        FeedSource::Internal,
    ];

    /// Stable lowercase name, identical to the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedSource::GitHub => "github",
            FeedSource::Nvd => "nvd",
            FeedSource::ChainAbuse => "chainabuse",
            FeedSource::BlockSec => "blocksec",
            FeedSource::CertiK => "certik",
            FeedSource::SlowMist => "slowmist",
            FeedSource::Forta => "forta",
            FeedSource::Internal => "internal",
        }
    }

    /// Trust weight applied when no override is configured
    pub fn default_trust_weight(&self) -> f64 {
        match self {
            // Needs manual review
            FeedSource::GitHub => 0.6,
            FeedSource::Nvd => 0.9,
            FeedSource::ChainAbuse => 0.7,
            FeedSource::BlockSec => 0.9,
            FeedSource::CertiK => 0.9,
            FeedSource::SlowMist => 0.9,
            FeedSource::Forta => 0.8,
            FeedSource::Internal => 0.7,
        }
    }
}

impl fmt::Display for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedSource {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        FeedSource::ALL
            .into_iter()
            .find(|source| source.as_str() == lowered)
            .ok_or_else(|| ModelError::UnknownSource(s.to_string()))
    }
}

/// Category of a reported threat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatEventType {
    /// PoC or active exploit
    Exploit,
    /// Newly disclosed vulnerability
    Vulnerability,
    RugPull,
    Phishing,
    FlashLoan,
    BridgeHack,
    OracleManip,
    /// Malware genome match
    Malware,
    Suspicious,
}

impl ThreatEventType {
    /// Phrase used when this type dominates a target's history
    pub fn summary_phrase(&self) -> &'static str {
        match self {
            ThreatEventType::Exploit => "Exploit PoC reported",
            ThreatEventType::Vulnerability => "Vulnerability disclosed",
            ThreatEventType::RugPull => "Rug pull pattern detected",
            ThreatEventType::Phishing => "Phishing campaign linked",
            ThreatEventType::FlashLoan => "Flash loan attack detected",
            ThreatEventType::BridgeHack => "Bridge exploit reported",
            ThreatEventType::OracleManip => "Oracle manipulation detected",
            ThreatEventType::Malware => "Malware genome match",
            ThreatEventType::Suspicious => "Suspicious activity reported",
        }
    }
}

/// Six-level severity scale, ordered from `None` to `Critical`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    #[default]
    None,
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::None => "none",
            ThreatLevel::Info => "info",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreatLevel {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ThreatLevel::None),
            "info" => Ok(ThreatLevel::Info),
            "low" => Ok(ThreatLevel::Low),
            "medium" => Ok(ThreatLevel::Medium),
            "high" => Ok(ThreatLevel::High),
            "critical" => Ok(ThreatLevel::Critical),
            _ => Err(ModelError::UnknownThreatLevel(s.to_string())),
        }
    }
}

/// EVM chain identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl ChainId {
    pub const ETHEREUM: ChainId = ChainId(1);

    /// Map a human chain name to its id; unknown names fall back to mainnet
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" => ChainId(1),
            "bsc" | "bnb" => ChainId(56),
            "polygon" | "matic" => ChainId(137),
            "arbitrum" => ChainId(42161),
            "optimism" => ChainId(10),
            "avalanche" | "avax" => ChainId(43114),
            "base" => ChainId(8453),
            _ => ChainId::ETHEREUM,
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        ChainId(id)
    }
}

/// What kind of entity a target reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    #[default]
    Contract,
    /// Externally-owned account
    Eoa,
    Project,
    Bytecode,
    Signature,
}

/// Aggregation key for a target: `chain:address`, address lowercased
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetKey(String);

impl TargetKey {
    pub fn new(chain_id: ChainId, address: &str) -> Self {
        TargetKey(format!("{}:{}", chain_id, address.trim().to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies what is at risk
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetRef {
    #[serde(rename = "type", default)]
    pub target_type: TargetType,
    #[serde(default)]
    pub chain_id: ChainId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl TargetRef {
    /// A contract target on the given chain
    pub fn contract(chain_id: u64, address: &str) -> Self {
        Self {
            target_type: TargetType::Contract,
            chain_id: ChainId(chain_id),
            address: Some(address.to_string()),
            name: None,
            hash: None,
        }
    }

    pub fn with_type(mut self, target_type: TargetType) -> Self {
        self.target_type = target_type;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Aggregation key, or `None` when the target carries no address
    pub fn key(&self) -> Option<TargetKey> {
        match self.address.as_deref().map(str::trim) {
            Some(address) if !address.is_empty() => Some(TargetKey::new(self.chain_id, address)),
            _ => None,
        }
    }
}

/// Supporting data attached to an event
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cve: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cvss: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tx_hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exploit_code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<String>,
}

/// A single normalized piece of threat intelligence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub id: String,
    pub source: FeedSource,
    #[serde(rename = "type")]
    pub event_type: ThreatEventType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub severity: ThreatLevel,
    #[serde(default)]
    pub targets: Vec<TargetRef>,
    #[serde(default)]
    pub evidence: Evidence,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Reporter confidence (0.0 - 1.0)
    pub confidence: f64,
    pub fetched_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
}

impl FeedEvent {
    pub fn builder(source: FeedSource, event_type: ThreatEventType, title: &str) -> FeedEventBuilder {
        FeedEventBuilder::new(source, event_type, title)
    }

    /// Content-derived identifier: same source, title and targets yield the same id
    pub fn content_id(source: FeedSource, title: &str, targets: &[TargetRef]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_str().as_bytes());
        hasher.update(title.as_bytes());
        for key in targets.iter().filter_map(TargetRef::key) {
            hasher.update(key.as_str().as_bytes());
        }
        format!("{}-{}", source, &format!("{:x}", hasher.finalize())[..16])
    }
}

/// Builder for feed events
pub struct FeedEventBuilder {
    id: Option<String>,
    source: FeedSource,
    event_type: ThreatEventType,
    title: String,
    description: String,
    severity: ThreatLevel,
    targets: Vec<TargetRef>,
    evidence: Evidence,
    tags: Vec<String>,
    confidence: f64,
    fetched_at: Option<DateTime<Utc>>,
    published_at: Option<DateTime<Utc>>,
    external_url: Option<String>,
}

impl FeedEventBuilder {
    pub fn new(source: FeedSource, event_type: ThreatEventType, title: &str) -> Self {
        Self {
            id: None,
            source,
            event_type,
            title: title.to_string(),
            description: String::new(),
            severity: ThreatLevel::Medium,
            targets: Vec::new(),
            evidence: Evidence::default(),
            tags: Vec::new(),
            confidence: 0.5,
            fetched_at: None,
            published_at: None,
            external_url: None,
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn severity(mut self, severity: ThreatLevel) -> Self {
        self.severity = severity;
        self
    }

    pub fn target(mut self, target: TargetRef) -> Self {
        self.targets.push(target);
        self
    }

    pub fn evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn fetched_at(mut self, at: DateTime<Utc>) -> Self {
        self.fetched_at = Some(at);
        self
    }

    pub fn published_at(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }

    pub fn external_url(mut self, url: &str) -> Self {
        self.external_url = Some(url.to_string());
        self
    }

    pub fn build(self) -> FeedEvent {
        let fetched_at = self.fetched_at.unwrap_or_else(Utc::now);
        let id = self
            .id
            .unwrap_or_else(|| FeedEvent::content_id(self.source, &self.title, &self.targets));

        FeedEvent {
            id,
            source: self.source,
            event_type: self.event_type,
            title: self.title,
            description: self.description,
            severity: self.severity,
            targets: self.targets,
            evidence: self.evidence,
            tags: self.tags,
            confidence: self.confidence,
            fetched_at,
            published_at: self.published_at.unwrap_or(fetched_at),
            external_url: self.external_url,
        }
    }
}
