//! Aggregated risk signals and their on-chain publication records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChainId, FeedSource, TargetKey, TargetRef, ThreatLevel};

/// Current aggregated risk for one target
///
/// Always derived from the target's retained event history; a new signal
/// replaces the previous one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatSignal {
    pub target: TargetRef,
    /// 0 - 100
    pub risk_score: u8,
    pub threat_level: ThreatLevel,
    /// 0.0 - 1.0
    pub confidence: f64,
    /// Distinct contributing sources, in source order
    pub sources: Vec<FeedSource>,
    pub event_count: usize,
    pub latest_event_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub event_ids: Vec<String>,
    pub summary_reason: String,
    pub updated_at: DateTime<Utc>,
}

impl ThreatSignal {
    pub fn key(&self) -> Option<TargetKey> {
        self.target.key()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

/// Lifecycle of an on-chain update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

/// Instruction to write one target's score on-chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalUpdate {
    pub target_address: String,
    pub chain_id: ChainId,
    pub risk_score: u8,
    pub reason: String,
    /// Sender nonce of the carrying transaction, once submitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub status: PublishStatus,
}

impl SignalUpdate {
    /// A pending update carrying the signal's current score
    pub fn pending(signal: &ThreatSignal, timestamp: DateTime<Utc>) -> Self {
        Self {
            target_address: signal.target.address.clone().unwrap_or_default(),
            chain_id: signal.target.chain_id,
            risk_score: signal.risk_score,
            reason: signal.summary_reason.clone(),
            nonce: None,
            timestamp,
            tx_hash: None,
            status: PublishStatus::Pending,
        }
    }

    pub fn key(&self) -> TargetKey {
        TargetKey::new(self.chain_id, &self.target_address)
    }

    /// Mark as carried by a submitted transaction
    pub fn submitted(mut self, tx_hash: &str, nonce: u64) -> Self {
        self.tx_hash = Some(tx_hash.to_string());
        self.nonce = Some(nonce);
        self.status = PublishStatus::Submitted;
        self
    }
}
