//! Findings produced by the platform's own contract scanners

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChainId, ThreatEventType, ThreatLevel};

/// Vulnerability classes reported by the scanners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VulnType {
    Reentrancy,
    IntegerOverflow,
    IntegerUnderflow,
    AccessControl,
    UncheckedExternalCall,
    TxOrigin,
    TimestampDependency,
    Frontrunning,
    FlashLoanAttack,
    OracleManipulation,
    RugPull,
    Phishing,
    #[serde(other)]
    Other,
}

impl VulnType {
    /// Threat event category a finding of this class feeds into
    pub fn event_type(&self) -> ThreatEventType {
        match self {
            VulnType::Reentrancy => ThreatEventType::Exploit,
            VulnType::FlashLoanAttack => ThreatEventType::FlashLoan,
            VulnType::OracleManipulation => ThreatEventType::OracleManip,
            VulnType::RugPull => ThreatEventType::RugPull,
            VulnType::Phishing => ThreatEventType::Phishing,
            _ => ThreatEventType::Vulnerability,
        }
    }
}

/// A scanner finding against one contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    /// Address of the affected contract
    pub contract: String,
    #[serde(default)]
    pub chain_id: ChainId,
    #[serde(rename = "type")]
    pub vuln_type: VulnType,
    pub severity: ThreatLevel,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwe: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub detected_by: String,
    pub detected_at: DateTime<Utc>,
}

impl Vulnerability {
    pub fn new(
        contract: &str,
        chain_id: ChainId,
        vuln_type: VulnType,
        severity: ThreatLevel,
        title: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            contract: contract.to_string(),
            chain_id,
            vuln_type,
            severity,
            title: title.to_string(),
            description: String::new(),
            cwe: None,
            confidence: 0.7,
            detected_by: String::new(),
            detected_at: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_cwe(mut self, cwe: &str) -> Self {
        self.cwe = Some(cwe.to_string());
        self
    }
}
