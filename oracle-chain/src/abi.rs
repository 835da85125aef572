//! ThreatOracle contract interface
//!
//! Calldata builders for the four functions the publisher and readers use,
//! plus return-data decoding for the two view functions.

use alloy::primitives::{Address, B256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};

use crate::LedgerError;

sol! {
    interface IThreatOracle {
        function updateRiskScore(address target, uint8 score) external;
        function batchUpdateRiskScores(address[] targets, uint8[] scores) external;
        function getRiskScore(address target) external view returns (uint8);
        function getLastUpdate(address target) external view returns (uint256);

        event RiskUpdated(address indexed target, uint8 riskScore, uint256 timestamp);
    }
}

/// Topic 0 of `RiskUpdated` logs
pub const RISK_UPDATED_TOPIC: B256 = IThreatOracle::RiskUpdated::SIGNATURE_HASH;

pub fn update_risk_score_calldata(target: Address, score: u8) -> Vec<u8> {
    IThreatOracle::updateRiskScoreCall { target, score }.abi_encode()
}

/// `targets` and `scores` must be the same length
pub fn batch_update_calldata(targets: Vec<Address>, scores: Vec<u8>) -> Vec<u8> {
    debug_assert_eq!(targets.len(), scores.len());
    IThreatOracle::batchUpdateRiskScoresCall { targets, scores }.abi_encode()
}

pub fn get_risk_score_calldata(target: Address) -> Vec<u8> {
    IThreatOracle::getRiskScoreCall { target }.abi_encode()
}

pub fn get_last_update_calldata(target: Address) -> Vec<u8> {
    IThreatOracle::getLastUpdateCall { target }.abi_encode()
}

/// First return word, checked to be exactly 32 bytes or more
fn first_word(data: &[u8]) -> Result<&[u8; 32], LedgerError> {
    data.get(..32)
        .and_then(|word| word.try_into().ok())
        .ok_or_else(|| LedgerError::Malformed(format!("expected a 32-byte return word, got {} bytes", data.len())))
}

/// Decode a `uint8` return value
pub fn decode_uint8(data: &[u8]) -> Result<u8, LedgerError> {
    let word = first_word(data)?;
    if word[..31].iter().any(|b| *b != 0) {
        return Err(LedgerError::Malformed("uint8 return value out of range".to_string()));
    }
    Ok(word[31])
}

/// Decode a `uint256` return value that must fit a `u64` (timestamps)
pub fn decode_u64_word(data: &[u8]) -> Result<u64, LedgerError> {
    let word = first_word(data)?;
    if word[..24].iter().any(|b| *b != 0) {
        return Err(LedgerError::Malformed("uint256 return value exceeds u64".to_string()));
    }
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&word[24..]);
    Ok(u64::from_be_bytes(tail))
}
