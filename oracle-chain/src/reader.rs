//! Read-only access to the deployed ThreatOracle contract

use alloy::primitives::Address;
use chrono::{DateTime, Utc};

use crate::abi::{decode_u64_word, decode_uint8, get_last_update_calldata, get_risk_score_calldata};
use crate::{LedgerError, SharedLedger};

/// View-function reader; needs no signing key
#[derive(Clone)]
pub struct ContractReader {
    ledger: SharedLedger,
    contract: Address,
}

impl ContractReader {
    pub fn new(ledger: SharedLedger, contract: Address) -> Self {
        Self { ledger, contract }
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    /// `getRiskScore(target)`
    pub async fn risk_score(&self, target: Address) -> Result<u8, LedgerError> {
        let data = self.ledger.call(self.contract, &get_risk_score_calldata(target)).await?;
        decode_uint8(&data)
    }

    /// `getLastUpdate(target)`; `None` when the target was never written
    pub async fn last_update(&self, target: Address) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let data = self.ledger.call(self.contract, &get_last_update_calldata(target)).await?;
        let secs = decode_u64_word(&data)?;
        if secs == 0 {
            return Ok(None);
        }
        let secs = i64::try_from(secs).map_err(|_| LedgerError::Malformed(format!("timestamp {} out of range", secs)))?;
        DateTime::from_timestamp(secs, 0)
            .map(Some)
            .ok_or_else(|| LedgerError::Malformed(format!("timestamp {} out of range", secs)))
    }
}
