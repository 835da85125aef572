//! Transaction signing with a local secp256k1 key
//!
//! Wraps alloy's [`PrivateKeySigner`] in an [`EthereumWallet`] and turns fully
//! specified transaction requests into raw EIP-2718 bytes for
//! `eth_sendRawTransaction`.

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{hex, keccak256, Address, Bytes, B256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use std::fmt;
use thiserror::Error;

/// Errors from key handling and signing
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Raw signed transaction ready for `eth_sendRawTransaction`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Bytes,
    pub hash: B256,
}

/// Key that signs the oracle's transactions
pub struct TransactionSigner {
    wallet: EthereumWallet,
    address: Address,
}

impl TransactionSigner {
    /// Parse a 32-byte hex key, with or without `0x`
    pub fn from_hex(private_key: &str) -> Result<Self, SignerError> {
        let trimmed = private_key.trim();
        let stripped = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(stripped).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(SignerError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())));
        }

        let signer = PrivateKeySigner::from_slice(&bytes).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let address = signer.address();
        Ok(Self {
            wallet: EthereumWallet::from(signer),
            address,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign a request that already carries nonce, gas price, gas limit and chain id
    pub async fn sign(&self, request: TransactionRequest) -> Result<SignedTransaction, SignerError> {
        let envelope = request
            .build(&self.wallet)
            .await
            .map_err(|e| SignerError::Signing(e.to_string()))?;

        let raw = envelope.encoded_2718();
        Ok(SignedTransaction {
            hash: keccak256(&raw),
            raw: raw.into(),
        })
    }
}

impl fmt::Debug for TransactionSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionSigner").field("address", &self.address).finish_non_exhaustive()
    }
}
