//! Ledger access over Ethereum JSON-RPC
//!
//! [`LedgerClient`] is the seam the publisher depends on; [`ProviderLedger`]
//! implements it with an alloy HTTP provider.

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::TransactionRequest;
use alloy::transports::http::{Client, Http};
use alloy::transports::{RpcError, TransportError};
use async_trait::async_trait;
use reqwest::Url;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Errors talking to the ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Request timed out")]
    Timeout,
}

impl From<TransportError> for LedgerError {
    fn from(err: TransportError) -> Self {
        match err {
            RpcError::ErrorResp(payload) => LedgerError::Rpc {
                code: payload.code,
                message: payload.message.to_string(),
            },
            err @ (RpcError::DeserError { .. } | RpcError::NullResp) => LedgerError::Malformed(err.to_string()),
            err => LedgerError::Transport(err.to_string()),
        }
    }
}

/// Minimal ledger surface needed to publish and read risk scores
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, LedgerError>;

    /// Next nonce for `address`, counting pending transactions
    async fn pending_nonce(&self, address: Address) -> Result<u64, LedgerError>;

    async fn gas_price(&self) -> Result<u128, LedgerError>;

    /// Submit a signed transaction, returning its hash
    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, LedgerError>;

    /// Read-only call against the latest block
    async fn call(&self, to: Address, data: &[u8]) -> Result<Bytes, LedgerError>;

    /// Release connections; further calls may fail
    async fn close(&self) {}
}

/// Thread-safe ledger handle
pub type SharedLedger = Arc<dyn LedgerClient>;

/// Ledger client over an alloy HTTP provider
pub struct ProviderLedger {
    provider: RootProvider<Http<Client>>,
    endpoint: String,
    timeout: Duration,
}

impl ProviderLedger {
    /// Build a provider for `endpoint`; no request is made until first use
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let url = Url::parse(endpoint).map_err(|e| LedgerError::Transport(format!("{}: {}", endpoint, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(LedgerError::Transport(format!("unsupported endpoint: {}", endpoint)));
        }

        Ok(Self {
            provider: ProviderBuilder::new().on_http(url),
            endpoint: endpoint.to_string(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Await one RPC call under the per-request timeout
    async fn bounded<T, F>(&self, method: &str, call: F) -> Result<T, LedgerError>
    where
        F: IntoFuture<Output = Result<T, TransportError>>,
    {
        trace!("-> {}", method);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(LedgerError::from),
            Err(_) => Err(LedgerError::Timeout),
        }
    }
}

#[async_trait]
impl LedgerClient for ProviderLedger {
    async fn chain_id(&self) -> Result<u64, LedgerError> {
        self.bounded("eth_chainId", self.provider.get_chain_id()).await
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, LedgerError> {
        self.bounded("eth_getTransactionCount", self.provider.get_transaction_count(address).pending())
            .await
    }

    async fn gas_price(&self) -> Result<u128, LedgerError> {
        self.bounded("eth_gasPrice", self.provider.get_gas_price()).await
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, LedgerError> {
        let pending = self
            .bounded("eth_sendRawTransaction", self.provider.send_raw_transaction(raw))
            .await?;
        Ok(*pending.tx_hash())
    }

    async fn call(&self, to: Address, data: &[u8]) -> Result<Bytes, LedgerError> {
        let request = TransactionRequest::default()
            .with_to(to)
            .with_input(Bytes::copy_from_slice(data));
        self.bounded("eth_call", self.provider.call(&request)).await
    }
}
