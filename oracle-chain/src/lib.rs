//! Threat Oracle Chain - on-chain publishing layer
//!
//! Provides:
//! - The ThreatOracle contract ABI and calldata helpers
//! - Transaction signing with a local key
//! - An alloy provider-backed ledger client behind the [`LedgerClient`] trait
//! - The rate-limited, batching [`Publisher`] and a read-only [`ContractReader`]

pub mod abi;
pub mod signer;
pub mod rpc;
pub mod reader;
pub mod publisher;

pub use abi::RISK_UPDATED_TOPIC;
pub use signer::*;
pub use rpc::*;
pub use reader::*;
pub use publisher::*;

pub use alloy::primitives::Address;
