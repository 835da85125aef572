//! Threat Oracle Runtime
//!
//! Wires feeds, the aggregator and the publisher into a running service:
//! - **OracleService**: background poll / publish / prune loops and the query API
//! - **SignalStorage**: persistence seam, with an in-memory implementation
//! - **OracleConfig**: TOML configuration and validation

pub mod config;
pub mod storage;
pub mod service;

pub use config::*;
pub use storage::*;
pub use service::*;
