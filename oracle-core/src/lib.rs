//! Threat Oracle Core - Threat intelligence model and signal aggregation
//!
//! This crate provides the foundational primitives:
//! - Normalized feed events and target references
//! - Aggregated per-target threat signals and on-chain update records
//! - The signal aggregator (weighting, decay, classification, pruning)
//! - Scanner findings and address helpers

pub mod events;
pub mod signals;
pub mod aggregator;
pub mod scanner;
pub mod address;

pub use events::*;
pub use signals::*;
pub use aggregator::*;
pub use scanner::*;
pub use address::*;

/// Signals at or above this score are high risk
pub const HIGH_RISK_SCORE: u8 = aggregator::HIGH_SCORE;

/// Signals at or above this score are critical
pub const CRITICAL_RISK_SCORE: u8 = aggregator::CRITICAL_SCORE;

/// Minimum score for a signal to be published on-chain by default
pub const DEFAULT_PUBLISH_THRESHOLD: u8 = 50;
