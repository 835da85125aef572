//! Persistence for events, signals and publish records
//!
//! The service only depends on [`SignalStorage`]. [`MemoryStorage`] keeps
//! everything in process and is what tests and the CLI simulator use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

use oracle_core::{FeedEvent, SignalUpdate, TargetKey, TargetRef, ThreatSignal};

/// Signals kept per target by [`MemoryStorage`]
pub const MAX_SIGNAL_HISTORY: usize = 256;

/// Errors from a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Durable record of what the oracle saw, derived and published
#[async_trait]
pub trait SignalStorage: Send + Sync {
    /// Saving an event with a known id replaces it
    async fn save_feed_event(&self, event: &FeedEvent) -> Result<(), StorageError>;

    async fn save_signal(&self, signal: &ThreatSignal) -> Result<(), StorageError>;

    async fn save_signal_update(&self, update: &SignalUpdate) -> Result<(), StorageError>;

    /// Events fetched at or after `since`, oldest first
    async fn get_recent_events(&self, since: DateTime<Utc>) -> Result<Vec<FeedEvent>, StorageError>;

    /// Signals computed for `target`, newest first
    async fn get_signal_history(&self, target: &TargetRef, limit: usize) -> Result<Vec<ThreatSignal>, StorageError>;
}

/// Thread-safe storage handle
pub type SharedStorage = Arc<dyn SignalStorage>;

/// In-process storage
#[derive(Default)]
pub struct MemoryStorage {
    events: DashMap<String, FeedEvent>,
    /// Oldest first
    signals: DashMap<TargetKey, Vec<ThreatSignal>>,
    updates: DashMap<TargetKey, Vec<SignalUpdate>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Publish records for one target, in save order
    pub fn updates_for(&self, key: &TargetKey) -> Vec<SignalUpdate> {
        self.updates.get(key).map(|u| u.clone()).unwrap_or_default()
    }

    pub fn update_count(&self) -> usize {
        self.updates.iter().map(|entry| entry.value().len()).sum()
    }
}

#[async_trait]
impl SignalStorage for MemoryStorage {
    async fn save_feed_event(&self, event: &FeedEvent) -> Result<(), StorageError> {
        if event.id.is_empty() {
            return Err(StorageError::InvalidRecord("event without id".to_string()));
        }
        self.events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn save_signal(&self, signal: &ThreatSignal) -> Result<(), StorageError> {
        let key = signal
            .key()
            .ok_or_else(|| StorageError::InvalidRecord("signal target has no address".to_string()))?;

        let mut history = self.signals.entry(key).or_default();
        history.push(signal.clone());
        if history.len() > MAX_SIGNAL_HISTORY {
            let excess = history.len() - MAX_SIGNAL_HISTORY;
            history.drain(..excess);
        }
        Ok(())
    }

    async fn save_signal_update(&self, update: &SignalUpdate) -> Result<(), StorageError> {
        self.updates.entry(update.key()).or_default().push(update.clone());
        Ok(())
    }

    async fn get_recent_events(&self, since: DateTime<Utc>) -> Result<Vec<FeedEvent>, StorageError> {
        let mut events: Vec<FeedEvent> = self
            .events
            .iter()
            .filter(|entry| entry.value().fetched_at >= since)
            .map(|entry| entry.value().clone())
            .collect();
        events.sort_by(|a, b| a.fetched_at.cmp(&b.fetched_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn get_signal_history(&self, target: &TargetRef, limit: usize) -> Result<Vec<ThreatSignal>, StorageError> {
        let key = target
            .key()
            .ok_or_else(|| StorageError::InvalidRecord("target has no address".to_string()))?;

        Ok(self
            .signals
            .get(&key)
            .map(|history| history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
