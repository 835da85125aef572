//! Oracle Service
//!
//! Owns one aggregator, an optional publisher and the registered feeds, and
//! drives them with three independent background loops:
//! - **poll**: fetch every feed, persist, aggregate, queue high-risk signals
//! - **publish**: flush the publisher's queue
//! - **prune**: drop events past the retention window
//!
//! Every loop watches one shared shutdown signal. `stop` raises it, waits for
//! each loop to exit and then closes the publisher.

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use oracle_chain::{FlushReport, PublishError, PublishReceipt, Publisher, PublisherStats};
use oracle_core::{
    Aggregator, AggregatorStats, ChainId, FeedEvent, SignalUpdate, TargetRef, ThreatSignal, Vulnerability,
    CRITICAL_RISK_SCORE, HIGH_RISK_SCORE,
};
use oracle_feeds::{create_json_feed, FeedError, InternalFeed, SharedFeed, ThreatFeed};

use crate::{ConfigError, OracleConfig, ServiceConfig, SharedStorage, StorageError};

/// Errors from the service surface
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service already started")]
    AlreadyStarted,

    #[error("Service has been stopped")]
    Stopped,

    #[error("No publisher configured")]
    NoPublisher,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Lifecycle of the background loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::NotStarted => "not-started",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outcome of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub events: usize,
    pub feed_failures: usize,
    pub updated_signals: usize,
    pub queued: usize,
}

/// Service diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub state: ServiceState,
    pub feeds: usize,
    pub pending_findings: usize,
    pub aggregator: AggregatorStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<PublisherStats>,
}

/// State shared between the service handle and its loops
struct ServiceCore {
    config: ServiceConfig,
    aggregator: Aggregator,
    publisher: Option<Arc<Publisher>>,
    storage: SharedStorage,
    internal_feed: Arc<InternalFeed>,
    feeds: RwLock<Vec<SharedFeed>>,
    /// One poll cycle at a time
    poll_lock: tokio::sync::Mutex<()>,
}

struct FetchOutcome {
    events: Vec<FeedEvent>,
    failures: usize,
}

impl ServiceCore {
    /// Fetch every feed concurrently under one deadline
    async fn fetch_all(&self) -> FetchOutcome {
        let feeds = self.feeds.read().clone();
        let started = Utc::now();
        let deadline = Instant::now() + self.config.fetch_timeout();

        let results = join_all(feeds.iter().map(|feed| async move {
            match timeout_at(deadline, feed.fetch(deadline)).await {
                Ok(result) => result,
                Err(_) => Err(FeedError::Timeout),
            }
        }))
        .await;

        let mut outcome = FetchOutcome {
            events: Vec::new(),
            failures: 0,
        };
        for (feed, result) in feeds.iter().zip(results) {
            match result {
                Ok(events) => {
                    debug!("Feed {} returned {} events", feed.name(), events.len());
                    feed.set_last_fetch_time(started);
                    outcome.events.extend(events);
                }
                Err(e) => {
                    warn!("Feed {} failed: {}", feed.name(), e);
                    outcome.failures += 1;
                }
            }
        }
        outcome
    }

    /// Persist, aggregate and queue one tick's events
    async fn ingest(&self, fetched: FetchOutcome) -> TickSummary {
        let mut summary = TickSummary {
            events: fetched.events.len(),
            feed_failures: fetched.failures,
            ..Default::default()
        };

        for event in &fetched.events {
            if let Err(e) = self.storage.save_feed_event(event).await {
                warn!("Failed to persist event {}: {}", event.id, e);
            }
        }

        let updated = self.aggregator.process_events(fetched.events);
        summary.updated_signals = updated.len();

        for signal in &updated {
            if let Err(e) = self.storage.save_signal(signal).await {
                warn!("Failed to persist signal: {}", e);
            }
        }

        if let Some(publisher) = &self.publisher {
            for signal in updated.iter().filter(|s| s.risk_score >= self.config.publish_threshold) {
                match publisher.queue_update(signal) {
                    Ok(()) => summary.queued += 1,
                    Err(e) if e.is_policy_rejection() => debug!("Update not queued: {}", e),
                    Err(e) => warn!("Failed to queue update: {}", e),
                }
            }
        }

        summary
    }

    async fn poll_once(&self) -> TickSummary {
        let _tick = self.poll_lock.lock().await;
        let fetched = self.fetch_all().await;
        self.ingest(fetched).await
    }

    async fn save_updates(&self, updates: &[SignalUpdate]) {
        for update in updates {
            if let Err(e) = self.storage.save_signal_update(update).await {
                warn!("Failed to persist update for {}: {}", update.target_address, e);
            }
        }
    }

    async fn flush(&self) -> Option<FlushReport> {
        let publisher = self.publisher.as_ref()?;
        let report = publisher.flush_queue().await;
        self.save_updates(&report.submitted).await;

        match &report.error {
            Some(e) if e.is_policy_rejection() => {
                debug!("Flush published {} updates, rest deferred: {}", report.published, e)
            }
            Some(e) => warn!("Flush published {} updates before failing: {}", report.published, e),
            None if report.published > 0 => info!("Published {} risk updates", report.published),
            None => debug!("Publish queue empty"),
        }
        Some(report)
    }
}

async fn poll_loop(core: Arc<ServiceCore>, mut shutdown: watch::Receiver<bool>) {
    // First tick fires immediately
    let mut ticker = interval(core.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let _tick = core.poll_lock.lock().await;
        // Fetches are abandoned on shutdown; aggregation never is
        let fetched = tokio::select! {
            fetched = core.fetch_all() => fetched,
            _ = shutdown.changed() => {
                debug!("Poll tick abandoned");
                break;
            }
        };

        let summary = core.ingest(fetched).await;
        info!(
            "Poll: {} events, {} feed failures, {} signals updated, {} queued",
            summary.events, summary.feed_failures, summary.updated_signals, summary.queued
        );
    }

    debug!("Poll loop stopped");
}

async fn publish_loop(core: Arc<ServiceCore>, mut shutdown: watch::Receiver<bool>) {
    let period = core.config.publish_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        core.flush().await;
    }

    debug!("Publish loop stopped");
}

async fn prune_loop(core: Arc<ServiceCore>, mut shutdown: watch::Receiver<bool>) {
    let period = core.config.prune_interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let removed = core.aggregator.prune_old_events();
        if removed > 0 {
            info!("Pruned {} stale events", removed);
        }
    }

    debug!("Prune loop stopped");
}

/// The threat oracle service
pub struct OracleService {
    core: Arc<ServiceCore>,
    state: Mutex<ServiceState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OracleService {
    /// Build from configuration, connecting the publisher when one is configured
    pub async fn new(config: OracleConfig, storage: SharedStorage) -> Result<Self, ServiceError> {
        config.validate()?;

        let publisher = match &config.publisher {
            Some(publisher_config) => Some(Arc::new(Publisher::connect(publisher_config.clone()).await?)),
            None => {
                info!("No publisher configured, running read-only");
                None
            }
        };

        Self::with_publisher(config, storage, publisher)
    }

    /// Build around a ready publisher; `config.publisher` is ignored
    pub fn with_publisher(
        config: OracleConfig,
        storage: SharedStorage,
        publisher: Option<Arc<Publisher>>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let internal_feed = Arc::new(InternalFeed::new());
        let mut feeds: Vec<SharedFeed> = vec![internal_feed.clone() as SharedFeed];
        for feed_config in config.feeds {
            if !feed_config.enabled {
                info!("Feed {} is disabled", feed_config.source);
                continue;
            }
            feeds.push(create_json_feed(feed_config)?);
        }

        let core = ServiceCore {
            aggregator: Aggregator::with_weights(config.aggregation, config.source_weights),
            config: config.service,
            publisher,
            storage,
            internal_feed,
            feeds: RwLock::new(feeds),
            poll_lock: tokio::sync::Mutex::new(()),
        };

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            core: Arc::new(core),
            state: Mutex::new(ServiceState::NotStarted),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register a feed; picked up by the next poll
    pub fn add_feed(&self, feed: SharedFeed) {
        let mut feeds = self.core.feeds.write();
        info!("Registered feed {}", feed.name());
        feeds.push(feed);
    }

    pub fn feed_count(&self) -> usize {
        self.core.feeds.read().len()
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.core.config
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.core.aggregator
    }

    pub fn publisher(&self) -> Option<&Arc<Publisher>> {
        self.core.publisher.as_ref()
    }

    fn check_startable(state: ServiceState) -> Result<(), ServiceError> {
        match state {
            ServiceState::NotStarted => Ok(()),
            ServiceState::Running => Err(ServiceError::AlreadyStarted),
            ServiceState::Stopping | ServiceState::Stopped => Err(ServiceError::Stopped),
        }
    }

    /// Launch the background loops; the first poll runs immediately
    pub async fn start(&self) -> Result<(), ServiceError> {
        Self::check_startable(self.state())?;

        if self.core.config.restore_on_start {
            match self.restore_from_storage().await {
                Ok(count) => info!("Restored {} stored events", count),
                Err(e) => warn!("Failed to restore from storage: {}", e),
            }
        }

        let mut state = self.state.lock();
        Self::check_startable(*state)?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(poll_loop(Arc::clone(&self.core), self.shutdown.subscribe())));
        tasks.push(tokio::spawn(publish_loop(Arc::clone(&self.core), self.shutdown.subscribe())));
        tasks.push(tokio::spawn(prune_loop(Arc::clone(&self.core), self.shutdown.subscribe())));
        *state = ServiceState::Running;

        info!(
            "Oracle service started: {} feeds, poll every {:?}, publish every {:?}, publisher {}",
            self.core.feeds.read().len(),
            self.core.config.poll_interval(),
            self.core.config.publish_interval(),
            if self.core.publisher.is_some() { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Stop the loops, wait for them to exit and close the publisher
    ///
    /// Queued updates stay in memory. Calling stop again is a no-op.
    pub async fn stop(&self) {
        let was_running = {
            let mut state = self.state.lock();
            match *state {
                ServiceState::Running => {
                    *state = ServiceState::Stopping;
                    true
                }
                ServiceState::NotStarted => {
                    *state = ServiceState::Stopping;
                    false
                }
                ServiceState::Stopping | ServiceState::Stopped => return,
            }
        };

        if was_running {
            info!("Stopping oracle service");
            self.shutdown.send_replace(true);
            let tasks = std::mem::take(&mut *self.tasks.lock());
            for task in tasks {
                if let Err(e) = task.await {
                    warn!("Service loop ended abnormally: {}", e);
                }
            }
        }

        if let Some(publisher) = &self.core.publisher {
            publisher.close().await;
        }

        *self.state.lock() = ServiceState::Stopped;
        info!("Oracle service stopped");
    }

    /// Run one poll cycle now, serialized with the poll loop
    pub async fn poll_now(&self) -> TickSummary {
        self.core.poll_once().await
    }

    /// Flush the publisher's queue now
    pub async fn flush_now(&self) -> Result<FlushReport, ServiceError> {
        self.core.flush().await.ok_or(ServiceError::NoPublisher)
    }

    pub fn get_signal(&self, chain_id: ChainId, address: &str) -> Option<ThreatSignal> {
        self.core.aggregator.get_signal(chain_id, address)
    }

    /// Signals at or above `min_score`, highest first
    pub fn get_signals(&self, min_score: u8) -> Vec<ThreatSignal> {
        self.core.aggregator.get_all_signals(min_score)
    }

    pub fn get_high_risk_targets(&self) -> Vec<ThreatSignal> {
        self.get_signals(HIGH_RISK_SCORE)
    }

    pub fn get_critical_targets(&self) -> Vec<ThreatSignal> {
        self.get_signals(CRITICAL_RISK_SCORE)
    }

    /// Queue scanner findings for the next poll
    pub fn ingest_scanner_results(&self, vulns: Vec<Vulnerability>) {
        let count = vulns.len();
        self.core.internal_feed.add_vulnerabilities(vulns);
        debug!("Queued {} scanner findings", count);
    }

    /// Publish immediately, bypassing the queue but not the rate limit
    pub async fn force_publish(&self, signal: &ThreatSignal) -> Result<PublishReceipt, ServiceError> {
        let publisher = self.core.publisher.as_ref().ok_or(ServiceError::NoPublisher)?;
        let receipt = publisher.publish(signal).await?;
        self.core.save_updates(&receipt.updates).await;
        Ok(receipt)
    }

    /// Replay stored events from the retention window into the aggregator
    ///
    /// Nothing is queued for publishing. Returns the number of events replayed.
    pub async fn restore_from_storage(&self) -> Result<usize, ServiceError> {
        let since = Utc::now() - self.core.aggregator.thresholds().retention_window();
        let events = self.core.storage.get_recent_events(since).await?;
        let count = events.len();
        let signals = self.core.aggregator.process_events(events);
        debug!("Replayed {} events into {} signals", count, signals.len());
        Ok(count)
    }

    /// Stored signals for `target`, newest first
    pub async fn signal_history(&self, target: &TargetRef, limit: usize) -> Result<Vec<ThreatSignal>, ServiceError> {
        Ok(self.core.storage.get_signal_history(target, limit).await?)
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            state: self.state(),
            feeds: self.feed_count(),
            pending_findings: self.core.internal_feed.pending_count(),
            aggregator: self.core.aggregator.stats(),
            publisher: self.core.publisher.as_ref().map(|p| p.stats()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;
    use crate::SignalStorage;
    use alloy::primitives::{keccak256, Address, Bytes, B256};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use oracle_chain::{LedgerClient, LedgerError, PublisherConfig};
    use oracle_core::{FeedSource, TargetKey, ThreatEventType, ThreatLevel, VulnType};
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const CONTRACT: &str = "0x00000000000000000000000000000000000000c0";
    const HOT: &str = "0x00000000000000000000000000000000000000aa";
    const COLD: &str = "0x00000000000000000000000000000000000000bb";

    /// Hands out its events once, then nothing
    struct StaticFeed {
        source: FeedSource,
        events: Mutex<Vec<FeedEvent>>,
        fetches: AtomicUsize,
        last_fetch: Mutex<Option<DateTime<Utc>>>,
    }

    impl StaticFeed {
        fn new(source: FeedSource, events: Vec<FeedEvent>) -> Arc<Self> {
            Arc::new(Self {
                source,
                events: Mutex::new(events),
                fetches: AtomicUsize::new(0),
                last_fetch: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ThreatFeed for StaticFeed {
        fn source(&self) -> FeedSource {
            self.source
        }

        async fn fetch(&self, _deadline: Instant) -> Result<Vec<FeedEvent>, FeedError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(std::mem::take(&mut *self.events.lock()))
        }

        fn set_last_fetch_time(&self, at: DateTime<Utc>) {
            *self.last_fetch.lock() = Some(at);
        }
    }

    struct BrokenFeed;

    #[async_trait]
    impl ThreatFeed for BrokenFeed {
        fn source(&self) -> FeedSource {
            FeedSource::ChainAbuse
        }

        async fn fetch(&self, _deadline: Instant) -> Result<Vec<FeedEvent>, FeedError> {
            Err(FeedError::Network("connection refused".to_string()))
        }

        fn set_last_fetch_time(&self, _at: DateTime<Utc>) {}
    }

    /// Never answers within the deadline
    struct StalledFeed;

    #[async_trait]
    impl ThreatFeed for StalledFeed {
        fn source(&self) -> FeedSource {
            FeedSource::SlowMist
        }

        async fn fetch(&self, _deadline: Instant) -> Result<Vec<FeedEvent>, FeedError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }

        fn set_last_fetch_time(&self, _at: DateTime<Utc>) {}
    }

    #[derive(Default)]
    struct CountingLedger {
        nonce: AtomicU64,
        sends: AtomicUsize,
        closed: AtomicBool,
    }

    #[async_trait]
    impl LedgerClient for CountingLedger {
        async fn chain_id(&self) -> Result<u64, LedgerError> {
            Ok(1)
        }

        async fn pending_nonce(&self, _address: Address) -> Result<u64, LedgerError> {
            Ok(self.nonce.load(Ordering::SeqCst))
        }

        async fn gas_price(&self) -> Result<u128, LedgerError> {
            Ok(1_000_000_000)
        }

        async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, LedgerError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.nonce.fetch_add(1, Ordering::SeqCst);
            Ok(keccak256(raw))
        }

        async fn call(&self, _to: Address, _data: &[u8]) -> Result<Bytes, LedgerError> {
            Ok(Bytes::from(vec![0u8; 32]))
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn event(source: FeedSource, address: &str, severity: ThreatLevel, confidence: f64) -> FeedEvent {
        FeedEvent::builder(source, ThreatEventType::Exploit, &format!("{} report", source))
            .severity(severity)
            .target(TargetRef::contract(1, address))
            .confidence(confidence)
            .build()
    }

    fn quick_config() -> OracleConfig {
        let mut config = OracleConfig::default();
        config.service.poll_interval_secs = 3600;
        config.service.publish_interval_secs = 3600;
        config.service.fetch_timeout_secs = 1;
        config
    }

    fn read_only(config: OracleConfig) -> (OracleService, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let service = OracleService::with_publisher(config, storage.clone(), None).unwrap();
        (service, storage)
    }

    fn publishing(config: OracleConfig) -> (OracleService, Arc<MemoryStorage>, Arc<CountingLedger>) {
        let ledger = Arc::new(CountingLedger::default());
        let publisher = Publisher::with_ledger(PublisherConfig::new("http://127.0.0.1:8545", CONTRACT, KEY), ledger.clone())
            .unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let service = OracleService::with_publisher(config, storage.clone(), Some(Arc::new(publisher))).unwrap();
        (service, storage, ledger)
    }

    #[tokio::test]
    async fn test_poll_skips_failing_feeds() {
        let (service, storage) = read_only(quick_config());
        let forta = StaticFeed::new(FeedSource::Forta, vec![event(FeedSource::Forta, HOT, ThreatLevel::High, 0.9)]);
        service.add_feed(forta.clone());
        service.add_feed(Arc::new(BrokenFeed));

        let summary = service.poll_now().await;
        assert_eq!(summary.events, 1);
        assert_eq!(summary.feed_failures, 1);
        assert_eq!(summary.updated_signals, 1);
        assert_eq!(summary.queued, 0);

        // 0.8 * 0.9 * 100 + 10, less a few milliseconds of decay
        let signal = service.get_signal(ChainId(1), HOT).unwrap();
        assert!((81..=82).contains(&signal.risk_score));
        assert_eq!(signal.threat_level, ThreatLevel::High);

        assert_eq!(storage.event_count(), 1);
        assert_eq!(
            service.signal_history(&TargetRef::contract(1, HOT), 10).await.unwrap().len(),
            1
        );
        assert!(forta.last_fetch.lock().is_some());
    }

    #[tokio::test]
    async fn test_stalled_feed_hits_the_deadline() {
        let (service, _) = read_only(quick_config());
        service.add_feed(Arc::new(StalledFeed));
        service.add_feed(StaticFeed::new(
            FeedSource::Nvd,
            vec![event(FeedSource::Nvd, HOT, ThreatLevel::Medium, 0.6)],
        ));

        let summary = tokio::time::timeout(Duration::from_secs(10), service.poll_now())
            .await
            .unwrap();
        assert_eq!(summary.feed_failures, 1);
        assert_eq!(summary.events, 1);
    }

    #[tokio::test]
    async fn test_only_scores_over_threshold_are_queued() {
        let (service, storage, ledger) = publishing(quick_config());
        service.add_feed(StaticFeed::new(
            FeedSource::Forta,
            vec![event(FeedSource::Forta, HOT, ThreatLevel::High, 0.9)],
        ));
        // 0.6 * 0.4 * 100 + 10 = 34
        service.add_feed(StaticFeed::new(
            FeedSource::GitHub,
            vec![event(FeedSource::GitHub, COLD, ThreatLevel::Low, 0.4)],
        ));

        let summary = service.poll_now().await;
        assert_eq!(summary.updated_signals, 2);
        assert_eq!(summary.queued, 1);

        let pending = service.publisher().unwrap().pending_updates();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target_address, HOT);

        let report = service.flush_now().await.unwrap();
        assert_eq!(report.published, 1);
        assert!(report.error.is_none());
        assert_eq!(ledger.sends.load(Ordering::SeqCst), 1);

        let saved = storage.updates_for(&TargetKey::new(ChainId(1), HOT));
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].risk_score, service.get_signal(ChainId(1), HOT).unwrap().risk_score);
        assert!(saved[0].tx_hash.is_some());
    }

    #[tokio::test]
    async fn test_rate_limited_signal_is_not_requeued() {
        let (service, _, _) = publishing(quick_config());
        let forta = StaticFeed::new(FeedSource::Forta, vec![event(FeedSource::Forta, HOT, ThreatLevel::High, 0.9)]);
        service.add_feed(forta.clone());

        service.poll_now().await;
        service.flush_now().await.unwrap();

        forta.events.lock().push(event(FeedSource::Forta, HOT, ThreatLevel::Critical, 0.95));
        let summary = service.poll_now().await;
        assert_eq!(summary.updated_signals, 1);
        assert_eq!(summary.queued, 0);
    }

    #[tokio::test]
    async fn test_scanner_findings_arrive_on_next_poll() {
        let (service, _) = read_only(quick_config());
        let finding = Vulnerability::new(HOT, ChainId(1), VulnType::Reentrancy, ThreatLevel::Critical, "reentrant withdraw")
            .with_confidence(0.9);

        service.ingest_scanner_results(vec![finding]);
        assert!(service.get_signal(ChainId(1), HOT).is_none());
        assert_eq!(service.stats().pending_findings, 1);

        service.poll_now().await;
        let signal = service.get_signal(ChainId(1), HOT).unwrap();
        assert_eq!(signal.sources, vec![FeedSource::Internal]);
        assert_eq!(service.stats().pending_findings, 0);
    }

    #[tokio::test]
    async fn test_risk_queries_use_score_thresholds() {
        let (service, _) = read_only(quick_config());
        let a = "0x0000000000000000000000000000000000000001";
        let b = "0x0000000000000000000000000000000000000002";
        let c = "0x0000000000000000000000000000000000000003";
        service.add_feed(StaticFeed::new(
            FeedSource::Nvd,
            vec![
                // 0.9 * 1.0 * 100 + 10, clamped
                event(FeedSource::Nvd, a, ThreatLevel::Critical, 1.0),
                // 0.9 * 0.7 * 100 + 10 = 73
                event(FeedSource::Nvd, b, ThreatLevel::High, 0.7),
                // 0.9 * 0.4 * 100 + 10 = 46
                event(FeedSource::Nvd, c, ThreatLevel::Medium, 0.4),
            ],
        ));
        service.poll_now().await;

        let critical = service.get_critical_targets();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].target.address.as_deref(), Some(a));
        assert_eq!(critical[0].threat_level, ThreatLevel::Critical);

        let high: Vec<_> = service
            .get_high_risk_targets()
            .into_iter()
            .filter_map(|s| s.target.address)
            .collect();
        assert_eq!(high, vec![a.to_string(), b.to_string()]);

        assert_eq!(service.get_signals(0).len(), 3);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (service, _, ledger) = publishing(quick_config());
        let forta = StaticFeed::new(FeedSource::Forta, vec![event(FeedSource::Forta, HOT, ThreatLevel::High, 0.9)]);
        service.add_feed(forta.clone());
        assert_eq!(service.state(), ServiceState::NotStarted);

        service.start().await.unwrap();
        assert_eq!(service.state(), ServiceState::Running);
        assert!(matches!(service.start().await, Err(ServiceError::AlreadyStarted)));

        // Poll runs immediately on start
        let deadline = Instant::now() + Duration::from_secs(5);
        while service.get_signal(ChainId(1), HOT).is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(forta.fetches.load(Ordering::SeqCst), 1);
        assert!(service.get_signal(ChainId(1), HOT).is_some());

        service.stop().await;
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(ledger.closed.load(Ordering::SeqCst));
        assert!(service.publisher().unwrap().is_closed());

        // Queued update survives shutdown in memory
        assert_eq!(service.publisher().unwrap().stats().pending_updates, 1);

        assert!(matches!(service.start().await, Err(ServiceError::Stopped)));
        service.stop().await;
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start_releases_publisher() {
        let (service, _, ledger) = publishing(quick_config());
        service.stop().await;
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(ledger.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_restore_replays_recent_events_without_publishing() {
        let (service, storage, _) = publishing(quick_config());
        let now = Utc::now();

        let mut fresh = event(FeedSource::Forta, HOT, ThreatLevel::High, 0.9);
        fresh.fetched_at = now - ChronoDuration::hours(1);
        let mut expired = event(FeedSource::Nvd, COLD, ThreatLevel::High, 0.9);
        expired.fetched_at = now - ChronoDuration::days(30);
        storage.save_feed_event(&fresh).await.unwrap();
        storage.save_feed_event(&expired).await.unwrap();

        assert_eq!(service.restore_from_storage().await.unwrap(), 1);
        assert!(service.get_signal(ChainId(1), HOT).is_some());
        assert!(service.get_signal(ChainId(1), COLD).is_none());
        assert!(service.publisher().unwrap().pending_updates().is_empty());
    }

    #[tokio::test]
    async fn test_force_publish_records_update() {
        let (service, storage, ledger) = publishing(quick_config());
        service.add_feed(StaticFeed::new(
            FeedSource::Forta,
            vec![event(FeedSource::Forta, HOT, ThreatLevel::High, 0.9)],
        ));
        service.poll_now().await;
        let signal = service.get_signal(ChainId(1), HOT).unwrap();

        let receipt = service.force_publish(&signal).await.unwrap();
        assert_eq!(receipt.updates.len(), 1);
        assert_eq!(ledger.sends.load(Ordering::SeqCst), 1);
        assert_eq!(storage.update_count(), 1);

        // Still rate limited
        assert!(matches!(
            service.force_publish(&signal).await,
            Err(ServiceError::Publish(PublishError::RateLimited(_)))
        ));
    }

    #[tokio::test]
    async fn test_read_only_service_rejects_publishing() {
        let (service, _) = read_only(quick_config());
        assert!(matches!(service.flush_now().await, Err(ServiceError::NoPublisher)));
        assert!(service.stats().publisher.is_none());
    }

    #[tokio::test]
    async fn test_services_are_independent() {
        let (first, _) = read_only(quick_config());
        let mut config = quick_config();
        config.aggregation.min_confidence = 0.95;
        let (second, _) = read_only(config);

        first.add_feed(StaticFeed::new(
            FeedSource::Forta,
            vec![event(FeedSource::Forta, HOT, ThreatLevel::High, 0.9)],
        ));
        second.add_feed(StaticFeed::new(
            FeedSource::Forta,
            vec![event(FeedSource::Forta, HOT, ThreatLevel::High, 0.9)],
        ));
        first.poll_now().await;
        second.poll_now().await;

        assert!(first.get_signal(ChainId(1), HOT).is_some());
        assert!(second.get_signal(ChainId(1), HOT).is_none());
        assert_eq!(first.feed_count(), 2);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = OracleConfig::default();
        config.service.prune_interval_secs = 0;
        let result = OracleService::with_publisher(config, Arc::new(MemoryStorage::new()), None);
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }
}
