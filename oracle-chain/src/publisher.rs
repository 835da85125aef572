//! Publisher - rate-limited, batched delivery of risk scores on-chain
//!
//! Rules:
//! - A target may be written at most once per `min_update_interval`
//! - Only successful submissions advance the rate-limit clock
//! - Two concurrent attempts for the same target never both pass the check;
//!   targets being submitted are held in an in-flight set until the attempt ends
//! - Submissions are serialized so concurrent publishes never reuse a nonce
//!
//! The queue holds at most one pending update per target; queueing a target
//! again replaces its score in place. `flush_queue` publishes the queue in
//! batches and, when a batch fails for any reason, re-queues that batch and
//! everything after it. Targets skipped inside an otherwise successful batch
//! because they are rate limited or in flight go back on the queue too.
//! Resubmitting is safe because the contract overwrites scores rather than
//! accumulating them.

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, B256};
use alloy::rpc::types::TransactionRequest;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use oracle_core::{is_evm_address, is_zero_address, SignalUpdate, TargetKey, ThreatSignal};

use crate::abi::{batch_update_calldata, update_risk_score_calldata};
use crate::{ContractReader, LedgerClient, LedgerError, ProviderLedger, SharedLedger, SignerError, TransactionSigner};

/// Gas limit for `updateRiskScore`
pub const SINGLE_UPDATE_GAS: u64 = 100_000;

/// Fixed part of the `batchUpdateRiskScores` gas limit
pub const BATCH_BASE_GAS: u64 = 50_000;

/// Per-target part of the `batchUpdateRiskScores` gas limit
pub const BATCH_GAS_PER_TARGET: u64 = 30_000;

/// Largest rate-limit interval representable as a chrono duration
pub const MAX_MIN_UPDATE_INTERVAL_SECS: u64 = i64::MAX as u64 / 1000;

/// Publisher configuration
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherConfig {
    pub rpc_endpoint: String,
    pub contract_address: String,
    /// Hex secp256k1 key; usually supplied from the environment
    #[serde(default, skip_serializing)]
    pub private_key: Option<String>,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_min_update_interval_secs")]
    pub min_update_interval_secs: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_chain_id() -> u64 {
    1
}

fn default_min_update_interval_secs() -> u64 {
    3600
}

fn default_max_batch_size() -> usize {
    50
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl PublisherConfig {
    pub fn new(rpc_endpoint: &str, contract_address: &str, private_key: &str) -> Self {
        Self {
            rpc_endpoint: rpc_endpoint.to_string(),
            contract_address: contract_address.to_string(),
            private_key: Some(private_key.to_string()),
            chain_id: default_chain_id(),
            min_update_interval_secs: default_min_update_interval_secs(),
            max_batch_size: default_max_batch_size(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_min_update_interval_secs(mut self, secs: u64) -> Self {
        self.min_update_interval_secs = secs;
        self
    }

    /// Clamped to [`MAX_MIN_UPDATE_INTERVAL_SECS`]
    pub fn min_update_interval(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.min_update_interval_secs.min(MAX_MIN_UPDATE_INTERVAL_SECS) as i64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl fmt::Debug for PublisherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherConfig")
            .field("rpc_endpoint", &self.rpc_endpoint)
            .field("contract_address", &self.contract_address)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("chain_id", &self.chain_id)
            .field("min_update_interval_secs", &self.min_update_interval_secs)
            .field("max_batch_size", &self.max_batch_size)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Errors from publishing
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Target {0} was updated too recently")]
    RateLimited(String),

    #[error("All signals rate limited")]
    AllRateLimited,

    #[error("Invalid target address: {0}")]
    InvalidTarget(String),

    #[error("No publishable signals")]
    Empty,

    #[error("Signing failed: {0}")]
    Signing(#[from] SignerError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Submission timed out after {0:?}")]
    Timeout(Duration),

    #[error("Publisher is closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PublishError {
    /// Expected steady-state rejections rather than failures
    pub fn is_policy_rejection(&self) -> bool {
        matches!(self, PublishError::RateLimited(_) | PublishError::AllRateLimited | PublishError::Empty)
    }
}

/// Publisher counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherStats {
    pub total_published: u64,
    pub total_failed: u64,
    pub pending_updates: usize,
    pub tracked_targets: usize,
    pub in_flight: usize,
}

/// Result of one successful submission
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReceipt {
    pub tx_hash: B256,
    pub nonce: u64,
    /// Updates carried by the transaction, marked submitted
    pub updates: Vec<SignalUpdate>,
    /// Updates left out because their target was rate limited or in flight
    pub deferred: Vec<SignalUpdate>,
}

/// Outcome of a queue flush
#[derive(Debug, Default)]
pub struct FlushReport {
    pub published: usize,
    pub submitted: Vec<SignalUpdate>,
    /// Set when a batch failed; its remainder is back in the queue
    pub error: Option<PublishError>,
}

#[derive(Default)]
struct PublisherState {
    queue: Vec<SignalUpdate>,
    last_update: HashMap<TargetKey, DateTime<Utc>>,
    in_flight: HashSet<TargetKey>,
    total_published: u64,
    total_failed: u64,
}

impl PublisherState {
    fn recently_updated(&self, key: &TargetKey, now: DateTime<Utc>, interval: ChronoDuration) -> bool {
        self.last_update.get(key).is_some_and(|last| now - *last < interval)
    }

    /// Put unsent updates back at the head of the queue. Updates queued
    /// meanwhile win over the ones being returned.
    fn requeue(&mut self, unsent: Vec<SignalUpdate>) {
        let newer = std::mem::replace(&mut self.queue, unsent);
        for update in newer {
            enqueue(&mut self.queue, update);
        }
    }

    /// Append skipped updates behind the queue unless their target was queued again
    fn defer(&mut self, skipped: Vec<SignalUpdate>) {
        for update in skipped {
            let key = update.key();
            if !self.queue.iter().any(|queued| queued.key() == key) {
                self.queue.push(update);
            }
        }
    }
}

/// Append `update`, or replace the queued update for the same target in place
fn enqueue(queue: &mut Vec<SignalUpdate>, update: SignalUpdate) {
    let key = update.key();
    match queue.iter_mut().find(|queued| queued.key() == key) {
        Some(queued) => *queued = update,
        None => queue.push(update),
    }
}

/// In-flight claim on a set of targets, released on drop
struct Reservation<'a> {
    state: &'a Mutex<PublisherState>,
    keys: Vec<TargetKey>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        for key in &self.keys {
            state.in_flight.remove(key);
        }
    }
}

/// Stateful, thread-safe on-chain publisher
pub struct Publisher {
    config: PublisherConfig,
    contract: Address,
    signer: TransactionSigner,
    ledger: SharedLedger,
    reader: ContractReader,
    state: Mutex<PublisherState>,
    submit_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

/// Parse a target address, rejecting malformed and zero addresses
fn parse_target(address: &str) -> Result<Address, PublishError> {
    if !is_evm_address(address) || is_zero_address(address) {
        return Err(PublishError::InvalidTarget(address.to_string()));
    }
    address
        .trim()
        .parse::<Address>()
        .map_err(|_| PublishError::InvalidTarget(address.to_string()))
}

impl Publisher {
    /// Dial the configured endpoint and verify it serves the configured chain
    pub async fn connect(config: PublisherConfig) -> Result<Self, PublishError> {
        let ledger = ProviderLedger::new(&config.rpc_endpoint, config.request_timeout())
            .map_err(|e| PublishError::Config(format!("ledger endpoint: {}", e)))?;

        let reported = tokio::time::timeout(config.request_timeout(), ledger.chain_id())
            .await
            .map_err(|_| PublishError::Config(format!("ledger at {} did not answer", config.rpc_endpoint)))?
            .map_err(|e| PublishError::Config(format!("ledger at {} unreachable: {}", config.rpc_endpoint, e)))?;

        if reported != config.chain_id {
            return Err(PublishError::Config(format!(
                "ledger reports chain {} but {} is configured",
                reported, config.chain_id
            )));
        }

        Self::with_ledger(config, Arc::new(ledger))
    }

    /// Build around an existing ledger client
    pub fn with_ledger(config: PublisherConfig, ledger: SharedLedger) -> Result<Self, PublishError> {
        let key = config
            .private_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| PublishError::Config("private key is required".to_string()))?;
        let signer = TransactionSigner::from_hex(key).map_err(|e| PublishError::Config(e.to_string()))?;

        let contract = config
            .contract_address
            .trim()
            .parse::<Address>()
            .map_err(|e| PublishError::Config(format!("contract address {}: {}", config.contract_address, e)))?;
        if contract.is_zero() {
            return Err(PublishError::Config("contract address is zero".to_string()));
        }

        info!(
            "Publisher ready: sender {} -> contract {} on chain {}",
            signer.address(),
            contract,
            config.chain_id
        );

        Ok(Self {
            reader: ContractReader::new(Arc::clone(&ledger), contract),
            config,
            contract,
            signer,
            ledger,
            state: Mutex::new(PublisherState::default()),
            submit_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Address transactions are sent from
    pub fn sender(&self) -> Address {
        self.signer.address()
    }

    fn ensure_open(&self) -> Result<(), PublishError> {
        if self.closed.load(Ordering::Acquire) {
            Err(PublishError::Closed)
        } else {
            Ok(())
        }
    }

    /// Queue a signal for the next flush unless its target is rate limited.
    /// A target already in the queue keeps its position and takes the new score.
    pub fn queue_update(&self, signal: &ThreatSignal) -> Result<(), PublishError> {
        self.ensure_open()?;
        let update = SignalUpdate::pending(signal, Utc::now());
        parse_target(&update.target_address)?;

        let mut state = self.state.lock();
        if state.recently_updated(&update.key(), update.timestamp, self.config.min_update_interval()) {
            return Err(PublishError::RateLimited(update.target_address));
        }

        enqueue(&mut state.queue, update);
        Ok(())
    }

    /// Snapshot of the pending queue
    pub fn pending_updates(&self) -> Vec<SignalUpdate> {
        self.state.lock().queue.clone()
    }

    /// Publish one signal immediately, bypassing the queue but not the rate limit
    pub async fn publish(&self, signal: &ThreatSignal) -> Result<PublishReceipt, PublishError> {
        self.ensure_open()?;
        let update = SignalUpdate::pending(signal, Utc::now());
        let target = parse_target(&update.target_address)?;
        let key = update.key();

        let _reservation = {
            let mut state = self.state.lock();
            if state.in_flight.contains(&key)
                || state.recently_updated(&key, Utc::now(), self.config.min_update_interval())
            {
                return Err(PublishError::RateLimited(update.target_address));
            }
            state.in_flight.insert(key.clone());
            Reservation {
                state: &self.state,
                keys: vec![key.clone()],
            }
        };

        let calldata = update_risk_score_calldata(target, update.risk_score);
        let result = self.submit(calldata, SINGLE_UPDATE_GAS).await;

        let mut state = self.state.lock();
        match result {
            Ok((tx_hash, nonce)) => {
                state.last_update.insert(key, Utc::now());
                state.total_published += 1;
                info!("Published risk {} for {} in {}", update.risk_score, update.target_address, tx_hash);
                Ok(PublishReceipt {
                    tx_hash,
                    nonce,
                    updates: vec![update.submitted(&tx_hash.to_string(), nonce)],
                    deferred: Vec::new(),
                })
            }
            Err(e) => {
                state.total_failed += 1;
                warn!("Failed to publish risk for {}: {}", update.target_address, e);
                Err(e)
            }
        }
    }

    /// Publish up to `max_batch_size` signals in one transaction
    pub async fn publish_batch(&self, signals: &[ThreatSignal]) -> Result<PublishReceipt, PublishError> {
        let now = Utc::now();
        let updates = signals.iter().map(|s| SignalUpdate::pending(s, now)).collect();
        self.submit_batch(updates).await
    }

    async fn submit_batch(&self, mut updates: Vec<SignalUpdate>) -> Result<PublishReceipt, PublishError> {
        self.ensure_open()?;
        updates.truncate(self.config.max_batch_size.max(1));

        // Drop unusable targets; a repeated target keeps its latest score
        let mut targets: Vec<(TargetKey, Address, SignalUpdate)> = Vec::with_capacity(updates.len());
        let mut index: HashMap<TargetKey, usize> = HashMap::new();
        for update in updates {
            let address = match parse_target(&update.target_address) {
                Ok(address) => address,
                Err(_) => {
                    debug!("Skipping invalid target {:?}", update.target_address);
                    continue;
                }
            };
            let key = update.key();
            match index.get(&key) {
                Some(&i) => targets[i].2 = update,
                None => {
                    index.insert(key.clone(), targets.len());
                    targets.push((key, address, update));
                }
            }
        }
        if targets.is_empty() {
            return Err(PublishError::Empty);
        }

        let mut deferred = Vec::new();
        let reservation = {
            let mut state = self.state.lock();
            let now = Utc::now();
            let interval = self.config.min_update_interval();
            let (ready, blocked): (Vec<_>, Vec<_>) = targets
                .into_iter()
                .partition(|(key, _, _)| !state.in_flight.contains(key) && !state.recently_updated(key, now, interval));
            if ready.is_empty() {
                return Err(PublishError::AllRateLimited);
            }
            targets = ready;
            deferred.extend(blocked.into_iter().map(|(_, _, update)| update));

            let keys: Vec<TargetKey> = targets.iter().map(|(key, _, _)| key.clone()).collect();
            state.in_flight.extend(keys.iter().cloned());
            Reservation {
                state: &self.state,
                keys,
            }
        };

        let addresses = targets.iter().map(|(_, address, _)| *address).collect();
        let scores = targets.iter().map(|(_, _, update)| update.risk_score).collect();
        let gas_limit = BATCH_BASE_GAS + BATCH_GAS_PER_TARGET * targets.len() as u64;
        let result = self.submit(batch_update_calldata(addresses, scores), gas_limit).await;

        let mut state = self.state.lock();
        let count = targets.len();
        match result {
            Ok((tx_hash, nonce)) => {
                let now = Utc::now();
                for key in &reservation.keys {
                    state.last_update.insert(key.clone(), now);
                }
                state.total_published += count as u64;
                info!("Published batch of {} risk scores in {}", count, tx_hash);

                let hash = tx_hash.to_string();
                Ok(PublishReceipt {
                    tx_hash,
                    nonce,
                    updates: targets
                        .into_iter()
                        .map(|(_, _, update)| update.submitted(&hash, nonce))
                        .collect(),
                    deferred,
                })
            }
            Err(e) => {
                state.total_failed += count as u64;
                warn!("Failed to publish batch of {}: {}", count, e);
                Err(e)
            }
        }
    }

    /// Publish the whole pending queue in batches.
    ///
    /// Stops at the first failing batch; that batch and the rest of the queue
    /// are put back and the error is returned alongside the published count.
    pub async fn flush_queue(&self) -> FlushReport {
        let pending = std::mem::take(&mut self.state.lock().queue);
        let mut report = FlushReport::default();
        if pending.is_empty() {
            return report;
        }

        let batch_size = self.config.max_batch_size.max(1);
        let mut deferred = Vec::new();
        let mut offset = 0;
        while offset < pending.len() {
            let end = (offset + batch_size).min(pending.len());
            match self.submit_batch(pending[offset..end].to_vec()).await {
                Ok(receipt) => {
                    report.published += receipt.updates.len();
                    report.submitted.extend(receipt.updates);
                    deferred.extend(receipt.deferred);
                }
                Err(e) => {
                    let count = pending.len() - offset + deferred.len();
                    {
                        let mut state = self.state.lock();
                        state.requeue(pending[offset..].to_vec());
                        state.defer(deferred);
                    }

                    if e.is_policy_rejection() {
                        debug!("Flush stopped after {} updates, {} re-queued: {}", report.published, count, e);
                    } else {
                        warn!("Flush stopped after {} updates, {} re-queued: {}", report.published, count, e);
                    }
                    report.error = Some(e);
                    return report;
                }
            }
            offset = end;
        }

        if !deferred.is_empty() {
            debug!("{} queued updates deferred to the next flush", deferred.len());
            self.state.lock().defer(deferred);
        }
        report
    }

    /// Sign and send one transaction to the contract
    async fn submit(&self, calldata: Vec<u8>, gas_limit: u64) -> Result<(B256, u64), PublishError> {
        let timeout = self.config.request_timeout();
        let _serialized = self.submit_lock.lock().await;

        let attempt = async {
            let nonce = self.ledger.pending_nonce(self.signer.address()).await?;
            let gas_price = self.ledger.gas_price().await?;
            let request = TransactionRequest::default()
                .with_to(self.contract)
                .with_input(calldata)
                .with_nonce(nonce)
                .with_gas_price(gas_price)
                .with_gas_limit(gas_limit)
                .with_chain_id(self.config.chain_id);
            let signed = self.signer.sign(request).await?;
            let tx_hash = self.ledger.send_raw_transaction(&signed.raw).await?;
            Ok::<_, PublishError>((tx_hash, nonce))
        };

        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| PublishError::Timeout(timeout))?
    }

    /// Score currently stored on-chain for `address`
    pub async fn get_on_chain_score(&self, address: &str) -> Result<u8, PublishError> {
        let target = parse_target(address)?;
        Ok(self.reader.risk_score(target).await?)
    }

    /// Time of the last on-chain write for `address`
    pub async fn get_on_chain_last_update(&self, address: &str) -> Result<Option<DateTime<Utc>>, PublishError> {
        let target = parse_target(address)?;
        Ok(self.reader.last_update(target).await?)
    }

    pub fn stats(&self) -> PublisherStats {
        let state = self.state.lock();
        PublisherStats {
            total_published: state.total_published,
            total_failed: state.total_failed,
            pending_updates: state.queue.len(),
            tracked_targets: state.last_update.len(),
            in_flight: state.in_flight.len(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse further publishes and release the ledger; the queue is kept
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.ledger.close().await;
            info!("Publisher closed with {} updates pending", self.state.lock().queue.len());
        }
    }
}
