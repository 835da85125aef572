//! Signal Aggregator - turns per-target event history into one risk signal
//!
//! The aggregator keeps a bounded, FIFO-trimmed history of admitted events per
//! target and the single current [`ThreatSignal`] derived from it:
//! - Every event's weight is `confidence * source trust * time decay`
//! - Distinct sources boost the score and the signal's confidence
//! - Enough independent sources force `High`/`Critical` regardless of score
//!
//! Signals are always recomputed from the full retained history and swapped in
//! whole under the write lock, so readers never see a half-updated signal.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::{ChainId, FeedEvent, FeedSource, TargetKey, TargetRef, ThreatEventType, ThreatLevel, ThreatSignal};

/// Weight kept by events older than the decay window
pub const STALE_EVENT_WEIGHT: f64 = 0.1;

/// Weight an event has decayed to when it reaches the window boundary
pub const BOUNDARY_EVENT_WEIGHT: f64 = 0.5;

/// Score points added per distinct source
pub const SOURCE_DIVERSITY_BOOST: f64 = 10.0;

/// Confidence for a signal backed by zero sources, before the per-source step
pub const BASE_SIGNAL_CONFIDENCE: f64 = 0.5;

/// Confidence added per distinct source
pub const CONFIDENCE_PER_SOURCE: f64 = 0.15;

/// Upper bound on signal confidence
pub const MAX_SIGNAL_CONFIDENCE: f64 = 0.95;

/// Minimum score for `High` without source corroboration
pub const HIGH_SCORE: u8 = 60;

/// Minimum score for `Critical` when a critical-severity event is present
pub const CRITICAL_SCORE: u8 = 80;

/// Longest decay window honoured; larger settings are clamped to ten years
pub const MAX_EVENT_DECAY_HOURS: u64 = 24 * 365 * 10;

/// Tuning for signal aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationThresholds {
    /// Distinct sources that force a HIGH classification
    pub min_sources_for_high: usize,
    /// Distinct sources that force a CRITICAL classification
    pub min_sources_for_critical: usize,
    /// Events below this confidence are ignored
    pub min_confidence: f64,
    /// Hours after which an event's weight drops to the stale floor
    pub event_decay_hours: u64,
    /// History cap per target; oldest events are dropped first
    pub max_events_per_target: usize,
}

impl Default for AggregationThresholds {
    fn default() -> Self {
        Self {
            min_sources_for_high: 2,
            min_sources_for_critical: 3,
            min_confidence: 0.3,
            // One week
            event_decay_hours: 168,
            max_events_per_target: 100,
        }
    }
}

impl AggregationThresholds {
    pub fn decay_window(&self) -> Duration {
        Duration::hours(self.event_decay_hours.min(MAX_EVENT_DECAY_HOURS) as i64)
    }

    /// Events older than this are pruned
    pub fn retention_window(&self) -> Duration {
        self.decay_window() * 2
    }
}

/// Per-source trust weights, falling back to each source's default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceWeights(HashMap<FeedSource, f64>);

impl SourceWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weight(mut self, source: FeedSource, weight: f64) -> Self {
        self.set(source, weight);
        self
    }

    pub fn set(&mut self, source: FeedSource, weight: f64) {
        self.0.insert(source, weight.clamp(0.0, 1.0));
    }

    pub fn get(&self, source: FeedSource) -> f64 {
        self.0
            .get(&source)
            .copied()
            .unwrap_or_else(|| source.default_trust_weight())
    }

    /// Configured overrides only
    pub fn overrides(&self) -> impl Iterator<Item = (FeedSource, f64)> + '_ {
        self.0.iter().map(|(source, weight)| (*source, *weight))
    }
}

/// Aggregator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub total_targets: usize,
    pub total_events: usize,
    pub critical_signals: usize,
    pub high_signals: usize,
}

#[derive(Default)]
struct AggregatorState {
    /// Retained history per target, oldest first
    events: HashMap<TargetKey, Vec<Arc<FeedEvent>>>,
    signals: HashMap<TargetKey, ThreatSignal>,
}

/// Thread-safe store of per-target history and current signals
pub struct Aggregator {
    state: RwLock<AggregatorState>,
    thresholds: AggregationThresholds,
    weights: SourceWeights,
}

impl Aggregator {
    pub fn new(thresholds: AggregationThresholds) -> Self {
        Self::with_weights(thresholds, SourceWeights::default())
    }

    pub fn with_weights(thresholds: AggregationThresholds, weights: SourceWeights) -> Self {
        Self {
            state: RwLock::new(AggregatorState::default()),
            thresholds,
            weights,
        }
    }

    pub fn thresholds(&self) -> &AggregationThresholds {
        &self.thresholds
    }

    /// Ingest events and return the signals that changed
    pub fn process_events(&self, events: Vec<FeedEvent>) -> Vec<ThreatSignal> {
        self.process_events_at(events, Utc::now())
    }

    /// [`Aggregator::process_events`] evaluated at a fixed point in time
    pub fn process_events_at(&self, events: Vec<FeedEvent>, now: DateTime<Utc>) -> Vec<ThreatSignal> {
        let max_events = self.thresholds.max_events_per_target.max(1);
        let mut state = self.state.write();

        let mut touched: Vec<TargetKey> = Vec::new();
        let mut touched_set: HashSet<TargetKey> = HashSet::new();

        for event in events {
            if event.confidence.is_nan() || event.confidence < self.thresholds.min_confidence {
                continue;
            }

            let mut seen = HashSet::new();
            let keys: Vec<TargetKey> = event
                .targets
                .iter()
                .filter_map(TargetRef::key)
                .filter(|key| seen.insert(key.clone()))
                .collect();
            if keys.is_empty() {
                continue;
            }

            let shared = Arc::new(event);
            for key in keys {
                let history = state.events.entry(key.clone()).or_default();
                history.push(Arc::clone(&shared));
                if history.len() > max_events {
                    let excess = history.len() - max_events;
                    history.drain(..excess);
                }

                if touched_set.insert(key.clone()) {
                    touched.push(key);
                }
            }
        }

        let mut updated = Vec::with_capacity(touched.len());
        for key in touched {
            let signal = state
                .events
                .get(&key)
                .and_then(|history| self.compute_signal(&key, history, now));

            if let Some(signal) = signal {
                state.signals.insert(key, signal.clone());
                updated.push(signal);
            }
        }

        updated
    }

    /// Time-decay multiplier for an event fetched at `fetched_at`
    fn decay_factor(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let window = self.thresholds.decay_window().num_milliseconds() as f64;
        let age = (now - fetched_at).num_milliseconds().max(0) as f64;

        if age > window {
            STALE_EVENT_WEIGHT
        } else if window <= 0.0 {
            1.0
        } else {
            1.0 - (age / window) * (1.0 - BOUNDARY_EVENT_WEIGHT)
        }
    }

    fn compute_signal(
        &self,
        key: &TargetKey,
        events: &[Arc<FeedEvent>],
        now: DateTime<Utc>,
    ) -> Option<ThreatSignal> {
        let latest = events.last()?;
        let mut sources: BTreeSet<FeedSource> = BTreeSet::new();
        let mut total_weight = 0.0;
        let mut max_severity = ThreatLevel::None;
        let mut first_seen = latest.fetched_at;
        let mut latest_at = latest.fetched_at;

        for event in events {
            let weight = event.confidence * self.weights.get(event.source) * self.decay_factor(event.fetched_at, now);
            total_weight += weight;

            sources.insert(event.source);
            max_severity = max_severity.max(event.severity);
            first_seen = first_seen.min(event.fetched_at);
            latest_at = latest_at.max(event.fetched_at);
        }

        let num_sources = sources.len();
        let base_score = (total_weight / events.len() as f64) * 100.0;
        let raw_score = base_score + num_sources as f64 * SOURCE_DIVERSITY_BOOST;
        let risk_score = raw_score.clamp(0.0, 100.0) as u8;

        let confidence =
            (BASE_SIGNAL_CONFIDENCE + num_sources as f64 * CONFIDENCE_PER_SOURCE).min(MAX_SIGNAL_CONFIDENCE);

        let target = latest
            .targets
            .iter()
            .find(|t| t.key().as_ref() == Some(key))
            .cloned()
            .unwrap_or_default();

        Some(ThreatSignal {
            target,
            risk_score,
            threat_level: self.classify(risk_score, num_sources, max_severity),
            confidence,
            sources: sources.into_iter().collect(),
            event_count: events.len(),
            latest_event_at: latest_at,
            first_seen_at: first_seen,
            event_ids: events.iter().map(|e| e.id.clone()).collect(),
            summary_reason: summary_reason(events, num_sources),
            updated_at: now,
        })
    }

    /// Source corroboration is checked before the score-only rules
    fn classify(&self, score: u8, num_sources: usize, max_severity: ThreatLevel) -> ThreatLevel {
        if num_sources >= self.thresholds.min_sources_for_critical
            || (score >= CRITICAL_SCORE && max_severity == ThreatLevel::Critical)
        {
            return ThreatLevel::Critical;
        }

        if num_sources >= self.thresholds.min_sources_for_high || score >= HIGH_SCORE {
            return ThreatLevel::High;
        }

        match score {
            40.. => ThreatLevel::Medium,
            20.. => ThreatLevel::Low,
            _ => ThreatLevel::Info,
        }
    }

    /// Current signal for a target
    pub fn get_signal(&self, chain_id: ChainId, address: &str) -> Option<ThreatSignal> {
        let key = TargetKey::new(chain_id, address);
        self.state.read().signals.get(&key).cloned()
    }

    /// All signals scoring at least `min_score`, highest first
    pub fn get_all_signals(&self, min_score: u8) -> Vec<ThreatSignal> {
        let state = self.state.read();
        let mut matching: Vec<(&TargetKey, &ThreatSignal)> = state
            .signals
            .iter()
            .filter(|(_, signal)| signal.risk_score >= min_score)
            .collect();

        // Ties ordered by key so repeated calls agree
        matching.sort_by(|(ka, a), (kb, b)| b.risk_score.cmp(&a.risk_score).then_with(|| ka.cmp(kb)));

        matching.into_iter().map(|(_, signal)| signal.clone()).collect()
    }

    /// Retained history for a target, oldest first
    pub fn retained_events(&self, chain_id: ChainId, address: &str) -> Vec<Arc<FeedEvent>> {
        let key = TargetKey::new(chain_id, address);
        self.state.read().events.get(&key).cloned().unwrap_or_default()
    }

    /// Drop events older than twice the decay window
    pub fn prune_old_events(&self) -> usize {
        self.prune_old_events_at(Utc::now())
    }

    /// [`Aggregator::prune_old_events`] evaluated at a fixed point in time
    pub fn prune_old_events_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now
            .checked_sub_signed(self.thresholds.retention_window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut guard = self.state.write();
        let AggregatorState { events, signals } = &mut *guard;
        let mut pruned = 0;

        events.retain(|key, history| {
            let before = history.len();
            history.retain(|event| event.fetched_at > cutoff);
            pruned += before - history.len();

            if history.is_empty() {
                signals.remove(key);
                false
            } else {
                true
            }
        });

        pruned
    }

    pub fn stats(&self) -> AggregatorStats {
        let state = self.state.read();
        let mut stats = AggregatorStats {
            total_targets: state.signals.len(),
            total_events: state.events.values().map(Vec::len).sum(),
            ..Default::default()
        };

        for signal in state.signals.values() {
            match signal.threat_level {
                ThreatLevel::Critical => stats.critical_signals += 1,
                ThreatLevel::High => stats.high_signals += 1,
                _ => {}
            }
        }

        stats
    }
}

/// Phrase for the most frequent event type; ties go to the type seen first
fn summary_reason(events: &[Arc<FeedEvent>], num_sources: usize) -> String {
    let mut counts: Vec<(ThreatEventType, usize)> = Vec::new();
    for event in events {
        match counts.iter_mut().find(|(t, _)| *t == event.event_type) {
            Some((_, count)) => *count += 1,
            None => counts.push((event.event_type, 1)),
        }
    }

    let mut top = ThreatEventType::Suspicious;
    let mut top_count = 0;
    for (event_type, count) in counts {
        if count > top_count {
            top = event_type;
            top_count = count;
        }
    }

    let phrase = top.summary_phrase();
    if num_sources > 1 {
        format!("{} by multiple sources", phrase)
    } else {
        phrase.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "0x1111111111111111111111111111111111111111";
    const OTHER: &str = "0x2222222222222222222222222222222222222222";

    fn event(
        id: &str,
        source: FeedSource,
        confidence: f64,
        severity: ThreatLevel,
        fetched_at: DateTime<Utc>,
    ) -> FeedEvent {
        FeedEvent::builder(source, ThreatEventType::Exploit, id)
            .id(id)
            .target(TargetRef::contract(1, TARGET))
            .confidence(confidence)
            .severity(severity)
            .fetched_at(fetched_at)
            .build()
    }

    fn aggregator() -> Aggregator {
        Aggregator::with_weights(
            AggregationThresholds::default(),
            SourceWeights::new().with_weight(FeedSource::Forta, 0.9),
        )
    }

    #[test]
    fn test_single_fresh_event_scores_as_documented() {
        let now = Utc::now();
        let agg = aggregator();
        let updated = agg.process_events_at(
            vec![event("e1", FeedSource::Forta, 0.9, ThreatLevel::High, now)],
            now,
        );

        assert_eq!(updated.len(), 1);
        let signal = &updated[0];
        // 0.9 * 0.9 * 1.0 * 100 = 81, plus one source boost of 10
        assert_eq!(signal.risk_score, 91);
        assert_eq!(signal.threat_level, ThreatLevel::High);
        assert!((signal.confidence - 0.65).abs() < 1e-9);
        assert_eq!(signal.sources, vec![FeedSource::Forta]);
        assert_eq!(signal.summary_reason, "Exploit PoC reported");
        assert_eq!(agg.get_signal(ChainId(1), TARGET).as_ref(), Some(signal));
    }

    #[test]
    fn test_critical_severity_with_high_score_is_critical() {
        let now = Utc::now();
        let agg = aggregator();
        let updated = agg.process_events_at(
            vec![event("e1", FeedSource::Forta, 0.9, ThreatLevel::Critical, now)],
            now,
        );
        assert_eq!(updated[0].threat_level, ThreatLevel::Critical);
    }

    #[test]
    fn test_low_confidence_events_are_ignored() {
        let now = Utc::now();
        let agg = aggregator();
        let updated = agg.process_events_at(
            vec![
                event("weak", FeedSource::Forta, 0.1, ThreatLevel::High, now),
                event("nan", FeedSource::Forta, f64::NAN, ThreatLevel::High, now),
            ],
            now,
        );

        assert!(updated.is_empty());
        assert!(agg.get_signal(ChainId(1), TARGET).is_none());
        assert!(agg.retained_events(ChainId(1), TARGET).is_empty());
        assert_eq!(agg.stats(), AggregatorStats::default());
    }

    #[test]
    fn test_low_confidence_events_leave_existing_history_untouched() {
        let now = Utc::now();
        let agg = aggregator();
        agg.process_events_at(vec![event("e1", FeedSource::Forta, 0.9, ThreatLevel::High, now)], now);
        let before = agg.get_signal(ChainId(1), TARGET).unwrap();

        let later = now + Duration::minutes(5);
        let updated = agg.process_events_at(
            vec![
                event("weak", FeedSource::GitHub, 0.05, ThreatLevel::Critical, later),
                event("nan", FeedSource::ChainAbuse, f64::NAN, ThreatLevel::Critical, later),
            ],
            later,
        );

        assert!(updated.is_empty());
        let history = agg.retained_events(ChainId(1), TARGET);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "e1");
        assert_eq!(agg.get_signal(ChainId(1), TARGET), Some(before));
    }

    #[test]
    fn test_oversized_decay_window_is_clamped() {
        let thresholds = AggregationThresholds {
            event_decay_hours: 10_000_000_000_000,
            ..Default::default()
        };
        assert_eq!(thresholds.decay_window(), Duration::hours(MAX_EVENT_DECAY_HOURS as i64));

        let agg = Aggregator::with_weights(thresholds, SourceWeights::new());
        let now = Utc::now();
        let updated = agg.process_events_at(
            vec![event("e1", FeedSource::Forta, 0.9, ThreatLevel::High, now - Duration::days(30))],
            now,
        );
        assert_eq!(updated.len(), 1);
        assert_eq!(agg.prune_old_events_at(now), 0);
    }

    #[test]
    fn test_three_sources_force_critical() {
        let now = Utc::now();
        let agg = aggregator();
        let updated = agg.process_events_at(
            vec![
                event("a", FeedSource::GitHub, 0.5, ThreatLevel::Low, now),
                event("b", FeedSource::ChainAbuse, 0.5, ThreatLevel::Low, now),
                event("c", FeedSource::Internal, 0.5, ThreatLevel::Low, now),
            ],
            now,
        );

        assert_eq!(updated.len(), 1);
        let signal = &updated[0];
        assert_eq!(signal.source_count(), 3);
        assert!(signal.threat_level >= ThreatLevel::High);
        assert_eq!(signal.threat_level, ThreatLevel::Critical);
        assert!((signal.confidence - 0.95).abs() < 1e-9);
        assert_eq!(signal.summary_reason, "Exploit PoC reported by multiple sources");
    }

    #[test]
    fn test_two_sources_force_high_despite_low_score() {
        let now = Utc::now();
        let agg = Aggregator::new(AggregationThresholds::default());
        // Weights 0.6 and 0.7 at confidence 0.3: base ~19.5, +20 boost -> below 60
        let updated = agg.process_events_at(
            vec![
                event("a", FeedSource::GitHub, 0.3, ThreatLevel::Info, now),
                event("b", FeedSource::Internal, 0.3, ThreatLevel::Info, now),
            ],
            now,
        );
        assert!(updated[0].risk_score < HIGH_SCORE);
        assert_eq!(updated[0].threat_level, ThreatLevel::High);
    }

    #[test]
    fn test_score_only_levels() {
        let agg = aggregator();
        assert_eq!(agg.classify(45, 1, ThreatLevel::High), ThreatLevel::Medium);
        assert_eq!(agg.classify(25, 1, ThreatLevel::High), ThreatLevel::Low);
        assert_eq!(agg.classify(19, 1, ThreatLevel::High), ThreatLevel::Info);
        assert_eq!(agg.classify(79, 1, ThreatLevel::Critical), ThreatLevel::High);
        assert_eq!(agg.classify(80, 1, ThreatLevel::Critical), ThreatLevel::Critical);
    }

    #[test]
    fn test_decay_factor_curve() {
        let agg = aggregator();
        let now = Utc::now();
        let window = agg.thresholds().decay_window();

        assert_eq!(agg.decay_factor(now, now), 1.0);
        assert!((agg.decay_factor(now - window / 2, now) - 0.75).abs() < 1e-9);
        assert!((agg.decay_factor(now - window, now) - BOUNDARY_EVENT_WEIGHT).abs() < 1e-9);
        assert_eq!(agg.decay_factor(now - window - Duration::seconds(1), now), STALE_EVENT_WEIGHT);
        // Reports from the future are not boosted
        assert_eq!(agg.decay_factor(now + Duration::hours(1), now), 1.0);
    }

    #[test]
    fn test_old_events_weigh_less() {
        let now = Utc::now();
        let agg = aggregator();
        let stale = now - Duration::hours(200);
        let updated = agg.process_events_at(
            vec![event("old", FeedSource::Forta, 0.9, ThreatLevel::High, stale)],
            now,
        );
        // 0.9 * 0.9 * 0.1 * 100 = 8.1, +10
        assert_eq!(updated[0].risk_score, 18);
        assert_eq!(updated[0].threat_level, ThreatLevel::Info);
    }

    #[test]
    fn test_history_is_capped_fifo() {
        let now = Utc::now();
        let thresholds = AggregationThresholds {
            max_events_per_target: 3,
            ..Default::default()
        };
        let agg = Aggregator::new(thresholds);

        let events: Vec<FeedEvent> = (0..5)
            .map(|i| event(&format!("e{}", i), FeedSource::Nvd, 0.8, ThreatLevel::Medium, now))
            .collect();
        agg.process_events_at(events, now);

        let retained = agg.retained_events(ChainId(1), TARGET);
        assert_eq!(retained.len(), 3);
        let ids: Vec<&str> = retained.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e3", "e4"]);

        agg.process_events_at(vec![event("e5", FeedSource::Nvd, 0.8, ThreatLevel::Medium, now)], now);
        let retained = agg.retained_events(ChainId(1), TARGET);
        assert_eq!(retained.len(), 3);
        assert_eq!(retained[0].id, "e3");

        let signal = agg.get_signal(ChainId(1), TARGET).unwrap();
        assert_eq!(signal.event_count, 3);
        assert_eq!(signal.event_ids, vec!["e3", "e4", "e5"]);
    }

    #[test]
    fn test_event_with_multiple_targets_updates_each() {
        let now = Utc::now();
        let agg = aggregator();
        let shared = FeedEvent::builder(FeedSource::BlockSec, ThreatEventType::BridgeHack, "bridge")
            .target(TargetRef::contract(1, TARGET))
            .target(TargetRef::contract(1, OTHER).with_name("bridge vault"))
            .target(TargetRef {
                name: Some("bridge project".to_string()),
                ..Default::default()
            })
            .confidence(0.8)
            .fetched_at(now)
            .build();

        let updated = agg.process_events_at(vec![shared], now);
        assert_eq!(updated.len(), 2);

        let other = agg.get_signal(ChainId(1), OTHER).unwrap();
        assert_eq!(other.target.address.as_deref(), Some(OTHER));
        assert_eq!(other.target.name.as_deref(), Some("bridge vault"));
        assert_eq!(other.summary_reason, "Bridge exploit reported");
        assert_eq!(agg.stats().total_targets, 2);
    }

    #[test]
    fn test_signal_lookup_is_case_insensitive() {
        let now = Utc::now();
        let agg = aggregator();
        let mixed = "0xAbCdEf000000000000000000000000000000dEaD";
        agg.process_events_at(
            vec![FeedEvent::builder(FeedSource::Forta, ThreatEventType::Exploit, "drain")
                .target(TargetRef::contract(1, mixed))
                .confidence(0.9)
                .fetched_at(now)
                .build()],
            now,
        );
        assert!(agg.get_signal(ChainId(1), &mixed.to_ascii_lowercase()).is_some());
        assert!(agg.get_signal(ChainId(1), "0xABCDEF000000000000000000000000000000DEAD").is_some());
        assert!(agg.get_signal(ChainId(56), mixed).is_none());
    }

    #[test]
    fn test_get_all_signals_filters_and_sorts() {
        let now = Utc::now();
        let agg = aggregator();
        let mut events = Vec::new();
        for (i, confidence) in [0.35, 0.9, 0.6, 0.45].iter().enumerate() {
            let address = format!("0x{:040x}", i + 1);
            events.push(
                FeedEvent::builder(FeedSource::Forta, ThreatEventType::Phishing, &address)
                    .target(TargetRef::contract(1, &address))
                    .confidence(*confidence)
                    .fetched_at(now)
                    .build(),
            );
        }
        agg.process_events_at(events, now);

        let all = agg.get_all_signals(0);
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].risk_score >= w[1].risk_score));

        let high = agg.get_all_signals(60);
        assert!(!high.is_empty());
        assert!(high.iter().all(|s| s.risk_score >= 60));
        assert!(high.len() < all.len());
        assert_eq!(agg.get_all_signals(0), all);
    }

    #[test]
    fn test_prune_is_idempotent_and_cascades() {
        let now = Utc::now();
        let agg = aggregator();
        let ancient = now - Duration::hours(400);

        agg.process_events_at(
            vec![
                event("old", FeedSource::Forta, 0.9, ThreatLevel::High, ancient),
                FeedEvent::builder(FeedSource::Nvd, ThreatEventType::Vulnerability, "fresh")
                    .target(TargetRef::contract(1, OTHER))
                    .confidence(0.9)
                    .fetched_at(now)
                    .build(),
            ],
            now,
        );
        assert_eq!(agg.stats().total_targets, 2);

        assert_eq!(agg.prune_old_events_at(now), 1);
        assert!(agg.get_signal(ChainId(1), TARGET).is_none());
        assert!(agg.get_signal(ChainId(1), OTHER).is_some());
        assert_eq!(agg.prune_old_events_at(now), 0);

        let stats = agg.stats();
        assert_eq!(stats.total_targets, 1);
        assert_eq!(stats.total_events, 1);
    }

    #[test]
    fn test_reason_ties_go_to_first_seen_type() {
        let now = Utc::now();
        let mk = |id: &str, t: ThreatEventType| {
            Arc::new(
                FeedEvent::builder(FeedSource::Forta, t, id)
                    .target(TargetRef::contract(1, TARGET))
                    .fetched_at(now)
                    .build(),
            )
        };
        let events = vec![
            mk("a", ThreatEventType::RugPull),
            mk("b", ThreatEventType::Phishing),
            mk("c", ThreatEventType::Phishing),
            mk("d", ThreatEventType::RugPull),
        ];
        assert_eq!(summary_reason(&events, 1), "Rug pull pattern detected");
        assert_eq!(summary_reason(&events[1..], 2), "Phishing campaign linked by multiple sources");
    }

    #[test]
    fn test_stats_counts_levels() {
        let now = Utc::now();
        let agg = aggregator();
        agg.process_events_at(
            vec![
                event("crit", FeedSource::Forta, 0.9, ThreatLevel::Critical, now),
                FeedEvent::builder(FeedSource::Forta, ThreatEventType::Exploit, "high")
                    .target(TargetRef::contract(1, OTHER))
                    .confidence(0.9)
                    .severity(ThreatLevel::High)
                    .fetched_at(now)
                    .build(),
            ],
            now,
        );

        let stats = agg.stats();
        assert_eq!(stats.critical_signals, 1);
        assert_eq!(stats.high_signals, 1);
        assert_eq!(stats.total_events, 2);
    }
}
