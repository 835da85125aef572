//! Internal feed - findings from our own contract scanners
//!
//! Findings are enqueued with [`InternalFeed::add_vulnerabilities`] and handed
//! to the aggregator on the next poll; each finding is delivered exactly once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use oracle_core::{Evidence, FeedEvent, FeedSource, TargetRef, Vulnerability};

use crate::{FeedError, ThreatFeed};

/// Feed backed by an in-memory queue of scanner findings
#[derive(Default)]
pub struct InternalFeed {
    pending: Mutex<Vec<Vulnerability>>,
    last_fetch: Mutex<Option<DateTime<Utc>>>,
}

impl InternalFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue findings for the next fetch
    pub fn add_vulnerabilities(&self, vulns: Vec<Vulnerability>) {
        if vulns.is_empty() {
            return;
        }
        let mut pending = self.pending.lock();
        pending.extend(vulns);
        debug!("Internal feed holds {} pending findings", pending.len());
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn last_fetch_time(&self) -> Option<DateTime<Utc>> {
        *self.last_fetch.lock()
    }

    fn to_event(vuln: Vulnerability, fetched_at: DateTime<Utc>) -> FeedEvent {
        let target = TargetRef::contract(vuln.chain_id.0, &vuln.contract);

        let mut builder = FeedEvent::builder(FeedSource::Internal, vuln.vuln_type.event_type(), &vuln.title)
            .id(&format!("internal-{}", vuln.id))
            .description(&vuln.description)
            .severity(vuln.severity)
            .target(target)
            .evidence(Evidence {
                // CWE is the closest identifier a scanner finding carries
                cve: vuln.cwe.clone(),
                ..Default::default()
            })
            .confidence(vuln.confidence)
            .fetched_at(fetched_at)
            .published_at(vuln.detected_at);

        if !vuln.detected_by.is_empty() {
            builder = builder.tag(&vuln.detected_by);
        }

        builder.build()
    }
}

#[async_trait]
impl ThreatFeed for InternalFeed {
    fn source(&self) -> FeedSource {
        FeedSource::Internal
    }

    async fn fetch(&self, _deadline: Instant) -> Result<Vec<FeedEvent>, FeedError> {
        let drained = std::mem::take(&mut *self.pending.lock());
        let now = Utc::now();
        Ok(drained.into_iter().map(|v| Self::to_event(v, now)).collect())
    }

    fn set_last_fetch_time(&self, at: DateTime<Utc>) {
        *self.last_fetch.lock() = Some(at);
    }
}
