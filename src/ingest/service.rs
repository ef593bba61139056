//! Batch ingestion.

use super::sink::EventSink;
use crate::models::{Event, Fingerprint, Verdict};
use crate::services::deduplication::Deduplicator;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

/// Per-event ingestion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// First sighting, forwarded downstream.
    Accepted,
    /// Suppressed.
    Duplicate,
    /// Malformed, not deduplicated.
    Rejected,
}

impl From<Verdict> for EventStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Accepted => Self::Accepted,
            Verdict::Duplicate => Self::Duplicate,
        }
    }
}

/// Result for one event of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventResult {
    /// Position in the submitted batch.
    pub index: usize,
    /// What happened to the event.
    pub status: EventStatus,
    /// Fingerprint, absent for rejected events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    /// Rejection reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate outcome of [`IngestService::process`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Events submitted.
    pub processed: usize,
    /// Events accepted.
    pub unique: usize,
    /// Events suppressed as duplicates.
    pub duplicates: usize,
    /// Malformed events.
    pub rejected: usize,
    /// Per-event results, in submission order.
    pub results: Vec<EventResult>,
}

impl IngestReport {
    fn record(&mut self, result: EventResult) {
        self.processed += 1;
        match result.status {
            EventStatus::Accepted => self.unique += 1,
            EventStatus::Duplicate => self.duplicates += 1,
            EventStatus::Rejected => self.rejected += 1,
        }
        self.results.push(result);
    }
}

/// Runs events through deduplication and forwards accepted ones to a sink.
#[derive(Clone)]
pub struct IngestService {
    dedup: Arc<dyn Deduplicator>,
    sink: Arc<dyn EventSink>,
}

impl IngestService {
    /// Creates an ingestion service.
    #[must_use]
    pub fn new(dedup: Arc<dyn Deduplicator>, sink: Arc<dyn EventSink>) -> Self {
        Self { dedup, sink }
    }

    /// The decider behind this service.
    #[must_use]
    pub fn deduplicator(&self) -> &Arc<dyn Deduplicator> {
        &self.dedup
    }

    /// Processes one raw event.
    ///
    /// A malformed event yields a `Rejected` result rather than an error.
    ///
    /// # Errors
    ///
    /// Returns store errors from the decider and delivery errors from the sink.
    pub fn process_one(&self, index: usize, value: Value) -> Result<EventResult> {
        let outcome = Event::from_value(value).and_then(|event| {
            let outcome = self.dedup.is_duplicate_and_claim(&event)?;
            Ok((event, outcome))
        });

        match outcome {
            Ok((event, outcome)) => {
                if outcome.verdict == Verdict::Accepted {
                    self.sink.publish(&event, &outcome.fingerprint).inspect_err(|e| {
                        tracing::error!(
                            fingerprint = %outcome.fingerprint,
                            sink = self.sink.sink_name(),
                            error = %e,
                            "Accepted event could not be forwarded"
                        );
                    })?;
                }
                Ok(EventResult {
                    index,
                    status: outcome.verdict.into(),
                    fingerprint: Some(outcome.fingerprint),
                    error: None,
                })
            },
            Err(Error::MalformedEvent(reason)) => {
                tracing::debug!(index, reason = %reason, "Rejected malformed event");
                metrics::counter!("ingest_rejected_total").increment(1);
                Ok(EventResult {
                    index,
                    status: EventStatus::Rejected,
                    fingerprint: None,
                    error: Some(reason),
                })
            },
            Err(e) => Err(e),
        }
    }

    /// Processes a batch in order.
    ///
    /// Malformed events are rejected individually. A store error aborts the
    /// batch: events before it keep their verdicts (and claims), events after
    /// it are not looked at.
    ///
    /// # Errors
    ///
    /// Returns the first store or sink error.
    #[instrument(skip(self, values), fields(operation = "ingest_batch", size = values.len()))]
    pub fn process(&self, values: Vec<Value>) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        for (index, value) in values.into_iter().enumerate() {
            let result = self.process_one(index, value).inspect_err(|e| {
                tracing::warn!(
                    index,
                    processed = report.processed,
                    error = %e,
                    "Batch aborted"
                );
            })?;
            report.record(result);
        }
        tracing::info!(
            processed = report.processed,
            unique = report.unique,
            duplicates = report.duplicates,
            rejected = report.rejected,
            "Batch processed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::MemorySink;
    use crate::models::DedupOutcome;
    use crate::services::deduplication::DedupStats;
    use crate::storage::{MemoryFastTier, MemoryLedger};
    use crate::{DeduplicationConfig, DeduplicationService};
    use serde_json::json;

    fn ingest() -> (IngestService, Arc<MemorySink>) {
        let service = DeduplicationService::new(
            Arc::new(MemoryFastTier::new()),
            Arc::new(MemoryLedger::new()),
            DeduplicationConfig::default(),
        );
        let sink = Arc::new(MemorySink::new());
        (IngestService::new(Arc::new(service), sink.clone()), sink)
    }

    /// Decider whose stores are down after `healthy` calls.
    struct FailsAfter {
        inner: DeduplicationService,
        healthy: std::sync::atomic::AtomicUsize,
    }

    impl Deduplicator for FailsAfter {
        fn is_duplicate_and_claim(&self, event: &Event) -> Result<DedupOutcome> {
            use std::sync::atomic::Ordering;
            if self.healthy.load(Ordering::SeqCst) == 0 {
                return Err(Error::cache("claim", "connection reset"));
            }
            self.healthy.fetch_sub(1, Ordering::SeqCst);
            self.inner.is_duplicate_and_claim(event)
        }

        fn check(&self, event: &Event) -> Result<Verdict> {
            self.inner.check(event)
        }

        fn stats(&self) -> DedupStats {
            self.inner.stats()
        }
    }

    #[test]
    fn test_purchase_scenario_counts() {
        let (ingest, sink) = ingest();
        let report = ingest
            .process(vec![
                json!({"event_name": "purchase", "client_id": 123, "event_datetime": "2024-01-01T10:00:00Z"}),
                json!({"event_name": "purchase", "client_id": 123, "event_datetime": "2024-01-01T10:00:00Z"}),
                json!({"event_name": "purchase", "client_id": 456, "event_datetime": "2024-01-01T10:00:00Z"}),
            ])
            .unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(report.unique, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.rejected, 0);
        let statuses: Vec<EventStatus> = report.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![EventStatus::Accepted, EventStatus::Duplicate, EventStatus::Accepted]
        );
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_malformed_event_does_not_affect_others() {
        let (ingest, sink) = ingest();
        let report = ingest
            .process(vec![
                json!({"event_name": "signup", "user_id": "u1", "event_datetime": "2024-03-01 08:00:00"}),
                json!({"event_name": "signup"}),
                json!("not an object"),
                json!({"event_name": "signup", "user_id": "u2", "event_datetime": 1_709_280_000}),
            ])
            .unwrap();

        assert_eq!(report.processed, 4);
        assert_eq!(report.unique, 2);
        assert_eq!(report.rejected, 2);
        assert!(report.results[1].error.is_some());
        assert!(report.results[1].fingerprint.is_none());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_store_error_aborts_batch() {
        let dedup = FailsAfter {
            inner: DeduplicationService::new(
                Arc::new(MemoryFastTier::new()),
                Arc::new(MemoryLedger::new()),
                DeduplicationConfig::default(),
            ),
            healthy: std::sync::atomic::AtomicUsize::new(1),
        };
        let sink = Arc::new(MemorySink::new());
        let ingest = IngestService::new(Arc::new(dedup), sink.clone());

        let err = ingest
            .process(vec![
                json!({"event_name": "a", "event_datetime": "2024-01-01T00:00:00Z"}),
                json!({"event_name": "b", "event_datetime": "2024-01-01T00:00:00Z"}),
                json!({"event_name": "c", "event_datetime": "2024-01-01T00:00:00Z"}),
            ])
            .unwrap_err();

        assert!(matches!(err, Error::CacheUnavailable { .. }));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_report_serializes_statuses() {
        let (ingest, _) = ingest();
        let report = ingest
            .process(vec![json!({"event_name": "x"})])
            .unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["results"][0]["status"], "rejected");
        assert!(json["results"][0].get("fingerprint").is_none());
    }
}
