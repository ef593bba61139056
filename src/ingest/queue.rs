//! Queue consumption.
//!
//! A [`QueueConsumer`] pulls one delivery at a time, decides, forwards accepted
//! events downstream and only then acknowledges. Outcomes:
//!
//! | Decision | Queue action |
//! |----------|--------------|
//! | Accepted / Duplicate | ack |
//! | Malformed body or event | ack (dropped, never retried) |
//! | Store error (nothing claimed) | nack with requeue |
//! | Sink error after a claim | nack without requeue, fingerprint logged as unforwarded |
//!
//! A requeued delivery whose fingerprint is already claimed would come back
//! as a duplicate and never reach the sink, so forwarding failures are
//! dead-lettered instead of retried.

use super::service::{EventStatus, IngestService};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::io::BufRead;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::instrument;

/// One message handed out by a [`QueueSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Identifies the delivery for ack/nack.
    pub tag: u64,
    /// Raw message body (JSON).
    pub body: Vec<u8>,
    /// Whether this message was handed out before.
    pub redelivered: bool,
}

/// A source of deliveries with explicit acknowledgement.
pub trait QueueSource: Send + Sync {
    /// Next delivery, or `None` when the source is drained.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the source cannot be read.
    fn next_delivery(&self) -> Result<Option<Delivery>>;

    /// Confirms a delivery was handled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] for unknown tags.
    fn ack(&self, tag: u64) -> Result<()>;

    /// Rejects a delivery, optionally putting it back for redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] for unknown tags.
    fn nack(&self, tag: u64, requeue: bool) -> Result<()>;
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<(Vec<u8>, bool)>,
    unacked: HashMap<u64, Vec<u8>>,
    next_tag: u64,
    acked: usize,
    dropped: usize,
}

impl QueueState {
    fn hand_out(&mut self, body: Vec<u8>, redelivered: bool) -> Delivery {
        self.next_tag += 1;
        let tag = self.next_tag;
        self.unacked.insert(tag, body.clone());
        Delivery {
            tag,
            body,
            redelivered,
        }
    }

    fn settle(&mut self, tag: u64, requeue: Option<bool>) -> Result<()> {
        let body = self
            .unacked
            .remove(&tag)
            .ok_or_else(|| Error::failed("settle", format!("unknown delivery tag {tag}")))?;
        match requeue {
            None => self.acked += 1,
            Some(true) => self.ready.push_front((body, true)),
            Some(false) => self.dropped += 1,
        }
        Ok(())
    }
}

/// In-process queue with ack/nack semantics.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a message body.
    pub fn publish(&self, body: impl Into<Vec<u8>>) {
        self.state().ready.push_back((body.into(), false));
    }

    /// Messages waiting to be handed out.
    #[must_use]
    pub fn ready(&self) -> usize {
        self.state().ready.len()
    }

    /// Messages handed out but not yet settled.
    #[must_use]
    pub fn unacked(&self) -> usize {
        self.state().unacked.len()
    }

    /// Messages acknowledged so far.
    #[must_use]
    pub fn acked(&self) -> usize {
        self.state().acked
    }

    /// Messages rejected without requeue.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.state().dropped
    }
}

impl QueueSource for MemoryQueue {
    fn next_delivery(&self) -> Result<Option<Delivery>> {
        let mut state = self.state();
        Ok(state
            .ready
            .pop_front()
            .map(|(body, redelivered)| state.hand_out(body, redelivered)))
    }

    fn ack(&self, tag: u64) -> Result<()> {
        self.state().settle(tag, None)
    }

    fn nack(&self, tag: u64, requeue: bool) -> Result<()> {
        self.state().settle(tag, Some(requeue))
    }
}

/// Newline-delimited JSON read from any buffered reader.
///
/// Blank lines are skipped. Requeued messages are handed out again before the
/// next line is read.
pub struct JsonLinesQueue {
    reader: Mutex<Box<dyn BufRead + Send>>,
    state: Mutex<QueueState>,
}

impl JsonLinesQueue {
    /// Wraps a reader.
    #[must_use]
    pub fn new(reader: impl BufRead + Send + 'static) -> Self {
        Self {
            reader: Mutex::new(Box::new(reader)),
            state: Mutex::new(QueueState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_line(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .map_err(|e| Error::failed("read_queue", e))?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.as_bytes().to_vec()));
            }
        }
    }
}

impl QueueSource for JsonLinesQueue {
    fn next_delivery(&self) -> Result<Option<Delivery>> {
        {
            let mut state = self.state();
            if let Some((body, redelivered)) = state.ready.pop_front() {
                return Ok(Some(state.hand_out(body, redelivered)));
            }
        }
        Ok(self
            .read_line()?
            .map(|body| self.state().hand_out(body, false)))
    }

    fn ack(&self, tag: u64) -> Result<()> {
        self.state().settle(tag, None)
    }

    fn nack(&self, tag: u64, requeue: bool) -> Result<()> {
        self.state().settle(tag, Some(requeue))
    }
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Consecutive store failures after which consumption stops.
    pub max_consecutive_failures: u32,
    /// Pause after a store failure before pulling again.
    pub failure_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            failure_backoff: Duration::from_millis(200),
        }
    }
}

/// Counters of a consumer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerReport {
    /// Deliveries pulled.
    pub received: usize,
    /// Events accepted and forwarded.
    pub accepted: usize,
    /// Events suppressed.
    pub duplicates: usize,
    /// Malformed deliveries dropped.
    pub rejected: usize,
    /// Deliveries put back after a store failure.
    pub requeued: usize,
    /// Accepted events the sink refused, nacked without requeue.
    pub unforwarded: usize,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Acked with this status.
    Acked(EventStatus),
    /// Nacked with requeue.
    Requeued,
    /// Claimed but not forwarded; nacked without requeue.
    Unforwarded,
}

/// Pulls deliveries from a [`QueueSource`] through an [`IngestService`].
pub struct QueueConsumer<Q: QueueSource> {
    queue: Q,
    ingest: IngestService,
    config: ConsumerConfig,
}

impl<Q: QueueSource> QueueConsumer<Q> {
    /// Creates a consumer with default settings.
    #[must_use]
    pub fn new(queue: Q, ingest: IngestService) -> Self {
        Self {
            queue,
            ingest,
            config: ConsumerConfig::default(),
        }
    }

    /// Replaces the consumer settings.
    #[must_use]
    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// The underlying queue.
    #[must_use]
    pub const fn queue(&self) -> &Q {
        &self.queue
    }

    /// Handles one delivery and settles it.
    ///
    /// # Errors
    ///
    /// Returns errors from the queue itself; decision errors are turned into
    /// a requeue, forwarding errors into a nack without requeue.
    pub fn handle(&self, delivery: &Delivery) -> Result<(DeliveryOutcome, Option<Error>)> {
        let value = match serde_json::from_slice::<serde_json::Value>(&delivery.body) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(tag = delivery.tag, error = %e, "Dropping undecodable delivery");
                self.queue.ack(delivery.tag)?;
                return Ok((DeliveryOutcome::Acked(EventStatus::Rejected), None));
            },
        };

        match self.ingest.process_one(0, value) {
            Ok(result) => {
                self.queue.ack(delivery.tag)?;
                Ok((DeliveryOutcome::Acked(result.status), None))
            },
            Err(e) if e.is_unavailable() => {
                tracing::warn!(
                    tag = delivery.tag,
                    redelivered = delivery.redelivered,
                    error = %e,
                    "Decision failed, requeueing delivery"
                );
                self.queue.nack(delivery.tag, true)?;
                Ok((DeliveryOutcome::Requeued, Some(e)))
            },
            Err(e) => {
                // The fingerprint is claimed; a redelivery would only be a duplicate.
                tracing::error!(
                    tag = delivery.tag,
                    error = %e,
                    "Accepted event not forwarded, dead-lettering delivery"
                );
                metrics::counter!("ingest_unforwarded_total").increment(1);
                self.queue.nack(delivery.tag, false)?;
                Ok((DeliveryOutcome::Unforwarded, Some(e)))
            },
        }
    }

    /// Consumes until the source is drained.
    ///
    /// # Errors
    ///
    /// Returns the last decision error once `max_consecutive_failures` store
    /// failures happen in a row, or any queue error.
    #[instrument(skip(self), fields(operation = "consume"))]
    pub fn run(&self) -> Result<ConsumerReport> {
        let mut report = ConsumerReport::default();
        let mut consecutive_failures = 0u32;

        while let Some(delivery) = self.queue.next_delivery()? {
            report.received += 1;
            match self.handle(&delivery)? {
                (DeliveryOutcome::Acked(status), _) => {
                    consecutive_failures = 0;
                    match status {
                        EventStatus::Accepted => report.accepted += 1,
                        EventStatus::Duplicate => report.duplicates += 1,
                        EventStatus::Rejected => report.rejected += 1,
                    }
                },
                (outcome @ (DeliveryOutcome::Requeued | DeliveryOutcome::Unforwarded), error) => {
                    if outcome == DeliveryOutcome::Requeued {
                        report.requeued += 1;
                    } else {
                        report.unforwarded += 1;
                    }
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.max_consecutive_failures.max(1) {
                        let error = error.unwrap_or_else(|| {
                            Error::failed("consume", "too many consecutive failures")
                        });
                        tracing::error!(
                            failures = consecutive_failures,
                            error = %error,
                            "Stopping consumer"
                        );
                        return Err(error);
                    }
                    std::thread::sleep(self.config.failure_backoff);
                },
            }
        }

        tracing::info!(
            received = report.received,
            accepted = report.accepted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            requeued = report.requeued,
            unforwarded = report.unforwarded,
            "Queue drained"
        );
        Ok(report)
    }
}
