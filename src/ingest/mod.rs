//! Ingestion surfaces.
//!
//! Everything in front of the deduplication coordinator: batch ingestion, the
//! queue consumer, the optional HTTP endpoint and the downstream sinks that
//! receive accepted events.

#[cfg(feature = "http")]
pub mod http;
mod queue;
mod service;
mod sink;

pub use queue::{
    ConsumerConfig, ConsumerReport, Delivery, DeliveryOutcome, JsonLinesQueue, MemoryQueue,
    QueueConsumer, QueueSource,
};
pub use service::{EventResult, EventStatus, IngestReport, IngestService};
pub use sink::{EventSink, JsonLinesSink, MemorySink};
