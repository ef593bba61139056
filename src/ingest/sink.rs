//! Downstream sinks for accepted events.

use crate::models::{Event, Fingerprint};
use crate::{Error, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Receives events that passed deduplication.
pub trait EventSink: Send + Sync {
    /// Forwards one accepted event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the event cannot be delivered.
    fn publish(&self, event: &Event, fingerprint: &Fingerprint) -> Result<()>;

    /// Sink name for logs.
    fn sink_name(&self) -> &'static str;
}

/// Collects accepted events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(Fingerprint, Event)>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    #[must_use]
    pub fn events(&self) -> Vec<(Fingerprint, Event)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of published events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing was published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: &Event, fingerprint: &Fingerprint) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((fingerprint.clone(), event.clone()));
        Ok(())
    }

    fn sink_name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Serialize)]
struct Line<'a> {
    fingerprint: &'a Fingerprint,
    #[serde(flatten)]
    event: &'a Event,
}

/// Writes accepted events as newline-delimited JSON.
///
/// Each line is the event with its `fingerprint` added. Lines are flushed as
/// they are written so a downstream reader sees them immediately.
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    /// Wraps an arbitrary writer.
    #[must_use]
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Writes to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Appends to a file, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the file cannot be opened.
    pub fn append(path: &Path) -> Result<Self> {
        let file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::failed("open_sink", format!("{}: {e}", path.display())))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl EventSink for JsonLinesSink {
    fn publish(&self, event: &Event, fingerprint: &Fingerprint) -> Result<()> {
        let line = serde_json::to_string(&Line { fingerprint, event })
            .map_err(|e| Error::failed("serialize_event", e))?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}")
            .and_then(|()| writer.flush())
            .map_err(|e| Error::failed("publish", e))
    }

    fn sink_name(&self) -> &'static str {
        "jsonl"
    }
}
