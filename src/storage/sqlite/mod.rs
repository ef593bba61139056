//! Shared `SQLite` infrastructure for storage backends.
//!
//! - `connection`: `Mutex<Connection>` lock acquisition and pragma configuration
//! - `metrics`: per-operation counters and latency histograms

mod connection;
mod metrics;

pub use connection::{DEFAULT_BUSY_TIMEOUT, acquire_lock, configure_connection, open_connection};
pub use metrics::{record_operation_metrics, status_label};
