//! Shared metrics recording for `SQLite` backends.

use std::time::Instant;

/// Records `storage_operations_total` and `storage_operation_duration_ms` for
/// one backend call.
///
/// ```ignore
/// let start = Instant::now();
/// let result = insert_rows(&conn, entries);
/// let status = if result.is_ok() { "success" } else { "error" };
/// record_operation_metrics("sqlite", "insert_batch", start, status);
/// ```
pub fn record_operation_metrics(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "storage_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "storage_operation_duration_ms",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Maps a result to the status label used by [`record_operation_metrics`].
pub const fn status_label<T, E>(result: &std::result::Result<T, E>) -> &'static str {
    if result.is_ok() { "success" } else { "error" }
}
