//! High-level metric recording.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with consistent
//! labeling. Every method is a no-op until `init_metrics()` has run.

use super::prometheus::{
    ACTIVE_WORKERS, BATCHES_IN_PROGRESS, BATCHES_TOTAL, BATCH_DURATION, DISPATCH_FALLBACKS,
    FILES_TOTAL, QUEUE_DEPTH,
};
use crate::batch::BatchStatus;

/// Metrics collector for recording batch engine metrics.
///
/// # Example
///
/// ```ignore
/// use medbatch::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_batch(BatchStatus::Completed, "distributed", 12.5);
/// collector.record_file(true);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a batch reaching a terminal status.
    ///
    /// # Arguments
    ///
    /// * `status` - Terminal batch status
    /// * `backend` - Backend that ran the batch (e.g., "distributed", "inline")
    /// * `duration_secs` - Orchestration duration in seconds
    pub fn record_batch(&self, status: BatchStatus, backend: &str, duration_secs: f64) {
        if let Some(batches_total) = BATCHES_TOTAL.get() {
            batches_total
                .with_label_values(&[status.as_str(), backend])
                .inc();
        }

        if let Some(batch_duration) = BATCH_DURATION.get() {
            batch_duration.observe(duration_secs);
        }

        tracing::trace!(
            status = %status,
            backend = backend,
            duration_secs = duration_secs,
            "Recorded batch metric"
        );
    }

    /// Record one processed file.
    pub fn record_file(&self, success: bool) {
        if let Some(files_total) = FILES_TOTAL.get() {
            let outcome = if success { "success" } else { "failure" };
            files_total.with_label_values(&[outcome]).inc();
        }
    }

    /// Record a submission routed to the in-process fallback.
    pub fn record_fallback(&self) {
        if let Some(fallbacks) = DISPATCH_FALLBACKS.get() {
            fallbacks.inc();
        }
    }

    /// Update the depth of a named queue.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }
    }

    /// Update the number of active workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    /// Increment the in-progress batch gauge.
    pub fn inc_batches_in_progress(&self) {
        if let Some(gauge) = BATCHES_IN_PROGRESS.get() {
            gauge.inc();
        }
    }

    /// Decrement the in-progress batch gauge.
    pub fn dec_batches_in_progress(&self) {
        if let Some(gauge) = BATCHES_IN_PROGRESS.get() {
            gauge.dec();
        }
    }
}
