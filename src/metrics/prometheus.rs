//! Prometheus metrics registration and export.
//!
//! Defines every metric medbatch records and provides functions for
//! initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all medbatch metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Batches that reached a terminal status, labeled by status and backend.
pub static BATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Files processed, labeled by outcome (success/failure).
pub static FILES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall-clock duration of an orchestrator invocation in seconds.
pub static BATCH_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Number of jobs in queue, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of batches currently being orchestrated in this process.
pub static BATCHES_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Submissions that fell back to the in-process backend.
pub static DISPATCH_FALLBACKS: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before this is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Batch metrics
    let batches_total = CounterVec::new(
        Opts::new(
            "medbatch_batches_total",
            "Total number of batches that reached a terminal status",
        ),
        &["status", "backend"],
    )?;

    let files_total = CounterVec::new(
        Opts::new("medbatch_files_total", "Total number of files processed"),
        &["outcome"],
    )?;

    let batch_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "medbatch_batch_duration_seconds",
            "Batch orchestration duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0]),
    )?;

    let batches_in_progress = Gauge::new(
        "medbatch_batches_in_progress",
        "Number of batches currently being processed",
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("medbatch_queue_depth", "Number of jobs in queue"),
        &["queue_name"],
    )?;

    let dispatch_fallbacks = Counter::new(
        "medbatch_dispatch_fallbacks_total",
        "Total submissions routed to the in-process fallback",
    )?;

    // Worker metrics
    let active_workers = Gauge::new("medbatch_active_workers", "Number of active workers")?;

    registry.register(Box::new(batches_total.clone()))?;
    registry.register(Box::new(files_total.clone()))?;
    registry.register(Box::new(batch_duration.clone()))?;
    registry.register(Box::new(batches_in_progress.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(dispatch_fallbacks.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = BATCHES_TOTAL.set(batches_total);
    let _ = FILES_TOTAL.set(files_total);
    let _ = BATCH_DURATION.set(batch_duration);
    let _ = BATCHES_IN_PROGRESS.set(batches_in_progress);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = DISPATCH_FALLBACKS.set(dispatch_fallbacks);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        // First call should succeed or metrics already initialized
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = DISPATCH_FALLBACKS.get() {
            counter.inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        if REGISTRY.get().is_some() {
            assert!(metrics.contains("medbatch_dispatch_fallbacks_total"));
        }
    }
}
