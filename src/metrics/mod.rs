//! Metrics module for Prometheus-based monitoring.
//!
//! # Example
//!
//! ```ignore
//! use medbatch::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_file(true);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, BATCHES_IN_PROGRESS, BATCHES_TOTAL, BATCH_DURATION, DISPATCH_FALLBACKS,
    FILES_TOTAL, QUEUE_DEPTH, REGISTRY,
};
