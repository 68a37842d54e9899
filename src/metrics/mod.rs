//! Metrics module for Prometheus-based monitoring.
//!
//! Collects queue throughput, outcomes, handler durations, lease contention
//! and sequential-lease ownership.
//!
//! # Example
//!
//! ```ignore
//! use fairq::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // Register the collector as a queue observer
//! let queue = Queue::builder(shard)
//!     .observer(Arc::new(MetricsCollector::new()))
//!     .build()?;
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ITEMS_ENQUEUED_TOTAL, ITEMS_PROCESSED_TOTAL, JOBS_IN_PROGRESS, JOB_DURATION,
    LEASE_CONTENTION_TOTAL, REGISTRY, SEQUENTIAL_LEASE_HELD, SWEPT_ENTRIES_TOTAL,
};
