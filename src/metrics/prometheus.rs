//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by fairq and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all fairq metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Items written to a shard, labeled by shard and kind.
pub static ITEMS_ENQUEUED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Resolved handler runs, labeled by outcome and kind.
///
/// Outcomes: `completed`, `retried`, `dead`, `lease_lost`.
pub static ITEMS_PROCESSED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler duration in seconds, labeled by kind.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of handlers currently running.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Item lease attempts lost to another executor.
pub static LEASE_CONTENTION_TOTAL: OnceLock<Counter> = OnceLock::new();

/// 1 while this process holds the sequential lease.
pub static SEQUENTIAL_LEASE_HELD: OnceLock<Gauge> = OnceLock::new();

/// Abandoned lease-set entries removed by the sequential holder.
pub static SWEPT_ENTRIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry but leave the
/// already-published metrics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let items_enqueued_total = CounterVec::new(
        Opts::new("fairq_items_enqueued_total", "Total number of items enqueued"),
        &["shard", "kind"],
    )?;

    let items_processed_total = CounterVec::new(
        Opts::new(
            "fairq_items_processed_total",
            "Total number of handler runs by outcome",
        ),
        &["outcome", "kind"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new("fairq_job_duration_seconds", "Handler duration in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["kind"],
    )?;

    let jobs_in_progress = Gauge::new(
        "fairq_jobs_in_progress",
        "Number of handlers currently running",
    )?;

    let lease_contention_total = Counter::new(
        "fairq_lease_contention_total",
        "Item lease attempts lost to another executor",
    )?;

    let sequential_lease_held = Gauge::new(
        "fairq_sequential_lease_held",
        "Whether this process holds the sequential lease",
    )?;

    let swept_entries_total = Counter::new(
        "fairq_swept_entries_total",
        "Abandoned lease-set entries removed",
    )?;

    registry.register(Box::new(items_enqueued_total.clone()))?;
    registry.register(Box::new(items_processed_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(lease_contention_total.clone()))?;
    registry.register(Box::new(sequential_lease_held.clone()))?;
    registry.register(Box::new(swept_entries_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = ITEMS_ENQUEUED_TOTAL.set(items_enqueued_total);
    let _ = ITEMS_PROCESSED_TOTAL.set(items_processed_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = LEASE_CONTENTION_TOTAL.set(lease_contention_total);
    let _ = SEQUENTIAL_LEASE_HELD.set(sequential_lease_held);
    let _ = SWEPT_ENTRIES_TOTAL.set(swept_entries_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry is not initialized or
/// encoding fails.
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
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = ITEMS_ENQUEUED_TOTAL.get() {
            counter.with_label_values(&["default", "edge"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("fairq_items_enqueued_total"));
    }
}
