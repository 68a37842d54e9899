//! Queue observer that records Prometheus metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics behind the
//! [`QueueObserver`] hooks. Register it on a queue builder after calling
//! [`init_metrics`](super::init_metrics); hooks are no-ops until then.

use std::time::Duration;

use super::prometheus::{
    ITEMS_ENQUEUED_TOTAL, ITEMS_PROCESSED_TOTAL, JOBS_IN_PROGRESS, JOB_DURATION,
    LEASE_CONTENTION_TOTAL, SEQUENTIAL_LEASE_HELD, SWEPT_ENTRIES_TOTAL,
};
use crate::queue::item::QueueItem;
use crate::queue::observer::QueueObserver;
use crate::queue::partition::QueuePartition;

/// Metrics collector for recording queue operational metrics.
///
/// ```ignore
/// use fairq::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let queue = Queue::builder(shard)
///     .observer(Arc::new(MetricsCollector::new()))
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Note: metrics must be initialized with `init_metrics()` before
    /// anything is recorded.
    pub fn new() -> Self {
        Self
    }

    /// Record one resolved handler run.
    ///
    /// `outcome` is one of `completed`, `retried`, `dead` or `lease_lost`.
    pub fn record_outcome(&self, outcome: &str, kind: &str) {
        if let Some(processed) = ITEMS_PROCESSED_TOTAL.get() {
            processed.with_label_values(&[outcome, kind]).inc();
        }

        tracing::trace!(outcome = outcome, kind = kind, "Recorded outcome metric");
    }

    /// Record an enqueued item.
    pub fn record_enqueued(&self, shard: &str, kind: &str) {
        if let Some(enqueued) = ITEMS_ENQUEUED_TOTAL.get() {
            enqueued.with_label_values(&[shard, kind]).inc();
        }
    }

    pub fn record_job_duration(&self, kind: &str, duration: Duration) {
        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[kind])
                .observe(duration.as_secs_f64());
        }
    }

    /// Increment the count of jobs in progress by 1.
    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    /// Decrement the count of jobs in progress by 1.
    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }

    pub fn record_contention(&self) {
        if let Some(contention) = LEASE_CONTENTION_TOTAL.get() {
            contention.inc();
        }
    }

    pub fn set_sequential_lease_held(&self, held: bool) {
        if let Some(gauge) = SEQUENTIAL_LEASE_HELD.get() {
            gauge.set(if held { 1.0 } else { 0.0 });
        }

        tracing::trace!(held = held, "Updated sequential lease metric");
    }

    pub fn record_swept(&self, removed: usize) {
        if let Some(swept) = SWEPT_ENTRIES_TOTAL.get() {
            swept.inc_by(removed as f64);
        }
    }
}

impl QueueObserver for MetricsCollector {
    fn on_enqueued(&self, shard: &str, _partition: &QueuePartition, item: &QueueItem) {
        self.record_enqueued(shard, item.data.kind.as_str());
    }

    fn on_started(&self, _partition: &str, _item: &QueueItem) {
        self.inc_jobs_in_progress();
    }

    fn on_finished(&self, _partition: &str, item: &QueueItem, duration: Duration) {
        self.dec_jobs_in_progress();
        self.record_job_duration(item.data.kind.as_str(), duration);
    }

    fn on_completed(&self, _partition: &str, item: &QueueItem, _duration: Duration) {
        self.record_outcome("completed", item.data.kind.as_str());
    }

    fn on_retried(&self, _partition: &str, item: &QueueItem, _delay: Duration, _error: &str) {
        self.record_outcome("retried", item.data.kind.as_str());
    }

    fn on_dead(&self, _partition: &str, item: &QueueItem, _error: &str) {
        self.record_outcome("dead", item.data.kind.as_str());
    }

    fn on_contention(&self, _partition: &str) {
        self.record_contention();
    }

    fn on_lease_lost(&self, _partition: &str, item: &QueueItem) {
        self.record_outcome("lease_lost", item.data.kind.as_str());
    }

    fn on_sequential_lease(&self, held: bool) {
        self.set_sequential_lease_held(held);
    }

    fn on_swept(&self, removed: usize) {
        self.record_swept(removed);
    }
}
