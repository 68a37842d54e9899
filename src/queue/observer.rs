//! Observer hooks for queue lifecycle events.
//!
//! Hooks are synchronous and must not block: they run inline on executor
//! tasks. Every hook has a no-op default so observers implement only what
//! they need.

use std::sync::Arc;
use std::time::Duration;

use super::item::QueueItem;
use super::partition::QueuePartition;

/// Receives queue lifecycle events.
pub trait QueueObserver: Send + Sync {
    fn on_enqueued(&self, _shard: &str, _partition: &QueuePartition, _item: &QueueItem) {}

    /// An item was leased and its handler is about to run.
    fn on_started(&self, _partition: &str, _item: &QueueItem) {}

    /// The handler returned, panicked or was abandoned after `duration`.
    /// Fires before the outcome is resolved.
    fn on_finished(&self, _partition: &str, _item: &QueueItem, _duration: Duration) {}

    fn on_completed(&self, _partition: &str, _item: &QueueItem, _duration: Duration) {}

    /// A failed item was rescheduled after `delay`.
    fn on_retried(&self, _partition: &str, _item: &QueueItem, _delay: Duration, _error: &str) {}

    /// An item exhausted its attempts or failed permanently.
    fn on_dead(&self, _partition: &str, _item: &QueueItem, _error: &str) {}

    /// A lease attempt lost a race against another executor.
    fn on_contention(&self, _partition: &str) {}

    /// An executor lost an item lease while the handler was running.
    fn on_lease_lost(&self, _partition: &str, _item: &QueueItem) {}

    fn on_sequential_lease(&self, _held: bool) {}

    /// The sequential holder removed abandoned lease-set entries.
    fn on_swept(&self, _removed: usize) {}
}

/// Fans events out to every registered observer.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Vec<Arc<dyn QueueObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn QueueObserver>) {
        self.inner.push(observer);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl QueueObserver for Observers {
    fn on_enqueued(&self, shard: &str, partition: &QueuePartition, item: &QueueItem) {
        self.inner
            .iter()
            .for_each(|o| o.on_enqueued(shard, partition, item));
    }

    fn on_started(&self, partition: &str, item: &QueueItem) {
        self.inner.iter().for_each(|o| o.on_started(partition, item));
    }

    fn on_finished(&self, partition: &str, item: &QueueItem, duration: Duration) {
        self.inner
            .iter()
            .for_each(|o| o.on_finished(partition, item, duration));
    }

    fn on_completed(&self, partition: &str, item: &QueueItem, duration: Duration) {
        self.inner
            .iter()
            .for_each(|o| o.on_completed(partition, item, duration));
    }

    fn on_retried(&self, partition: &str, item: &QueueItem, delay: Duration, error: &str) {
        self.inner
            .iter()
            .for_each(|o| o.on_retried(partition, item, delay, error));
    }

    fn on_dead(&self, partition: &str, item: &QueueItem, error: &str) {
        self.inner
            .iter()
            .for_each(|o| o.on_dead(partition, item, error));
    }

    fn on_contention(&self, partition: &str) {
        self.inner.iter().for_each(|o| o.on_contention(partition));
    }

    fn on_lease_lost(&self, partition: &str, item: &QueueItem) {
        self.inner
            .iter()
            .for_each(|o| o.on_lease_lost(partition, item));
    }

    fn on_sequential_lease(&self, held: bool) {
        self.inner.iter().for_each(|o| o.on_sequential_lease(held));
    }

    fn on_swept(&self, removed: usize) {
        self.inner.iter().for_each(|o| o.on_swept(removed));
    }
}
