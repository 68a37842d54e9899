//! Backing store adapters.
//!
//! Every mutating operation is a single atomic step in the backend: a Lua
//! script in Redis, a critical section under one mutex in memory. The engine
//! never caches authoritative state; it reads and mutates through this trait.
//!
//! # Layout
//!
//! Per partition the store keeps an ordered ready index (member = item ID,
//! score = effective score) and a lease set of in-flight items scored by
//! lease expiry. A global map holds item ID to serialized item, and a lease
//! record per resource holds the current token. Leasing an item rescores it
//! in the ready index to the lease expiry, so an abandoned item becomes
//! ready again on its own once the lease passes.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::lease::Lease;
use crate::queue::item::QueueItem;
use crate::queue::partition::QueuePartition;

/// A stored partition and the earliest score in its ready index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub partition: QueuePartition,
    pub earliest_ms: i64,
}

/// Result of trying to lease an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The lease was written.
    Acquired,
    /// Another holder has a valid lease.
    Contended,
    /// The item no longer exists.
    Missing,
}

/// Result of an atomic compare-and-replace on a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    Missing,
    /// The item is in flight and can't be changed.
    Leased,
    /// The stored item changed since it was read.
    Conflict,
}

/// An item that exhausted its attempts, with the last error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item: QueueItem,
    pub error: String,
    pub dead_at_ms: i64,
}

/// Atomic primitives the queue engine is built on.
///
/// Operations that resolve an in-flight item (`dequeue`, `requeue`, `dead`)
/// only apply while the caller's lease token is the stored one; they return
/// `false` when the lease was lost.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Writes an item into a partition. Re-enqueueing an existing ID
    /// overwrites payload and score (moving it if the partition changed).
    /// An item under a valid lease only has its payload replaced. Returns
    /// whether the item was newly created.
    async fn enqueue(
        &self,
        item: &QueueItem,
        partition: &QueuePartition,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Loads an item by ID.
    async fn load(&self, item_id: &str) -> Result<Option<QueueItem>, StoreError>;

    /// Returns up to `limit` items of a stored partition with score at most
    /// `until_ms`, ascending by score then ID, skipping items with a lease
    /// valid at `now_ms`.
    async fn peek(
        &self,
        partition: &QueuePartition,
        until_ms: i64,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError>;

    /// Returns partitions whose earliest score is at most `until_ms`,
    /// ascending by earliest score.
    async fn partitions(
        &self,
        until_ms: i64,
        limit: usize,
    ) -> Result<Vec<PartitionEntry>, StoreError>;

    /// Returns accounts owning at least one partition ready by `until_ms`,
    /// ascending by their earliest score.
    async fn accounts(&self, until_ms: i64, limit: usize) -> Result<Vec<Uuid>, StoreError>;

    /// Returns the ready partitions of one account.
    async fn account_partitions(
        &self,
        account_id: Uuid,
        until_ms: i64,
        limit: usize,
    ) -> Result<Vec<PartitionEntry>, StoreError>;

    /// Leases an item if it exists and holds no valid lease.
    async fn lease_item(
        &self,
        item_id: &str,
        lease: &Lease,
        now_ms: i64,
    ) -> Result<LeaseOutcome, StoreError>;

    /// Replaces a valid item lease with a later one.
    async fn extend_item(
        &self,
        item_id: &str,
        current: &Lease,
        next: &Lease,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Removes a successfully processed item.
    async fn dequeue(&self, item_id: &str, lease: &Lease) -> Result<bool, StoreError>;

    /// Writes back a failed item with its new attempt count and score and
    /// releases its lease.
    async fn requeue(&self, item: &QueueItem, lease: &Lease) -> Result<bool, StoreError>;

    /// Removes an item for good and records it in the dead-letter list,
    /// trimmed to `max_len` entries.
    async fn dead(
        &self,
        letter: &DeadLetter,
        lease: &Lease,
        max_len: usize,
    ) -> Result<bool, StoreError>;

    /// Returns the most recent dead letters, newest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError>;

    /// Rewrites the score and payload of an unleased item in place, if the
    /// stored item still equals `expected`.
    async fn update_score(
        &self,
        expected: &QueueItem,
        updated: &QueueItem,
        now_ms: i64,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Moves an unleased item into another partition, if the stored item
    /// still equals `expected`.
    async fn move_item(
        &self,
        expected: &QueueItem,
        updated: &QueueItem,
        to: &QueuePartition,
        now_ms: i64,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Writes `lease` if its resource holds no lease valid at `now_ms`.
    async fn acquire_lease(&self, lease: &Lease, now_ms: i64) -> Result<bool, StoreError>;

    /// Replaces `current` with `next` if `current` is stored and still valid.
    async fn renew_lease(
        &self,
        current: &Lease,
        next: &Lease,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Deletes `lease` if it is the stored token.
    async fn release_lease(&self, lease: &Lease) -> Result<bool, StoreError>;

    /// Returns the stored lease on a resource, valid or not.
    async fn current_lease(&self, resource: &str) -> Result<Option<Lease>, StoreError>;

    /// Drops lease-set entries whose item lease expired before `now_ms`.
    /// Visits at most `limit` partitions and returns the number removed.
    async fn sweep(&self, now_ms: i64, limit: usize) -> Result<usize, StoreError>;
}
