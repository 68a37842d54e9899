//! fairq: a fair, partitioned, at-least-once job queue on Redis.
//!
//! Items live in per-function or per-named-queue partitions. Workers rotate
//! through ready partitions and lease individual items while their handler
//! runs. Failures are retried with exponential backoff until the item is dead.
//! One process at a time holds the sequential lease and sweeps abandoned
//! item leases.

pub mod cli;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use error::{LeaseError, NonRetriableError, QueueError, StoreError, ValidationError};
pub use queue::{
    EnqueueOpts, Item, JobContext, JobHandler, Queue, QueueBuilder, QueueConfig, QueueItem,
    QueuePartition, QueueShard, RunInfo, RunResult,
};
