//! Dispatch: partition selection, the worker pool and retry handling.
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │   store (ready partitions)   │
//!            └──────────────┬───────────────┘
//!                           │ PartitionSelector
//!         ┌─────────────────┼─────────────────┐
//!         ▼                 ▼                 ▼
//!    ┌─────────┐       ┌─────────┐       ┌─────────┐
//!    │ Worker 1│       │ Worker 2│       │ Worker N│   lease item, run handler
//!    └────┬────┘       └────┬────┘       └────┬────┘
//!         └─────────────────┼─────────────────┘
//!                           ▼
//!                  RetryController: dequeue | requeue at now + backoff | dead
//! ```
//!
//! One extra task per pool keeps the sequential lease and, while it holds
//! it, sweeps abandoned lease-set entries.

pub mod retry;
pub mod selector;
pub mod worker_pool;

pub use retry::{BackoffPolicy, Resolution, RetryController};
pub use selector::PartitionSelector;
pub use worker_pool::{PoolStats, Worker, WorkerPool};
