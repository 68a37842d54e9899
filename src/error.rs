//! Error types for fairq operations.
//!
//! Errors are split by how the engine reacts to them:
//! - Validation of items submitted to `enqueue` (never retried)
//! - Backing store and transport failures (retried at the call site)
//! - Lease contention and lease loss (expected under concurrency)
//! - Queue-level errors returned from the public API

use thiserror::Error;

use crate::queue::ConfigError;

/// Errors raised when an item submitted for enqueueing is malformed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("max_attempts must be greater than 0, got {0}")]
    InvalidMaxAttempts(u32),

    #[error("attempt count {attempt} exceeds max_attempts {max_attempts}")]
    AttemptsExhausted { attempt: u32, max_attempts: u32 },

    #[error("Queue name cannot be empty")]
    EmptyQueueName,

    #[error("Invalid queue name '{0}': must not contain whitespace or ':'")]
    InvalidQueueName(String),

    #[error("Function ID {function_id} does not match workflow ID {workflow_id}")]
    FunctionMismatch {
        function_id: uuid::Uuid,
        workflow_id: uuid::Uuid,
    },

    #[error("Priority factor {factor}s is outside the allowed range of ±{max}s")]
    PriorityFactorOutOfRange { factor: i64, max: i64 },
}

/// Errors raised by the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to (de)serialize stored data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A script returned a value the adapter does not understand.
    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),

    /// A stored lease token could not be decoded.
    #[error("Malformed lease token '{0}'")]
    MalformedLease(String),
}

/// Errors raised by lease operations.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Another holder owns an unexpired lease on the resource.
    #[error("Resource '{0}' is already leased")]
    AlreadyHeld(String),

    /// The resource no longer exists where the caller expected it.
    #[error("Resource '{0}' not found")]
    NotFound(String),

    /// The caller's lease expired or was taken over.
    #[error("Lease on '{0}' was lost")]
    LeaseLost(String),

    /// The store failed while processing the lease operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LeaseError {
    /// Returns whether this error is the expected result of a lost race.
    pub fn is_contention(&self) -> bool {
        matches!(self, LeaseError::AlreadyHeld(_) | LeaseError::NotFound(_))
    }
}

/// Top-level errors returned by the queue API.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid item: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Shard '{0}' is not registered with this queue")]
    UnknownShard(String),

    #[error("Item '{0}' not found")]
    ItemNotFound(String),

    #[error("Item '{0}' is currently leased")]
    ItemLeased(String),

    #[error("Item '{0}' kept changing during the update")]
    Conflict(String),

    #[error("Queue is already running")]
    AlreadyRunning,

    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// Marker error a handler returns to skip any remaining attempts.
///
/// ```rust,ignore
/// return Err(NonRetriableError::new("payload is not valid").into());
/// ```
#[derive(Debug, Error)]
#[error("{message}")]
pub struct NonRetriableError {
    message: String,
}

impl NonRetriableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns whether `err` (or anything in its chain) is non-retriable.
    pub fn is_in(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| cause.is::<NonRetriableError>())
    }
}
