//! Item definitions for the queue.
//!
//! This module defines the job envelope stored by the queue:
//!
//! - `Item`: the job data handed to handlers
//! - `QueueItem`: the envelope with identity and scheduling fields
//! - `Kind`: the item kind, used for kind-to-queue routing
//! - `Identifier`: account, workspace and workflow identifiers

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ValidationError;

/// Default maximum number of attempts for an item.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Largest priority factor, in seconds, accepted in either direction.
pub const PRIORITY_FACTOR_MAX: i64 = 600;

/// Hashes a caller-supplied identifier into a stable item ID.
///
/// The hash is case-insensitive: `"Job-1"` and `"job-1"` map to the same ID.
pub fn hash_id(id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.to_lowercase().as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..12])
}

/// Kind of work an item represents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Kind {
    Start,
    #[default]
    Edge,
    EdgeError,
    Sleep,
    Pause,
    Debounce,
    Custom(String),
}

impl Kind {
    pub fn as_str(&self) -> &str {
        match self {
            Kind::Start => "start",
            Kind::Edge => "edge",
            Kind::EdgeError => "edge-error",
            Kind::Sleep => "sleep",
            Kind::Pause => "pause",
            Kind::Debounce => "debounce",
            Kind::Custom(kind) => kind,
        }
    }
}

impl From<String> for Kind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "start" => Kind::Start,
            "edge" => Kind::Edge,
            "edge-error" => Kind::EdgeError,
            "sleep" => Kind::Sleep,
            "pause" => Kind::Pause,
            "debounce" => Kind::Debounce,
            _ => Kind::Custom(value),
        }
    }
}

impl From<&str> for Kind {
    fn from(value: &str) -> Self {
        Kind::from(value.to_string())
    }
}

impl From<Kind> for String {
    fn from(kind: Kind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers tying an item to its owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    /// Account that owns the work.
    #[serde(default)]
    pub account_id: Uuid,
    /// Workspace (environment) within the account.
    #[serde(default)]
    pub workspace_id: Uuid,
    /// Function or workflow the item belongs to.
    #[serde(default)]
    pub workflow_id: Uuid,
    /// Run the item belongs to, if any.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    /// Seconds subtracted from the ready time when scoring the item.
    #[serde(default)]
    pub priority_factor: Option<i64>,
}

/// Job data handed to handlers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Kind of the item.
    #[serde(default)]
    pub kind: Kind,
    /// Workspace the item belongs to.
    #[serde(default)]
    pub workspace_id: Uuid,
    /// Number of attempts already made.
    #[serde(default)]
    pub attempt: u32,
    /// Maximum number of attempts. `None` uses the queue default.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Owner identifiers.
    #[serde(default)]
    pub identifier: Identifier,
    /// Explicit queue name. When set the item is routed to that queue.
    #[serde(default)]
    pub queue_name: Option<String>,
    /// Opaque caller payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Item {
    /// Creates an item of the given kind for a workflow.
    pub fn new(kind: impl Into<Kind>, identifier: Identifier) -> Self {
        Self {
            kind: kind.into(),
            workspace_id: identifier.workspace_id,
            identifier,
            ..Default::default()
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Sets an explicit queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = Some(name.into());
        self
    }

    /// Sets the priority factor, in seconds.
    pub fn with_priority_factor(mut self, seconds: i64) -> Self {
        self.identifier.priority_factor = Some(seconds);
        self
    }

    /// Sets the caller payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Returns the effective maximum attempts given a queue default.
    pub fn max_attempts_or(&self, default: u32) -> u32 {
        self.max_attempts.unwrap_or(default)
    }

    /// Returns the priority factor in seconds (zero when unset).
    pub fn priority_factor(&self) -> i64 {
        self.identifier.priority_factor.unwrap_or(0)
    }
}

/// The envelope stored in the queue for every item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Item ID. A caller-supplied identifier is replaced by its hash on
    /// enqueue; an empty ID is generated.
    #[serde(default)]
    pub id: String,
    /// Function the item belongs to. Nil for system work.
    #[serde(default)]
    pub function_id: Uuid,
    /// Workspace the item belongs to.
    #[serde(default)]
    pub workspace_id: Uuid,
    /// Explicit queue name for system partitions.
    #[serde(default)]
    pub queue_name: Option<String>,
    /// Semantic not-before time, in epoch milliseconds.
    #[serde(default)]
    pub at_ms: i64,
    /// Effective score (ready time minus priority factor), in epoch milliseconds.
    #[serde(default)]
    pub score_ms: i64,
    /// When the item was first enqueued, in epoch milliseconds.
    #[serde(default)]
    pub enqueued_at_ms: i64,
    /// Job data.
    pub data: Item,
}

impl QueueItem {
    /// Wraps job data in an envelope, taking function and workspace from it.
    pub fn from_item(item: Item) -> Self {
        Self {
            id: String::new(),
            function_id: item.identifier.workflow_id,
            workspace_id: item.workspace_id,
            queue_name: item.queue_name.clone(),
            at_ms: 0,
            score_ms: 0,
            enqueued_at_ms: 0,
            data: item,
        }
    }

    /// Sets a caller-supplied identifier. It is hashed when enqueued.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Returns the account owning this item.
    pub fn account_id(&self) -> Uuid {
        self.data.identifier.account_id
    }

    /// Returns the semantic ready time.
    pub fn at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.at_ms)
    }

    /// Returns when the item was first enqueued.
    pub fn enqueued_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.enqueued_at_ms)
    }

    /// Returns the maximum attempts given a queue default.
    pub fn max_attempts(&self, default: u32) -> u32 {
        self.data.max_attempts_or(default)
    }

    /// Returns whether another attempt is allowed after a failure.
    pub fn should_retry(&self, default_max_attempts: u32) -> bool {
        self.data.attempt < self.max_attempts(default_max_attempts)
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self, default_max_attempts: u32) -> u32 {
        self.max_attempts(default_max_attempts)
            .saturating_sub(self.data.attempt)
    }

    /// Checks the invariants an item must satisfy before it is stored.
    pub fn validate(&self, default_max_attempts: u32) -> Result<(), ValidationError> {
        let max_attempts = self.max_attempts(default_max_attempts);
        if max_attempts == 0 {
            return Err(ValidationError::InvalidMaxAttempts(max_attempts));
        }
        if self.data.attempt >= max_attempts {
            return Err(ValidationError::AttemptsExhausted {
                attempt: self.data.attempt,
                max_attempts,
            });
        }

        let workflow_id = self.data.identifier.workflow_id;
        if !self.function_id.is_nil() && !workflow_id.is_nil() && self.function_id != workflow_id {
            return Err(ValidationError::FunctionMismatch {
                function_id: self.function_id,
                workflow_id,
            });
        }

        for name in [&self.queue_name, &self.data.queue_name].into_iter().flatten() {
            validate_queue_name(name)?;
        }

        let factor = self.data.priority_factor();
        if factor.abs() > PRIORITY_FACTOR_MAX {
            return Err(ValidationError::PriorityFactorOutOfRange {
                factor,
                max: PRIORITY_FACTOR_MAX,
            });
        }

        Ok(())
    }
}

/// Checks that a queue name can be used as a partition key.
pub fn validate_queue_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyQueueName);
    }
    if name.chars().any(|c| c.is_whitespace() || c == ':') {
        return Err(ValidationError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

/// Computes the effective score of an item ready at `at_ms`.
pub fn effective_score(at_ms: i64, priority_factor_secs: i64) -> i64 {
    at_ms.saturating_sub(priority_factor_secs.saturating_mul(1000))
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Options for a single enqueue call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOpts {
    /// Forces the item into this queue, overriding everything else.
    pub force_queue_name: Option<String>,
}

impl EnqueueOpts {
    pub fn force_queue(name: impl Into<String>) -> Self {
        Self {
            force_queue_name: Some(name.into()),
        }
    }
}

/// Receipt returned from a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    /// Hashed item ID.
    pub item_id: String,
    /// Key of the partition the item landed in.
    pub partition: String,
    /// Effective score, in epoch milliseconds.
    pub score_ms: i64,
    /// False when an existing item with the same ID was overwritten.
    pub created: bool,
}
