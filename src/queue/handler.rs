//! The caller-supplied job handler and what it receives per invocation.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::item::Item;

/// Per-invocation context handed to the handler.
///
/// Carries a job ID unique to this invocation and the item's original
/// enqueue time. The cancellation token is a child of the run token: it
/// fires when the queue shuts down or when the executor loses the item's
/// lease.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: Uuid,
    item_id: String,
    enqueued_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(
        item_id: impl Into<String>,
        enqueued_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            item_id: item_id.into(),
            enqueued_at,
            cancel,
        }
    }

    /// Unique identifier of this invocation.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// ID of the item being processed.
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    /// When the item was first enqueued.
    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the invocation should stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Scheduling facts about the current attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    /// Attempts already made before this one (0 on the first run).
    pub attempt: u32,
    pub max_attempts: u32,
    /// Time between the item becoming ready and being leased.
    pub latency: Duration,
    /// Shard the item was leased from.
    pub shard: String,
    /// Partition key the item was leased from.
    pub partition: String,
}

impl RunInfo {
    /// Returns whether this is the last allowed attempt.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt + 1 >= self.max_attempts
    }
}

/// Successful handler outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    pub output: Option<serde_json::Value>,
}

impl RunResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_output(output: serde_json::Value) -> Self {
        Self {
            output: Some(output),
        }
    }
}

/// Business logic run for each leased item.
///
/// Returning an error (or panicking) counts as a failed attempt. Wrap the
/// error in [`crate::error::NonRetriableError`] to skip remaining attempts.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext, info: RunInfo, item: Item) -> anyhow::Result<RunResult>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext, RunInfo, Item) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<RunResult>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: JobContext,
        info: RunInfo,
        item: Item,
    ) -> anyhow::Result<RunResult> {
        (self)(ctx, info, item).await
    }
}
