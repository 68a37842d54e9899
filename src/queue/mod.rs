//! The queue facade: enqueueing, inspection and the run loop.
//!
//! A [`Queue`] owns a primary shard (served by its worker pool), any number
//! of extra shards that can be enqueued into by name, the validated
//! configuration and the observer hooks.
//!
//! ```rust,ignore
//! let queue = Queue::builder(QueueShard::redis("default", url, "{queue}").await?)
//!     .config(QueueConfig::from_env()?)
//!     .observer(Arc::new(MetricsCollector::new()))
//!     .build()?;
//!
//! queue.enqueue(item, Utc::now(), EnqueueOpts::default()).await?;
//! queue.run(cancel, handler).await?;
//! ```

pub mod config;
pub mod handler;
pub mod item;
pub mod observer;
pub mod partition;
pub mod shard;

pub use config::{ConfigError, QueueConfig, RunMode};
pub use handler::{JobContext, JobHandler, RunInfo, RunResult};
pub use item::{
    hash_id, EnqueueOpts, EnqueueReceipt, Identifier, Item, Kind, QueueItem, DEFAULT_MAX_ATTEMPTS,
};
pub use observer::{Observers, QueueObserver};
pub use partition::{PartitionKey, QueuePartition};
pub use shard::{KeyGenerator, QueueShard, ShardKind};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{QueueError, ValidationError};
use crate::lease::{now_ms, Lease};
use crate::scheduler::{PoolStats, WorkerPool};
use crate::store::{DeadLetter, UpdateOutcome};
use item::{effective_score, validate_queue_name, PRIORITY_FACTOR_MAX};

/// How often a compare-and-replace update is retried after a conflict.
const UPDATE_ATTEMPTS: usize = 3;

/// Builds a [`Queue`].
pub struct QueueBuilder {
    primary: QueueShard,
    extra: Vec<QueueShard>,
    config: QueueConfig,
    observers: Observers,
}

impl QueueBuilder {
    pub fn new(primary: QueueShard) -> Self {
        Self {
            primary,
            extra: Vec::new(),
            config: QueueConfig::default(),
            observers: Observers::new(),
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers an extra shard items can be enqueued into by name.
    pub fn shard(mut self, shard: QueueShard) -> Self {
        self.extra.push(shard);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Validates the configuration and builds the queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Config` for invalid settings or duplicate shard
    /// names.
    pub fn build(self) -> Result<Queue, QueueError> {
        self.config.validate()?;

        let mut shards = HashMap::new();
        for shard in std::iter::once(&self.primary).chain(self.extra.iter()) {
            if shards.insert(shard.name.clone(), shard.clone()).is_some() {
                return Err(ConfigError::ValidationFailed(format!(
                    "shard '{}' is registered twice",
                    shard.name
                ))
                .into());
            }
        }

        let config = Arc::new(self.config);
        let pool = WorkerPool::new(
            self.primary.clone(),
            Arc::clone(&config),
            self.observers.clone(),
        );

        Ok(Queue {
            primary: self.primary,
            shards,
            config,
            observers: self.observers,
            pool,
        })
    }
}

/// A fair, at-least-once job queue.
pub struct Queue {
    primary: QueueShard,
    shards: HashMap<String, QueueShard>,
    config: Arc<QueueConfig>,
    observers: Observers,
    pool: WorkerPool,
}

impl Queue {
    pub fn builder(primary: QueueShard) -> QueueBuilder {
        QueueBuilder::new(primary)
    }

    /// Creates a queue with no observers.
    pub fn new(primary: QueueShard, config: QueueConfig) -> Result<Self, QueueError> {
        Self::builder(primary).config(config).build()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Returns the shard the run loop serves.
    pub fn primary_shard(&self) -> &QueueShard {
        &self.primary
    }

    /// Looks up a registered shard by name.
    pub fn shard(&self, name: &str) -> Option<&QueueShard> {
        self.shards.get(name)
    }

    /// Enqueues job data into the primary shard, ready at `at`.
    pub async fn enqueue(
        &self,
        item: Item,
        at: DateTime<Utc>,
        opts: EnqueueOpts,
    ) -> Result<EnqueueReceipt, QueueError> {
        self.enqueue_item(&self.primary.name, QueueItem::from_item(item), at, opts)
            .await
    }

    /// Enqueues an envelope into a named shard.
    ///
    /// The partition is resolved from the forced queue name, then the item's
    /// own queue name, then the kind-to-queue map, then the function. A
    /// caller-supplied ID is hashed; an empty one is generated. Enqueueing
    /// the same ID again overwrites the stored item.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Validation` for malformed items,
    /// `QueueError::UnknownShard` for unregistered shards and
    /// `QueueError::Store` when the write fails.
    pub async fn enqueue_item(
        &self,
        shard: &str,
        mut item: QueueItem,
        at: DateTime<Utc>,
        opts: EnqueueOpts,
    ) -> Result<EnqueueReceipt, QueueError> {
        let shard = self
            .shards
            .get(shard)
            .ok_or_else(|| QueueError::UnknownShard(shard.to_string()))?;

        let raw_id = if item.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            std::mem::take(&mut item.id)
        };
        item.id = hash_id(&raw_id);

        if item.function_id.is_nil() {
            item.function_id = item.data.identifier.workflow_id;
        }
        if item.workspace_id.is_nil() {
            item.workspace_id = item.data.workspace_id;
        }
        item.queue_name = self.resolve_queue_name(&item, &opts);
        item.validate(self.config.default_max_attempts)?;

        let now = now_ms();
        item.at_ms = at.timestamp_millis();
        item.score_ms = effective_score(item.at_ms, item.data.priority_factor());
        if item.enqueued_at_ms == 0 {
            item.enqueued_at_ms = now;
        }

        let partition = QueuePartition::for_item(&item);
        let created = shard.store().enqueue(&item, &partition, now).await?;

        debug!(
            shard = %shard.name,
            item_id = %item.id,
            partition = %partition,
            score_ms = item.score_ms,
            created = created,
            "Enqueued item"
        );
        self.observers.on_enqueued(&shard.name, &partition, &item);

        Ok(EnqueueReceipt {
            item_id: item.id,
            partition: partition.id(),
            score_ms: item.score_ms,
            created,
        })
    }

    fn resolve_queue_name(&self, item: &QueueItem, opts: &EnqueueOpts) -> Option<String> {
        opts.force_queue_name
            .clone()
            .or_else(|| item.queue_name.clone())
            .or_else(|| item.data.queue_name.clone())
            .or_else(|| self.config.queue_for_kind(&item.data.kind).map(str::to_string))
    }

    /// Returns up to `limit` unleased items of a partition ready by `until`,
    /// ascending by score. An account selector merges all of the account's
    /// partitions.
    pub async fn peek(
        &self,
        partition: &QueuePartition,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let store = self.primary.store();
        let until_ms = until.timestamp_millis();
        let now = now_ms();

        if !partition.is_account() {
            return Ok(store.peek(partition, until_ms, now, limit).await?);
        }

        let entries = store
            .account_partitions(partition.account_id, until_ms, self.config.partition_limit)
            .await?;
        let mut items = Vec::new();
        for entry in entries {
            items.extend(store.peek(&entry.partition, until_ms, now, limit).await?);
        }
        items.sort_by(|a, b| a.score_ms.cmp(&b.score_ms).then_with(|| a.id.cmp(&b.id)));
        items.truncate(limit);
        Ok(items)
    }

    /// Sets a new priority factor on an unleased item and rescores it.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ItemNotFound`, `QueueError::ItemLeased` while a
    /// handler holds the item, or a validation error for factors outside
    /// ±600 seconds.
    pub async fn reprioritize(
        &self,
        item_id: &str,
        priority_factor_secs: i64,
    ) -> Result<QueueItem, QueueError> {
        if priority_factor_secs.abs() > PRIORITY_FACTOR_MAX {
            return Err(ValidationError::PriorityFactorOutOfRange {
                factor: priority_factor_secs,
                max: PRIORITY_FACTOR_MAX,
            }
            .into());
        }

        let store = self.primary.store();
        for _ in 0..UPDATE_ATTEMPTS {
            let expected = self.load(item_id).await?;
            let mut updated = expected.clone();
            updated.data.identifier.priority_factor = Some(priority_factor_secs);
            updated.score_ms = effective_score(updated.at_ms, priority_factor_secs);

            match store.update_score(&expected, &updated, now_ms()).await? {
                UpdateOutcome::Updated => return Ok(updated),
                outcome => self.check_update(item_id, outcome)?,
            }
        }
        Err(QueueError::Conflict(item_id.to_string()))
    }

    /// Moves an unleased item into the named queue partition.
    ///
    /// # Errors
    ///
    /// Same as [`Queue::reprioritize`], plus a validation error for invalid
    /// queue names.
    pub async fn move_to_queue(
        &self,
        item_id: &str,
        queue_name: &str,
    ) -> Result<QueueItem, QueueError> {
        validate_queue_name(queue_name)?;

        let store = self.primary.store();
        for _ in 0..UPDATE_ATTEMPTS {
            let expected = self.load(item_id).await?;
            let mut updated = expected.clone();
            updated.queue_name = Some(queue_name.to_string());
            updated.data.queue_name = Some(queue_name.to_string());
            let to = QueuePartition::for_item(&updated);

            match store.move_item(&expected, &updated, &to, now_ms()).await? {
                UpdateOutcome::Updated => {
                    info!(item_id = %item_id, queue = %queue_name, "Moved item");
                    return Ok(updated);
                }
                outcome => self.check_update(item_id, outcome)?,
            }
        }
        Err(QueueError::Conflict(item_id.to_string()))
    }

    async fn load(&self, item_id: &str) -> Result<QueueItem, QueueError> {
        self.primary
            .store()
            .load(item_id)
            .await?
            .ok_or_else(|| QueueError::ItemNotFound(item_id.to_string()))
    }

    /// Maps a failed update to an error, or `Ok` if it should be retried.
    fn check_update(&self, item_id: &str, outcome: UpdateOutcome) -> Result<(), QueueError> {
        match outcome {
            UpdateOutcome::Missing => Err(QueueError::ItemNotFound(item_id.to_string())),
            UpdateOutcome::Leased => Err(QueueError::ItemLeased(item_id.to_string())),
            UpdateOutcome::Conflict | UpdateOutcome::Updated => {
                debug!(item_id = %item_id, "Item changed during update, retrying");
                Ok(())
            }
        }
    }

    /// Returns the most recent dead letters of the primary shard.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.primary.store().dead_letters(limit).await?)
    }

    /// Runs the worker pool until `cancel` fires and in-flight handlers
    /// have returned.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::AlreadyRunning` if this queue is already running.
    pub async fn run<H: JobHandler>(
        &self,
        cancel: CancellationToken,
        handler: H,
    ) -> Result<(), QueueError> {
        self.pool.run(cancel, Arc::new(handler)).await
    }

    /// Returns the sequential lease if this instance currently holds it.
    pub fn sequential_lease(&self) -> Option<Lease> {
        self.pool.sequential_lease()
    }

    /// Returns the worker pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lease::LeaseManager;

    fn queue() -> Queue {
        Queue::builder(QueueShard::memory("default"))
            .config(QueueConfig::default().with_kind_queue("debounce", "debounces"))
            .shard(QueueShard::memory("secondary"))
            .build()
            .expect("valid queue")
    }

    fn function_item(function_id: Uuid) -> Item {
        Item::new(
            Kind::Edge,
            Identifier {
                account_id: Uuid::new_v4(),
                workflow_id: function_id,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_partition_resolution_order() {
        let queue = queue();
        let function_id = Uuid::new_v4();
        let now = Utc::now();

        let receipt = queue
            .enqueue(function_item(function_id), now, EnqueueOpts::default())
            .await
            .expect("enqueue");
        assert_eq!(receipt.partition, format!("fn:{function_id}"));

        let mut debounce = function_item(function_id);
        debounce.kind = Kind::Debounce;
        let scope = format!("a:{}", debounce.identifier.account_id);
        let receipt = queue
            .enqueue(debounce.clone(), now, EnqueueOpts::default())
            .await
            .expect("enqueue");
        assert_eq!(receipt.partition, format!("{scope}:q:debounces"));

        let receipt = queue
            .enqueue(
                debounce.clone().with_queue_name("explicit"),
                now,
                EnqueueOpts::default(),
            )
            .await
            .expect("enqueue");
        assert_eq!(receipt.partition, format!("{scope}:q:explicit"));

        let receipt = queue
            .enqueue(
                debounce.with_queue_name("explicit"),
                now,
                EnqueueOpts::force_queue("forced"),
            )
            .await
            .expect("enqueue");
        assert_eq!(receipt.partition, format!("{scope}:q:forced"));

        let receipt = queue
            .enqueue(Item::default(), now, EnqueueOpts::default())
            .await
            .expect("enqueue");
        assert_eq!(receipt.partition, "system");
    }

    #[tokio::test]
    async fn test_same_id_overwrites() {
        let queue = queue();
        let now = Utc::now();
        let item = QueueItem::from_item(Item::default().with_payload(serde_json::json!(1)))
            .with_id("Job-1");

        let first = queue
            .enqueue_item("default", item.clone(), now, EnqueueOpts::default())
            .await
            .expect("enqueue");
        assert!(first.created);
        assert_eq!(first.item_id, hash_id("job-1"));

        let mut again = item.with_id("JOB-1");
        again.data.payload = serde_json::json!(2);
        let second = queue
            .enqueue_item("default", again, now, EnqueueOpts::default())
            .await
            .expect("enqueue");
        assert!(!second.created);
        assert_eq!(second.item_id, first.item_id);

        let items = queue
            .peek(&QueuePartition::system(), now, 10)
            .await
            .expect("peek");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].data.payload, serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_enqueue_validation_and_shards() {
        let queue = queue();
        let now = Utc::now();

        let err = queue
            .enqueue(Item::default().with_max_attempts(0), now, EnqueueOpts::default())
            .await
            .expect_err("zero attempts");
        assert!(matches!(
            err,
            QueueError::Validation(ValidationError::InvalidMaxAttempts(0))
        ));

        let err = queue
            .enqueue(Item::default(), now, EnqueueOpts::force_queue("bad name"))
            .await
            .expect_err("bad queue name");
        assert!(matches!(err, QueueError::Validation(_)));

        let err = queue
            .enqueue_item(
                "missing",
                QueueItem::from_item(Item::default()),
                now,
                EnqueueOpts::default(),
            )
            .await
            .expect_err("unknown shard");
        assert!(matches!(err, QueueError::UnknownShard(_)));

        queue
            .enqueue_item(
                "secondary",
                QueueItem::from_item(Item::default()),
                now,
                EnqueueOpts::default(),
            )
            .await
            .expect("secondary shard");
        let secondary = queue.shard("secondary").expect("registered");
        assert_eq!(
            secondary
                .store()
                .partitions(i64::MAX, 10)
                .await
                .expect("partitions")
                .len(),
            1
        );
        assert!(queue
            .peek(&QueuePartition::system(), now, 10)
            .await
            .expect("peek")
            .is_empty());
    }

    #[tokio::test]
    async fn test_priority_factor_orders_earlier() {
        let queue = queue();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);

        let plain = queue
            .enqueue(Item::default(), now, EnqueueOpts::default())
            .await
            .expect("enqueue");
        let boosted = queue
            .enqueue(
                Item::default().with_priority_factor(60),
                later,
                EnqueueOpts::default(),
            )
            .await
            .expect("enqueue");
        assert!(boosted.score_ms < plain.score_ms);

        let items = queue
            .peek(&QueuePartition::system(), later, 10)
            .await
            .expect("peek");
        assert_eq!(items[0].id, boosted.item_id);
        assert_eq!(items[0].at_ms, later.timestamp_millis());
    }

    #[tokio::test]
    async fn test_reprioritize_and_move() {
        let queue = queue();
        let now = Utc::now();
        let receipt = queue
            .enqueue(Item::default(), now, EnqueueOpts::default())
            .await
            .expect("enqueue");

        let updated = queue
            .reprioritize(&receipt.item_id, 120)
            .await
            .expect("reprioritize");
        assert_eq!(updated.score_ms, receipt.score_ms - 120_000);

        let err = queue
            .reprioritize(&receipt.item_id, 601)
            .await
            .expect_err("factor out of range");
        assert!(matches!(err, QueueError::Validation(_)));

        let moved = queue
            .move_to_queue(&receipt.item_id, "elsewhere")
            .await
            .expect("move");
        assert_eq!(moved.queue_name.as_deref(), Some("elsewhere"));
        let items = queue
            .peek(&QueuePartition::queue("elsewhere"), now, 10)
            .await
            .expect("peek");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].score_ms, updated.score_ms);

        let err = queue
            .reprioritize("missing", 0)
            .await
            .expect_err("missing item");
        assert!(matches!(err, QueueError::ItemNotFound(_)));
    }

    #[tokio::test]
    async fn test_leased_item_cannot_be_updated() {
        let queue = queue();
        let receipt = queue
            .enqueue(Item::default(), Utc::now(), EnqueueOpts::default())
            .await
            .expect("enqueue");

        let leases = LeaseManager::new(queue.primary_shard().store().clone(), "test");
        leases
            .lease_item(&receipt.item_id, Duration::from_secs(10))
            .await
            .expect("lease");

        let err = queue
            .move_to_queue(&receipt.item_id, "elsewhere")
            .await
            .expect_err("leased");
        assert!(matches!(err, QueueError::ItemLeased(_)));
    }

    #[tokio::test]
    async fn test_account_peek_merges_partitions() {
        let queue = queue();
        let account_id = Uuid::new_v4();
        let now = Utc::now();

        for (offset, function_id) in [(2, Uuid::new_v4()), (1, Uuid::new_v4())] {
            let item = Item::new(
                Kind::Edge,
                Identifier {
                    account_id,
                    workflow_id: function_id,
                    ..Default::default()
                },
            );
            queue
                .enqueue(
                    item,
                    now - chrono::Duration::seconds(offset),
                    EnqueueOpts::default(),
                )
                .await
                .expect("enqueue");
        }
        queue
            .enqueue(function_item(Uuid::new_v4()), now, EnqueueOpts::default())
            .await
            .expect("other account");

        let items = queue
            .peek(&QueuePartition::account(account_id), now, 10)
            .await
            .expect("peek");
        assert_eq!(items.len(), 2);
        assert!(items[0].score_ms <= items[1].score_ms);
        assert!(items.iter().all(|i| i.account_id() == account_id));
    }

    #[tokio::test]
    async fn test_accounts_sharing_a_queue_name_stay_separate() {
        let queue = queue();
        let now = Utc::now();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        for account_id in [first, second] {
            let item = Item::new(
                Kind::Edge,
                Identifier {
                    account_id,
                    ..Default::default()
                },
            );
            queue
                .enqueue(item, now, EnqueueOpts::force_queue("shared"))
                .await
                .expect("enqueue");
        }

        for account_id in [first, second] {
            let items = queue
                .peek(&QueuePartition::account(account_id), now, 10)
                .await
                .expect("peek");
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].account_id(), account_id);

            let scoped = QueuePartition::queue("shared").with_account(account_id);
            let items = queue.peek(&scoped, now, 10).await.expect("peek");
            assert_eq!(items.len(), 1);
        }

        let accounts = queue
            .primary_shard()
            .store()
            .accounts(i64::MAX, 10)
            .await
            .expect("accounts");
        assert_eq!(accounts.len(), 2);
        assert!(accounts.contains(&first) && accounts.contains(&second));
    }

    #[test]
    fn test_duplicate_shards_rejected() {
        let result = Queue::builder(QueueShard::memory("default"))
            .shard(QueueShard::memory("default"))
            .build();
        assert!(matches!(result, Err(QueueError::Config(_))));
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let result = Queue::new(
            QueueShard::memory("default"),
            QueueConfig::default().with_num_workers(0),
        );
        assert!(matches!(result, Err(QueueError::Config(_))));
    }
}
