//! Redis-backed store.
//!
//! Every mutation runs as one Lua script so concurrent workers on many nodes
//! can't interleave partial updates. Reads that need no atomicity (loading
//! an item, listing partitions, dead letters) are plain commands.
//!
//! # Key Layout
//!
//! All keys share the shard prefix `P` (default `{queue}`):
//!
//! - `P:item`: hash of item ID to serialized item
//! - `P:item:partition`: hash of item ID to partition key
//! - `P:queue:<pkey>`: ready index of a partition
//! - `P:inprogress:<pkey>`: lease set of a partition, scored by lease expiry
//! - `P:lease:<resource>`: lease token of a resource (items use `item:<id>`)
//! - `P:partition`, `P:partition:account`: partition metadata
//! - `P:partition:index`: partition key scored by its earliest item
//! - `P:accounts`, `P:accounts:<id>:partitions`: the same, grouped by account
//! - `P:dead`: bounded dead-letter list, newest first

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use super::{DeadLetter, LeaseOutcome, PartitionEntry, QueueStore, UpdateOutcome};
use crate::error::StoreError;
use crate::lease::Lease;
use crate::queue::item::QueueItem;
use crate::queue::partition::QueuePartition;
use crate::queue::shard::KeyGenerator;

/// Lease keys outlive their token's expiry by this much before Redis drops
/// them, so a holder resolving right at expiry still finds its token.
const LEASE_KEY_GRACE_MS: i64 = 1_000;

const PRELUDE: &str = include_str!("lua/prelude.lua");

struct Scripts {
    enqueue: Script,
    peek: Script,
    lease: Script,
    extend: Script,
    dequeue: Script,
    requeue: Script,
    dead: Script,
    replace: Script,
    acquire_lease: Script,
    renew_lease: Script,
    release_lease: Script,
    sweep: Script,
}

impl Scripts {
    fn load() -> Self {
        let build = |body: &str| Script::new(&format!("{PRELUDE}\n{body}"));
        Self {
            enqueue: build(include_str!("lua/enqueue.lua")),
            peek: build(include_str!("lua/peek.lua")),
            lease: build(include_str!("lua/lease.lua")),
            extend: build(include_str!("lua/extend.lua")),
            dequeue: build(include_str!("lua/dequeue.lua")),
            requeue: build(include_str!("lua/requeue.lua")),
            dead: build(include_str!("lua/dead.lua")),
            replace: build(include_str!("lua/replace.lua")),
            acquire_lease: build(include_str!("lua/acquire_lease.lua")),
            renew_lease: build(include_str!("lua/renew_lease.lua")),
            release_lease: build(include_str!("lua/release_lease.lua")),
            sweep: build(include_str!("lua/sweep.lua")),
        }
    }
}

fn key_ttl_ms(expires_at_ms: i64, now_ms: i64) -> i64 {
    expires_at_ms.saturating_sub(now_ms).max(0) + LEASE_KEY_GRACE_MS
}

fn update_outcome(code: i64) -> Result<UpdateOutcome, StoreError> {
    match code {
        1 => Ok(UpdateOutcome::Updated),
        0 => Ok(UpdateOutcome::Leased),
        -1 => Ok(UpdateOutcome::Missing),
        -2 => Ok(UpdateOutcome::Conflict),
        other => Err(StoreError::UnexpectedReply(format!("replace returned {other}"))),
    }
}

/// Store backed by a Redis server.
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    keys: KeyGenerator,
    scripts: Scripts,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `keys` - Key namespace of the shard
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, keys: KeyGenerator) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, keys))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, keys: KeyGenerator) -> Self {
        Self {
            redis,
            keys,
            scripts: Scripts::load(),
        }
    }

    /// Returns the key namespace.
    pub fn keys(&self) -> &KeyGenerator {
        &self.keys
    }

    /// Deletes every key of this shard. Intended for tests.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}:*", self.keys.prefix());
        let keys: Vec<String> = conn.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: usize = conn.del(&keys).await?;
        Ok(removed)
    }

    async fn partition_entries(
        &self,
        index_key: &str,
        until_ms: i64,
        limit: usize,
    ) -> Result<Vec<PartitionEntry>, StoreError> {
        let mut conn = self.redis.clone();
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let scored: Vec<(String, f64)> = conn
            .zrangebyscore_limit_withscores(index_key, "-inf", until_ms, 0, count)
            .await?;
        if scored.is_empty() {
            return Ok(Vec::new());
        }

        let pkeys: Vec<&str> = scored.iter().map(|(pkey, _)| pkey.as_str()).collect();
        let metas: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.keys.partition_meta())
            .arg(&pkeys)
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(scored.len());
        for ((_, score), meta) in scored.iter().zip(metas) {
            // Metadata disappears with the partition's last item.
            let Some(meta) = meta else { continue };
            entries.push(PartitionEntry {
                partition: serde_json::from_str(&meta)?,
                earliest_ms: *score as i64,
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn enqueue(
        &self,
        item: &QueueItem,
        partition: &QueuePartition,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let item_json = serde_json::to_string(item)?;
        let partition_json = serde_json::to_string(partition)?;
        let mut conn = self.redis.clone();

        let created: i64 = self
            .scripts
            .enqueue
            .arg(self.keys.prefix())
            .arg(&item.id)
            .arg(item_json)
            .arg(item.score_ms)
            .arg(partition.id())
            .arg(partition_json)
            .arg(partition.account_id.to_string())
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(created == 1)
    }

    async fn load(&self, item_id: &str) -> Result<Option<QueueItem>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.hget(self.keys.item_hash(), item_id).await?;
        raw.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn peek(
        &self,
        partition: &QueuePartition,
        until_ms: i64,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let raw: Vec<String> = self
            .scripts
            .peek
            .arg(self.keys.prefix())
            .arg(partition.id())
            .arg(until_ms)
            .arg(now_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    async fn partitions(
        &self,
        until_ms: i64,
        limit: usize,
    ) -> Result<Vec<PartitionEntry>, StoreError> {
        self.partition_entries(&self.keys.partition_index(), until_ms, limit)
            .await
    }

    async fn accounts(&self, until_ms: i64, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        let mut conn = self.redis.clone();
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let raw: Vec<String> = conn
            .zrangebyscore_limit(self.keys.accounts(), "-inf", until_ms, 0, count)
            .await?;

        raw.iter()
            .map(|id| {
                Uuid::parse_str(id)
                    .map_err(|_| StoreError::UnexpectedReply(format!("invalid account id '{id}'")))
            })
            .collect()
    }

    async fn account_partitions(
        &self,
        account_id: Uuid,
        until_ms: i64,
        limit: usize,
    ) -> Result<Vec<PartitionEntry>, StoreError> {
        self.partition_entries(&self.keys.account_partitions(account_id), until_ms, limit)
            .await
    }

    async fn lease_item(
        &self,
        item_id: &str,
        lease: &Lease,
        now_ms: i64,
    ) -> Result<LeaseOutcome, StoreError> {
        let mut conn = self.redis.clone();
        let code: i64 = self
            .scripts
            .lease
            .arg(self.keys.prefix())
            .arg(item_id)
            .arg(lease.token())
            .arg(lease.expires_at_ms)
            .arg(now_ms)
            .arg(key_ttl_ms(lease.expires_at_ms, now_ms))
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(LeaseOutcome::Acquired),
            0 => Ok(LeaseOutcome::Contended),
            -1 => Ok(LeaseOutcome::Missing),
            other => Err(StoreError::UnexpectedReply(format!("lease returned {other}"))),
        }
    }

    async fn extend_item(
        &self,
        item_id: &str,
        current: &Lease,
        next: &Lease,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let extended: i64 = self
            .scripts
            .extend
            .arg(self.keys.prefix())
            .arg(item_id)
            .arg(current.token())
            .arg(next.token())
            .arg(next.expires_at_ms)
            .arg(now_ms)
            .arg(key_ttl_ms(next.expires_at_ms, now_ms))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn dequeue(&self, item_id: &str, lease: &Lease) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .scripts
            .dequeue
            .arg(self.keys.prefix())
            .arg(item_id)
            .arg(lease.token())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn requeue(&self, item: &QueueItem, lease: &Lease) -> Result<bool, StoreError> {
        let item_json = serde_json::to_string(item)?;
        let mut conn = self.redis.clone();
        let requeued: i64 = self
            .scripts
            .requeue
            .arg(self.keys.prefix())
            .arg(&item.id)
            .arg(lease.token())
            .arg(item_json)
            .arg(item.score_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(requeued == 1)
    }

    async fn dead(
        &self,
        letter: &DeadLetter,
        lease: &Lease,
        max_len: usize,
    ) -> Result<bool, StoreError> {
        let letter_json = serde_json::to_string(letter)?;
        let mut conn = self.redis.clone();
        let moved: i64 = self
            .scripts
            .dead
            .arg(self.keys.prefix())
            .arg(&letter.item.id)
            .arg(lease.token())
            .arg(letter_json)
            .arg(max_len.max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let raw: Vec<String> = conn.lrange(self.keys.dead(), 0, stop).await?;

        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    async fn update_score(
        &self,
        expected: &QueueItem,
        updated: &QueueItem,
        now_ms: i64,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut conn = self.redis.clone();
        let code: i64 = self
            .scripts
            .replace
            .arg(self.keys.prefix())
            .arg(&expected.id)
            .arg(serde_json::to_string(expected)?)
            .arg(serde_json::to_string(updated)?)
            .arg(updated.score_ms)
            .arg("")
            .arg("")
            .arg("")
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        update_outcome(code)
    }

    async fn move_item(
        &self,
        expected: &QueueItem,
        updated: &QueueItem,
        to: &QueuePartition,
        now_ms: i64,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut conn = self.redis.clone();
        let code: i64 = self
            .scripts
            .replace
            .arg(self.keys.prefix())
            .arg(&expected.id)
            .arg(serde_json::to_string(expected)?)
            .arg(serde_json::to_string(updated)?)
            .arg(updated.score_ms)
            .arg(to.id())
            .arg(serde_json::to_string(to)?)
            .arg(to.account_id.to_string())
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        update_outcome(code)
    }

    async fn acquire_lease(&self, lease: &Lease, now_ms: i64) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let acquired: i64 = self
            .scripts
            .acquire_lease
            .arg(self.keys.prefix())
            .arg(&lease.resource)
            .arg(lease.token())
            .arg(now_ms)
            .arg(key_ttl_ms(lease.expires_at_ms, now_ms))
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn renew_lease(
        &self,
        current: &Lease,
        next: &Lease,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let renewed: i64 = self
            .scripts
            .renew_lease
            .arg(self.keys.prefix())
            .arg(&current.resource)
            .arg(current.token())
            .arg(next.token())
            .arg(now_ms)
            .arg(key_ttl_ms(next.expires_at_ms, now_ms))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release_lease(&self, lease: &Lease) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let released: i64 = self
            .scripts
            .release_lease
            .arg(self.keys.prefix())
            .arg(&lease.resource)
            .arg(lease.token())
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn current_lease(&self, resource: &str) -> Result<Option<Lease>, StoreError> {
        let mut conn = self.redis.clone();
        let token: Option<String> = conn.get(self.keys.lease(resource)).await?;
        token.map(|t| Lease::parse(resource, &t)).transpose()
    }

    async fn sweep(&self, now_ms: i64, limit: usize) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .scripts
            .sweep
            .arg(self.keys.prefix())
            .arg(now_ms)
            .arg(limit.max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(usize::try_from(removed).unwrap_or(0))
    }
}
