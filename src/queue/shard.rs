//! Shards: named backing stores the engine addresses state through.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{MemoryStore, QueueStore, RedisStore};

/// Default key prefix. The braces form a Redis Cluster hash tag so every
/// key of a shard lands in the same slot.
pub const DEFAULT_KEY_PREFIX: &str = "{queue}";

/// Name of the shard a queue uses when none is given.
pub const DEFAULT_SHARD_NAME: &str = "default";

/// Kind of backing store behind a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    Redis,
    Memory,
}

impl fmt::Display for ShardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKind::Redis => write!(f, "redis"),
            ShardKind::Memory => write!(f, "memory"),
        }
    }
}

/// Builds the store keys of a shard from its prefix.
///
/// Only keys read outside the store scripts are built here. Per-partition
/// indexes (`queue:<pkey>`, `inprogress:<pkey>`) and item bookkeeping hashes
/// are derived inside the scripts from the same prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGenerator {
    prefix: String,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hash of item ID to serialized item.
    pub fn item_hash(&self) -> String {
        format!("{}:item", self.prefix)
    }

    /// Lease record of a resource.
    pub fn lease(&self, resource: &str) -> String {
        format!("{}:lease:{}", self.prefix, resource)
    }

    pub fn partition_meta(&self) -> String {
        format!("{}:partition", self.prefix)
    }

    pub fn partition_index(&self) -> String {
        format!("{}:partition:index", self.prefix)
    }

    pub fn accounts(&self) -> String {
        format!("{}:accounts", self.prefix)
    }

    pub fn account_partitions(&self, account_id: Uuid) -> String {
        format!("{}:accounts:{}:partitions", self.prefix, account_id)
    }

    pub fn dead(&self) -> String {
        format!("{}:dead", self.prefix)
    }
}

/// A named backing store. Constructed once at startup and shared read-only.
#[derive(Clone)]
pub struct QueueShard {
    pub name: String,
    pub kind: ShardKind,
    pub keys: KeyGenerator,
    store: Arc<dyn QueueStore>,
}

impl fmt::Debug for QueueShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueShard")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("prefix", &self.keys.prefix())
            .finish()
    }
}

impl QueueShard {
    /// Wraps an existing store.
    pub fn new(
        name: impl Into<String>,
        kind: ShardKind,
        keys: KeyGenerator,
        store: Arc<dyn QueueStore>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            keys,
            store,
        }
    }

    /// Creates a shard backed by a fresh in-memory store.
    pub fn memory(name: impl Into<String>) -> Self {
        Self::new(
            name,
            ShardKind::Memory,
            KeyGenerator::default(),
            Arc::new(MemoryStore::new()),
        )
    }

    /// Connects a shard to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn redis(
        name: impl Into<String>,
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let keys = KeyGenerator::new(prefix);
        let store = RedisStore::connect(redis_url, keys.clone()).await?;
        Ok(Self::new(name, ShardKind::Redis, keys, Arc::new(store)))
    }

    /// Returns the store behind this shard.
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeyGenerator::default();
        assert_eq!(keys.item_hash(), "{queue}:item");
        assert_eq!(keys.partition_meta(), "{queue}:partition");
        assert_eq!(keys.partition_index(), "{queue}:partition:index");
        assert_eq!(keys.lease("sequential"), "{queue}:lease:sequential");
        assert_eq!(keys.dead(), "{queue}:dead");

        let account = Uuid::nil();
        assert_eq!(
            keys.account_partitions(account),
            format!("{{queue}}:accounts:{account}:partitions")
        );
    }

    #[test]
    fn test_memory_shard() {
        let shard = QueueShard::memory("test");
        assert_eq!(shard.name, "test");
        assert_eq!(shard.kind, ShardKind::Memory);
        assert_eq!(shard.kind.to_string(), "memory");
        assert!(format!("{shard:?}").contains("{queue}"));
    }
}
