//! Partitions: the scheduling domains items are grouped into.
//!
//! An item lands in exactly one partition, chosen once at enqueue time:
//! an explicit queue name wins, then the owning function. Items with
//! neither go to the system partition (the nil function). In account run
//! mode the dispatcher additionally groups partitions by account.
//!
//! Function partitions belong to the function's account. Named queues and
//! the system partition are shared names, so each account gets its own
//! partition under them.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::item::QueueItem;

/// The key a partition is addressed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PartitionKey {
    /// A named system queue.
    ByQueueName(String),
    /// All items of one function. The nil function is the system partition.
    ByFunction(Uuid),
    /// All partitions owned by one account. Only used for selection and peeks.
    ByAccount(Uuid),
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::ByQueueName(name) => write!(f, "q:{name}"),
            PartitionKey::ByFunction(id) if id.is_nil() => write!(f, "system"),
            PartitionKey::ByFunction(id) => write!(f, "fn:{id}"),
            PartitionKey::ByAccount(id) => write!(f, "account:{id}"),
        }
    }
}

/// A partition selector and the metadata stored for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueuePartition {
    /// Partition key.
    pub key: PartitionKey,
    /// Account owning the partition. Nil for unowned system work.
    #[serde(default)]
    pub account_id: Uuid,
}

impl QueuePartition {
    /// Partition for a named queue.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            key: PartitionKey::ByQueueName(name.into()),
            account_id: Uuid::nil(),
        }
    }

    /// Partition for a function.
    pub fn function(function_id: Uuid) -> Self {
        Self {
            key: PartitionKey::ByFunction(function_id),
            account_id: Uuid::nil(),
        }
    }

    /// The catch-all system partition for work without a function.
    pub fn system() -> Self {
        Self::function(Uuid::nil())
    }

    /// Selector covering every partition of an account.
    pub fn account(account_id: Uuid) -> Self {
        Self {
            key: PartitionKey::ByAccount(account_id),
            account_id,
        }
    }

    /// Resolves the partition of an item whose queue name is already final.
    pub fn for_item(item: &QueueItem) -> Self {
        let key = match &item.queue_name {
            Some(name) => PartitionKey::ByQueueName(name.clone()),
            None => PartitionKey::ByFunction(item.function_id),
        };
        Self {
            key,
            account_id: item.account_id(),
        }
    }

    /// Sets the owning account.
    pub fn with_account(mut self, account_id: Uuid) -> Self {
        self.account_id = account_id;
        self
    }

    /// Returns the string key used in the store.
    ///
    /// Shared names are qualified with the owning account, so two accounts
    /// enqueueing into the same named queue never share a partition.
    pub fn id(&self) -> String {
        if self.is_shared_name() && !self.account_id.is_nil() {
            format!("a:{}:{}", self.account_id, self.key)
        } else {
            self.key.to_string()
        }
    }

    fn is_shared_name(&self) -> bool {
        match &self.key {
            PartitionKey::ByQueueName(_) => true,
            PartitionKey::ByFunction(id) => id.is_nil(),
            PartitionKey::ByAccount(_) => false,
        }
    }

    /// Returns the resolved queue name, if this is a named queue partition.
    pub fn queue_name(&self) -> Option<&str> {
        match &self.key {
            PartitionKey::ByQueueName(name) => Some(name),
            _ => None,
        }
    }

    /// Returns the function this partition belongs to, if any.
    pub fn function_id(&self) -> Option<Uuid> {
        match &self.key {
            PartitionKey::ByFunction(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns whether this partition holds system rather than function work.
    pub fn is_system(&self) -> bool {
        match &self.key {
            PartitionKey::ByQueueName(_) => true,
            PartitionKey::ByFunction(id) => id.is_nil(),
            PartitionKey::ByAccount(_) => false,
        }
    }

    /// Returns whether this selector spans many stored partitions.
    pub fn is_account(&self) -> bool {
        matches!(self.key, PartitionKey::ByAccount(_))
    }
}

impl fmt::Display for QueuePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::item::{Identifier, Item, Kind};

    fn item_for(function_id: Uuid, queue_name: Option<&str>) -> QueueItem {
        let identifier = Identifier {
            account_id: Uuid::new_v4(),
            workflow_id: function_id,
            ..Default::default()
        };
        let mut item = QueueItem::from_item(Item::new(Kind::Edge, identifier));
        item.queue_name = queue_name.map(str::to_string);
        item
    }

    #[test]
    fn test_partition_for_function_item() {
        let fn_id = Uuid::new_v4();
        let item = item_for(fn_id, None);
        let partition = QueuePartition::for_item(&item);

        assert_eq!(partition.key, PartitionKey::ByFunction(fn_id));
        assert_eq!(partition.account_id, item.account_id());
        assert_eq!(partition.id(), format!("fn:{fn_id}"));
        assert!(partition.queue_name().is_none());
        assert!(!partition.is_system());
    }

    #[test]
    fn test_queue_name_wins_over_function() {
        let item = item_for(Uuid::new_v4(), Some("custom"));
        let partition = QueuePartition::for_item(&item);

        assert_eq!(partition.key, PartitionKey::ByQueueName("custom".to_string()));
        assert_eq!(partition.queue_name(), Some("custom"));
        assert!(partition.is_system());
        assert_eq!(partition.id(), format!("a:{}:q:custom", item.account_id()));
        assert_eq!(QueuePartition::queue("custom").id(), "q:custom");
    }

    #[test]
    fn test_shared_queue_name_is_scoped_per_account() {
        let first = item_for(Uuid::new_v4(), Some("shared"));
        let second = item_for(Uuid::new_v4(), Some("shared"));

        let a = QueuePartition::for_item(&first);
        let b = QueuePartition::for_item(&second);
        assert_eq!(a.queue_name(), b.queue_name());
        assert_ne!(a.id(), b.id());
        assert_eq!(a, QueuePartition::queue("shared").with_account(first.account_id()));
    }

    #[test]
    fn test_queue_and_function_keys_never_collide() {
        let fn_id = Uuid::new_v4();
        let by_name = QueuePartition::queue(fn_id.to_string());
        let by_function = QueuePartition::function(fn_id);
        assert_ne!(by_name.id(), by_function.id());
        assert_eq!(QueuePartition::system().id(), "system");
    }

    #[test]
    fn test_nil_function_is_system_partition() {
        let item = item_for(Uuid::nil(), None);
        let partition = QueuePartition::for_item(&item);

        assert_eq!(partition.key, QueuePartition::system().key);
        assert!(partition.is_system());
    }

    #[test]
    fn test_account_selector() {
        let account = Uuid::new_v4();
        let partition = QueuePartition::account(account);
        assert!(partition.is_account());
        assert_eq!(partition.id(), format!("account:{account}"));
        assert!(partition.function_id().is_none());
    }

    #[test]
    fn test_partition_serialization() {
        let partition = QueuePartition::queue("allowed").with_account(Uuid::new_v4());
        let json = serde_json::to_string(&partition).expect("serialize");
        let parsed: QueuePartition = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, partition);
    }
}
