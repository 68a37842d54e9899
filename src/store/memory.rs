//! In-process store.
//!
//! Implements the same contract as the Redis store with one mutex standing
//! in for script atomicity. Used by tests and single-process deployments.

use std::collections::{BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DeadLetter, LeaseOutcome, PartitionEntry, QueueStore, UpdateOutcome};
use crate::error::StoreError;
use crate::lease::{item_resource, Lease};
use crate::queue::item::QueueItem;
use crate::queue::partition::QueuePartition;

#[derive(Default)]
struct MemoryState {
    items: HashMap<String, QueueItem>,
    /// Item ID to partition key.
    item_partition: HashMap<String, String>,
    /// Item ID to its score in the ready index.
    scores: HashMap<String, i64>,
    /// Partition key to ready index.
    ready: HashMap<String, BTreeSet<(i64, String)>>,
    /// Partition key to lease set (item ID to lease expiry).
    in_progress: HashMap<String, HashMap<String, i64>>,
    partitions: HashMap<String, QueuePartition>,
    leases: HashMap<String, Lease>,
    /// Items re-enqueued while leased, with the partition they resolved to.
    superseded: HashMap<String, QueuePartition>,
    dead: VecDeque<DeadLetter>,
}

impl MemoryState {
    fn valid_lease(&self, resource: &str, now_ms: i64) -> Option<&Lease> {
        self.leases
            .get(resource)
            .filter(|lease| lease.is_valid_at(now_ms))
    }

    fn holds(&self, lease: &Lease) -> bool {
        self.leases
            .get(&lease.resource)
            .is_some_and(|stored| stored.token() == lease.token())
    }

    fn set_score(&mut self, pkey: &str, item_id: &str, score: i64) {
        let index = self.ready.entry(pkey.to_string()).or_default();
        if let Some(old) = self.scores.insert(item_id.to_string(), score) {
            index.remove(&(old, item_id.to_string()));
        }
        index.insert((score, item_id.to_string()));
    }

    /// Removes an item from its partition's indexes, returning the partition key.
    fn unlink(&mut self, item_id: &str) -> Option<String> {
        let pkey = self.item_partition.remove(item_id)?;
        if let Some(score) = self.scores.remove(item_id) {
            if let Some(index) = self.ready.get_mut(&pkey) {
                index.remove(&(score, item_id.to_string()));
            }
        }
        if let Some(set) = self.in_progress.get_mut(&pkey) {
            set.remove(item_id);
        }
        self.refresh_partition(&pkey);
        Some(pkey)
    }

    fn remove(&mut self, item_id: &str) {
        self.unlink(item_id);
        self.items.remove(item_id);
        self.leases.remove(&item_resource(item_id));
        self.superseded.remove(item_id);
    }

    /// Makes a superseded item ready again under its stored payload.
    ///
    /// Returns false when the item was not re-enqueued during its lease.
    fn release_superseded(&mut self, item_id: &str, lease: &Lease) -> bool {
        let Some(partition) = self.superseded.remove(item_id) else {
            return false;
        };
        self.leases.remove(&lease.resource);
        if let Some(item) = self.items.get(item_id).cloned() {
            if let Some(pkey) = self.item_partition.get(item_id).cloned() {
                if let Some(set) = self.in_progress.get_mut(&pkey) {
                    set.remove(item_id);
                }
            }
            self.upsert(&item, &partition);
        }
        true
    }

    fn upsert(&mut self, item: &QueueItem, partition: &QueuePartition) {
        self.superseded.remove(&item.id);
        let pkey = partition.id();
        if self.item_partition.get(&item.id) != Some(&pkey) {
            self.unlink(&item.id);
        }
        self.items.insert(item.id.clone(), item.clone());
        self.item_partition.insert(item.id.clone(), pkey.clone());
        self.partitions.insert(pkey.clone(), partition.clone());
        self.set_score(&pkey, &item.id, item.score_ms);
    }

    fn refresh_partition(&mut self, pkey: &str) {
        let empty = self.ready.get(pkey).map_or(true, BTreeSet::is_empty);
        if empty {
            self.ready.remove(pkey);
            self.in_progress.remove(pkey);
            self.partitions.remove(pkey);
        }
    }

    fn earliest(&self, pkey: &str) -> Option<i64> {
        self.ready
            .get(pkey)
            .and_then(|index| index.first())
            .map(|(score, _)| *score)
    }

    fn ready_partitions(&self, until_ms: i64) -> Vec<PartitionEntry> {
        let mut entries: Vec<PartitionEntry> = self
            .partitions
            .iter()
            .filter_map(|(pkey, partition)| {
                let earliest_ms = self.earliest(pkey)?;
                (earliest_ms <= until_ms).then(|| PartitionEntry {
                    partition: partition.clone(),
                    earliest_ms,
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.earliest_ms
                .cmp(&b.earliest_ms)
                .then_with(|| a.partition.id().cmp(&b.partition.id()))
        });
        entries
    }

    fn replace(
        &mut self,
        expected: &QueueItem,
        updated: &QueueItem,
        to: Option<&QueuePartition>,
        now_ms: i64,
    ) -> UpdateOutcome {
        let Some(current) = self.items.get(&expected.id) else {
            return UpdateOutcome::Missing;
        };
        if current != expected {
            return UpdateOutcome::Conflict;
        }
        if self
            .valid_lease(&item_resource(&expected.id), now_ms)
            .is_some()
        {
            return UpdateOutcome::Leased;
        }

        let partition = match to {
            Some(partition) => partition.clone(),
            None => {
                let stored = self
                    .item_partition
                    .get(&expected.id)
                    .and_then(|pkey| self.partitions.get(pkey))
                    .cloned();
                match stored {
                    Some(partition) => partition,
                    None => return UpdateOutcome::Missing,
                }
            }
        };
        self.leases.remove(&item_resource(&expected.id));
        self.upsert(updated, &partition);
        UpdateOutcome::Updated
    }
}

/// Store keeping all queue state in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored items.
    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns the number of lease-set entries across all partitions.
    pub async fn in_progress_len(&self) -> usize {
        self.state
            .lock()
            .await
            .in_progress
            .values()
            .map(HashMap::len)
            .sum()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(
        &self,
        item: &QueueItem,
        partition: &QueuePartition,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let created = !state.items.contains_key(&item.id);
        if !created
            && state
                .valid_lease(&item_resource(&item.id), now_ms)
                .is_some()
        {
            state.items.insert(item.id.clone(), item.clone());
            state.superseded.insert(item.id.clone(), partition.clone());
            return Ok(false);
        }
        state.upsert(item, partition);
        Ok(created)
    }

    async fn load(&self, item_id: &str) -> Result<Option<QueueItem>, StoreError> {
        Ok(self.state.lock().await.items.get(item_id).cloned())
    }

    async fn peek(
        &self,
        partition: &QueuePartition,
        until_ms: i64,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let state = self.state.lock().await;
        let Some(index) = state.ready.get(&partition.id()) else {
            return Ok(Vec::new());
        };

        let items = index
            .iter()
            .take_while(|(score, _)| *score <= until_ms)
            .filter(|(_, id)| state.valid_lease(&item_resource(id), now_ms).is_none())
            .filter_map(|(_, id)| state.items.get(id).cloned())
            .take(limit)
            .collect();
        Ok(items)
    }

    async fn partitions(
        &self,
        until_ms: i64,
        limit: usize,
    ) -> Result<Vec<PartitionEntry>, StoreError> {
        let mut entries = self.state.lock().await.ready_partitions(until_ms);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn accounts(&self, until_ms: i64, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        let entries = self.state.lock().await.ready_partitions(until_ms);
        let mut accounts: Vec<Uuid> = Vec::new();
        for entry in entries {
            if !accounts.contains(&entry.partition.account_id) {
                accounts.push(entry.partition.account_id);
            }
            if accounts.len() >= limit {
                break;
            }
        }
        Ok(accounts)
    }

    async fn account_partitions(
        &self,
        account_id: Uuid,
        until_ms: i64,
        limit: usize,
    ) -> Result<Vec<PartitionEntry>, StoreError> {
        let entries = self.state.lock().await.ready_partitions(until_ms);
        Ok(entries
            .into_iter()
            .filter(|entry| entry.partition.account_id == account_id)
            .take(limit)
            .collect())
    }

    async fn lease_item(
        &self,
        item_id: &str,
        lease: &Lease,
        now_ms: i64,
    ) -> Result<LeaseOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(pkey) = state.item_partition.get(item_id).cloned() else {
            return Ok(LeaseOutcome::Missing);
        };
        if state.valid_lease(&lease.resource, now_ms).is_some() {
            return Ok(LeaseOutcome::Contended);
        }

        state.leases.insert(lease.resource.clone(), lease.clone());
        state.superseded.remove(item_id);
        state.set_score(&pkey, item_id, lease.expires_at_ms);
        state
            .in_progress
            .entry(pkey)
            .or_default()
            .insert(item_id.to_string(), lease.expires_at_ms);
        Ok(LeaseOutcome::Acquired)
    }

    async fn extend_item(
        &self,
        item_id: &str,
        current: &Lease,
        next: &Lease,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.holds(current) || !current.is_valid_at(now_ms) {
            return Ok(false);
        }
        let Some(pkey) = state.item_partition.get(item_id).cloned() else {
            return Ok(false);
        };

        state.leases.insert(next.resource.clone(), next.clone());
        state.set_score(&pkey, item_id, next.expires_at_ms);
        state
            .in_progress
            .entry(pkey)
            .or_default()
            .insert(item_id.to_string(), next.expires_at_ms);
        Ok(true)
    }

    async fn dequeue(&self, item_id: &str, lease: &Lease) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.holds(lease) {
            return Ok(false);
        }
        if !state.release_superseded(item_id, lease) {
            state.remove(item_id);
        }
        Ok(true)
    }

    async fn requeue(&self, item: &QueueItem, lease: &Lease) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.holds(lease) {
            return Ok(false);
        }
        if state.release_superseded(&item.id, lease) {
            return Ok(true);
        }
        let Some(pkey) = state.item_partition.get(&item.id).cloned() else {
            return Ok(false);
        };

        state.items.insert(item.id.clone(), item.clone());
        state.set_score(&pkey, &item.id, item.score_ms);
        if let Some(set) = state.in_progress.get_mut(&pkey) {
            set.remove(&item.id);
        }
        state.leases.remove(&lease.resource);
        Ok(true)
    }

    async fn dead(
        &self,
        letter: &DeadLetter,
        lease: &Lease,
        max_len: usize,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.holds(lease) {
            return Ok(false);
        }
        if !state.release_superseded(&letter.item.id, lease) {
            state.remove(&letter.item.id);
        }
        state.dead.push_front(letter.clone());
        state.dead.truncate(max_len);
        Ok(true)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.dead.iter().take(limit).cloned().collect())
    }

    async fn update_score(
        &self,
        expected: &QueueItem,
        updated: &QueueItem,
        now_ms: i64,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.replace(expected, updated, None, now_ms))
    }

    async fn move_item(
        &self,
        expected: &QueueItem,
        updated: &QueueItem,
        to: &QueuePartition,
        now_ms: i64,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.replace(expected, updated, Some(to), now_ms))
    }

    async fn acquire_lease(&self, lease: &Lease, now_ms: i64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.valid_lease(&lease.resource, now_ms).is_some() {
            return Ok(false);
        }
        state.leases.insert(lease.resource.clone(), lease.clone());
        Ok(true)
    }

    async fn renew_lease(
        &self,
        current: &Lease,
        next: &Lease,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.holds(current) || !current.is_valid_at(now_ms) {
            return Ok(false);
        }
        state.leases.insert(next.resource.clone(), next.clone());
        Ok(true)
    }

    async fn release_lease(&self, lease: &Lease) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.holds(lease) {
            return Ok(false);
        }
        state.leases.remove(&lease.resource);
        Ok(true)
    }

    async fn current_lease(&self, resource: &str) -> Result<Option<Lease>, StoreError> {
        Ok(self.state.lock().await.leases.get(resource).cloned())
    }

    async fn sweep(&self, now_ms: i64, limit: usize) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let pkeys: Vec<String> = state.in_progress.keys().take(limit).cloned().collect();

        let mut expired = Vec::new();
        for pkey in &pkeys {
            if let Some(set) = state.in_progress.get(pkey) {
                for (id, expiry) in set {
                    if *expiry <= now_ms
                        && state.valid_lease(&item_resource(id), now_ms).is_none()
                    {
                        expired.push((pkey.clone(), id.clone()));
                    }
                }
            }
        }

        for (pkey, id) in &expired {
            if let Some(set) = state.in_progress.get_mut(pkey) {
                set.remove(id);
            }
            let resource = item_resource(id);
            if state
                .leases
                .get(&resource)
                .is_some_and(|lease| !lease.is_valid_at(now_ms))
            {
                state.leases.remove(&resource);
            }
        }
        Ok(expired.len())
    }
}
