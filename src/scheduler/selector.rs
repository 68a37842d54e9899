//! Partition selection for the dispatch loop.
//!
//! Each pass returns the partitions an executor should try, in order. The
//! store hands back ready partitions ordered by their earliest score; the
//! selector filters them against the configured queue names and rotates the
//! list with a shared cursor so concurrent executors start on different
//! partitions and a single busy partition can't monopolize the pool.
//!
//! In account mode the rotation happens over accounts first, and the
//! partitions of the visited accounts are interleaved so every account gets
//! a turn before any account gets a second one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::error::StoreError;
use crate::queue::config::{QueueConfig, RunMode};
use crate::queue::partition::QueuePartition;
use crate::store::{PartitionEntry, QueueStore};

/// Upper bound on accounts visited per pass in account mode.
pub const MAX_ACCOUNTS_PER_PASS: usize = 16;

/// Picks the partitions an executor works on next.
pub struct PartitionSelector {
    config: Arc<QueueConfig>,
    cursor: AtomicUsize,
}

impl PartitionSelector {
    /// The cursor starts at a random offset so processes started together
    /// don't all open on the same partition.
    pub fn new(config: Arc<QueueConfig>) -> Self {
        use rand::RngExt;

        let start = rand::rng().random_range(0..1024usize);
        Self {
            config,
            cursor: AtomicUsize::new(start),
        }
    }

    /// Returns whether a partition passes the allow/deny filters.
    pub fn is_allowed(&self, partition: &QueuePartition) -> bool {
        self.config.is_queue_allowed(partition.queue_name())
    }

    /// Returns the partitions with work ready at `now_ms`, in the order they
    /// should be tried.
    pub async fn select(
        &self,
        store: &dyn QueueStore,
        now_ms: i64,
    ) -> Result<Vec<QueuePartition>, StoreError> {
        let selected = match self.config.run_mode {
            RunMode::Function => self.select_partitions(store, now_ms).await?,
            RunMode::Account => self.select_accounts(store, now_ms).await?,
        };
        trace!(count = selected.len(), mode = ?self.config.run_mode, "Selected partitions");
        Ok(selected)
    }

    async fn select_partitions(
        &self,
        store: &dyn QueueStore,
        now_ms: i64,
    ) -> Result<Vec<QueuePartition>, StoreError> {
        let entries = store.partitions(now_ms, self.config.partition_limit).await?;
        let mut partitions = self.filter(entries);
        self.rotate(&mut partitions);
        Ok(partitions)
    }

    async fn select_accounts(
        &self,
        store: &dyn QueueStore,
        now_ms: i64,
    ) -> Result<Vec<QueuePartition>, StoreError> {
        let mut accounts = store.accounts(now_ms, self.config.partition_limit).await?;
        self.rotate(&mut accounts);
        accounts.truncate(MAX_ACCOUNTS_PER_PASS);

        let mut per_account = Vec::with_capacity(accounts.len());
        for account_id in accounts {
            let entries = store
                .account_partitions(account_id, now_ms, self.config.partition_limit)
                .await?;
            let partitions: VecDeque<_> = self.filter(entries).into();
            if !partitions.is_empty() {
                per_account.push(partitions);
            }
        }

        Ok(interleave(per_account))
    }

    fn filter(&self, entries: Vec<PartitionEntry>) -> Vec<QueuePartition> {
        entries
            .into_iter()
            .map(|entry| entry.partition)
            .filter(|partition| self.is_allowed(partition))
            .collect()
    }

    fn rotate<T>(&self, list: &mut [T]) {
        if list.len() < 2 {
            return;
        }
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % list.len();
        list.rotate_left(offset);
    }
}

/// Takes one partition from each account in turn until all are drained.
fn interleave(mut groups: Vec<VecDeque<QueuePartition>>) -> Vec<QueuePartition> {
    let total = groups.iter().map(VecDeque::len).sum();
    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        for group in groups.iter_mut() {
            if let Some(partition) = group.pop_front() {
                out.push(partition);
            }
        }
    }
    out
}
