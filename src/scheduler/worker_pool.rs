//! Worker pool that dispatches queued items to a handler.
//!
//! A pool runs a fixed number of executors plus one task that keeps the
//! sequential lease. Each executor loops over:
//!
//! 1. select ready partitions
//! 2. peek and lease the first item nobody else holds
//! 3. run the handler while renewing the item lease
//! 4. resolve the outcome through the retry controller
//!
//! Cancelling the run token stops new leasing. Handlers already running see
//! their context token cancelled but are allowed to finish, and `run`
//! returns once every executor has drained.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::{Resolution, RetryController};
use super::selector::PartitionSelector;
use crate::error::{LeaseError, QueueError, StoreError};
use crate::lease::{now_ms, Lease, LeaseManager, SequentialLease};
use crate::queue::config::QueueConfig;
use crate::queue::handler::{JobContext, JobHandler, RunInfo, RunResult};
use crate::queue::item::QueueItem;
use crate::queue::observer::{Observers, QueueObserver};
use crate::queue::partition::QueuePartition;
use crate::queue::shard::QueueShard;

/// Longest pause between dispatch attempts while the store is failing.
const MAX_STORE_BACKOFF: Duration = Duration::from_secs(5);

/// How many times a resolution is written before giving up on it.
const RESOLVE_ATTEMPTS: u32 = 5;

const RESOLVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of executors in the pool.
    pub num_workers: usize,
    /// Number of executors currently running a handler.
    pub active_workers: usize,
    /// Items whose handler succeeded.
    pub jobs_completed: u64,
    /// Failed attempts, retried or dead.
    pub jobs_failed: u64,
    /// Failed attempts that were rescheduled.
    pub jobs_retried: u64,
    /// Items moved to the dead-letter list.
    pub jobs_dead: u64,
    /// Handlers abandoned because their item lease was lost.
    pub leases_lost: u64,
    /// Average handler duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of attempts resolved (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead: AtomicU64,
    leases_lost: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn add_duration(&self, duration: Duration) {
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    fn record_retry(&self, duration: Duration) {
        self.jobs_retried.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    fn record_dead(&self, duration: Duration) {
        self.jobs_dead.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    fn record_lease_lost(&self) {
        self.leases_lost.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let retried = self.jobs_retried.load(Ordering::SeqCst);
        let dead = self.jobs_dead.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let failed = retried + dead;
        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_retried: retried,
            jobs_dead: dead,
            leases_lost: self.leases_lost.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Everything executors share for one pool.
struct Dispatch {
    shard: QueueShard,
    config: Arc<QueueConfig>,
    selector: PartitionSelector,
    leases: LeaseManager,
    retry: RetryController,
    observers: Observers,
    stats: SharedPoolStats,
}

/// Resets the running flag when `run` finishes or is dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Pool of executors serving one shard.
pub struct WorkerPool {
    dispatch: Arc<Dispatch>,
    sequential: Arc<SequentialLease>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool for `shard`. Nothing runs until [`WorkerPool::run`].
    pub fn new(shard: QueueShard, config: Arc<QueueConfig>, observers: Observers) -> Self {
        let leases = LeaseManager::new(Arc::clone(shard.store()), config.node_id.clone());
        let sequential = SequentialLease::new(leases.clone(), config.sequential_lease_duration);
        let retry = RetryController::new(
            config.backoff.clone(),
            config.default_max_attempts,
            config.dead_letter_max,
        );

        Self {
            dispatch: Arc::new(Dispatch {
                shard,
                selector: PartitionSelector::new(Arc::clone(&config)),
                config,
                leases,
                retry,
                observers,
                stats: SharedPoolStats::default(),
            }),
            sequential: Arc::new(sequential),
            is_running: AtomicBool::new(false),
        }
    }

    /// Runs the pool until `cancel` fires, then waits for in-flight
    /// handlers to finish.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::AlreadyRunning` if the pool is already running
    /// and `QueueError::Worker` if an executor task died.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.is_running);

        let num_workers = self.dispatch.config.num_workers;
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(num_workers + 1);

        handles.push(tokio::spawn(keep_sequential(
            Arc::clone(&self.dispatch),
            Arc::clone(&self.sequential),
            cancel.clone(),
        )));

        for i in 0..num_workers {
            let worker = Worker::new(
                format!("worker-{i}"),
                Arc::clone(&self.dispatch),
                Arc::clone(&handler),
                cancel.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        info!(
            shard = %self.dispatch.shard.name,
            node_id = %self.dispatch.config.node_id,
            num_workers = num_workers,
            run_mode = ?self.dispatch.config.run_mode,
            "Worker pool started"
        );

        let mut failure = None;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
                failure = Some(e.to_string());
            }
        }

        info!(shard = %self.dispatch.shard.name, "Worker pool stopped");
        match failure {
            Some(message) => Err(QueueError::Worker(message)),
            None => Ok(()),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.dispatch
            .stats
            .to_pool_stats(self.dispatch.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.dispatch.config.num_workers
    }

    /// Returns the sequential lease if this pool currently holds it.
    pub fn sequential_lease(&self) -> Option<Lease> {
        self.sequential.current()
    }

    pub fn sequential(&self) -> &Arc<SequentialLease> {
        &self.sequential
    }
}

/// Acquires or renews the sequential lease on a fixed interval and runs the
/// holder's housekeeping.
async fn keep_sequential(
    dispatch: Arc<Dispatch>,
    sequential: Arc<SequentialLease>,
    cancel: CancellationToken,
) {
    let interval = dispatch.config.sequential_renew_interval;
    let mut held = false;

    loop {
        let now_held = match sequential.tick().await {
            Ok(now_held) => now_held,
            Err(e) => {
                warn!(error = %e, "Failed to refresh sequential lease");
                sequential.is_held()
            }
        };
        if now_held != held {
            dispatch.observers.on_sequential_lease(now_held);
            held = now_held;
        }
        if held {
            sweep(&dispatch).await;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    sequential.clear();
    if held {
        dispatch.observers.on_sequential_lease(false);
    }
    debug!("Sequential lease keeper stopped");
}

async fn sweep(dispatch: &Dispatch) {
    let store = dispatch.shard.store();
    match store.sweep(now_ms(), dispatch.config.partition_limit).await {
        Ok(0) => {}
        Ok(removed) => {
            info!(removed = removed, "Swept abandoned lease entries");
            dispatch.observers.on_swept(removed);
        }
        Err(e) => warn!(error = %e, "Lease-set sweep failed"),
    }
}

/// An item leased by an executor.
struct Claim {
    partition: QueuePartition,
    item: QueueItem,
    lease: Lease,
    leased_at_ms: i64,
}

enum Execution {
    Finished(anyhow::Result<RunResult>),
    LeaseLost,
}

/// A single executor.
pub struct Worker {
    /// Unique identifier for this worker.
    id: String,
    dispatch: Arc<Dispatch>,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
}

impl Worker {
    fn new(
        id: String,
        dispatch: Arc<Dispatch>,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            dispatch,
            handler,
            cancel,
        }
    }

    /// Main worker loop.
    async fn run(self) {
        debug!(worker_id = %self.id, "Worker started");

        let poll_interval = self.dispatch.config.poll_interval;
        let max_backoff = MAX_STORE_BACKOFF.max(poll_interval);
        let mut error_backoff = poll_interval;

        while !self.cancel.is_cancelled() {
            match self.claim().await {
                Ok(Some(claim)) => {
                    error_backoff = poll_interval;
                    self.process(claim).await;
                }
                Ok(None) => {
                    if !self.pause(poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        error = %e,
                        retry_in_ms = error_backoff.as_millis() as u64,
                        "Dispatch failed"
                    );
                    if !self.pause(error_backoff).await {
                        break;
                    }
                    error_backoff = (error_backoff * 2).min(max_backoff);
                }
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    /// Sleeps for `delay`. Returns `false` if the run was cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Leases the next ready item, trying partitions in selection order.
    async fn claim(&self) -> Result<Option<Claim>, QueueError> {
        let config = &self.dispatch.config;
        let store = self.dispatch.shard.store();
        let now = now_ms();

        let partitions = self.dispatch.selector.select(store.as_ref(), now).await?;
        for partition in partitions {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            let items = store
                .peek(&partition, now, now, config.peek_limit)
                .await?;
            for item in items {
                match self
                    .dispatch
                    .leases
                    .lease_item(&item.id, config.item_lease_duration)
                    .await
                {
                    Ok(lease) => {
                        // The item may have been re-enqueued between peek and lease.
                        let item = store.load(&item.id).await?.unwrap_or(item);
                        return Ok(Some(Claim {
                            partition,
                            item,
                            lease,
                            leased_at_ms: now_ms(),
                        }));
                    }
                    Err(e) if e.is_contention() => {
                        debug!(
                            worker_id = %self.id,
                            item_id = %item.id,
                            partition = %partition,
                            "Item claimed by another executor"
                        );
                        self.dispatch.observers.on_contention(&partition.id());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(None)
    }

    /// Runs the handler for a claimed item and resolves the outcome.
    async fn process(&self, claim: Claim) {
        let Claim {
            partition,
            item,
            mut lease,
            leased_at_ms,
        } = claim;
        let dispatch = &self.dispatch;
        let pkey = partition.id();

        let token = self.cancel.child_token();
        let ctx = JobContext::new(item.id.clone(), item.enqueued_at(), token.clone());
        let job_id = ctx.job_id();
        let info = RunInfo {
            attempt: item.data.attempt,
            max_attempts: item.max_attempts(dispatch.config.default_max_attempts),
            latency: Duration::from_millis(u64::try_from(leased_at_ms - item.at_ms).unwrap_or(0)),
            shard: dispatch.shard.name.clone(),
            partition: pkey.clone(),
        };

        debug!(
            worker_id = %self.id,
            item_id = %item.id,
            job_id = %job_id,
            partition = %pkey,
            attempt = item.data.attempt,
            "Processing item"
        );

        dispatch.stats.increment_active();
        dispatch.observers.on_started(&pkey, &item);
        let start_time = Instant::now();
        let execution = self.execute(ctx, info, &item, &mut lease, &token).await;
        let duration = start_time.elapsed();
        dispatch.stats.decrement_active();
        dispatch.observers.on_finished(&pkey, &item, duration);

        let outcome = match execution {
            Execution::Finished(outcome) => outcome,
            Execution::LeaseLost => {
                warn!(
                    worker_id = %self.id,
                    item_id = %item.id,
                    job_id = %job_id,
                    "Item lease lost, handler abandoned"
                );
                dispatch.stats.record_lease_lost();
                dispatch.observers.on_lease_lost(&pkey, &item);
                return;
            }
        };

        let resolution = dispatch.retry.plan(&item, &outcome, now_ms());
        match self.resolve(&item.id, &resolution, &lease).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    worker_id = %self.id,
                    item_id = %item.id,
                    resolution = resolution.label(),
                    "Item lease lost before resolution, item will be redelivered"
                );
                dispatch.stats.record_lease_lost();
                dispatch.observers.on_lease_lost(&pkey, &item);
                return;
            }
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    item_id = %item.id,
                    resolution = resolution.label(),
                    error = %e,
                    "Failed to resolve item, it will be redelivered after its lease expires"
                );
                return;
            }
        }

        match &resolution {
            Resolution::Completed => {
                dispatch.stats.record_completion(duration);
                dispatch.observers.on_completed(&pkey, &item, duration);
                debug!(
                    worker_id = %self.id,
                    item_id = %item.id,
                    job_id = %job_id,
                    duration_ms = duration.as_millis() as u64,
                    "Item completed"
                );
            }
            Resolution::Retry {
                item: next,
                delay,
                error,
            } => {
                dispatch.stats.record_retry(duration);
                dispatch.observers.on_retried(&pkey, next, *delay, error);
            }
            Resolution::Dead { item: dead, error } => {
                dispatch.stats.record_dead(duration);
                dispatch.observers.on_dead(&pkey, dead, error);
            }
        }
    }

    /// Drives the handler future, renewing the item lease every half lease.
    /// Panics are turned into errors; a lost lease drops the future.
    async fn execute(
        &self,
        ctx: JobContext,
        info: RunInfo,
        item: &QueueItem,
        lease: &mut Lease,
        token: &CancellationToken,
    ) -> Execution {
        let lease_duration = self.dispatch.config.item_lease_duration;
        let renew_every = lease_duration / 2;

        let handler =
            AssertUnwindSafe(self.handler.handle(ctx, info, item.data.clone())).catch_unwind();
        tokio::pin!(handler);

        let mut renew =
            tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut handler => {
                    let outcome = result.unwrap_or_else(|panic| {
                        Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic)))
                    });
                    return Execution::Finished(outcome);
                }
                _ = renew.tick() => {
                    match self.dispatch.leases.extend_item(&item.id, lease, lease_duration).await {
                        Ok(next) => *lease = next,
                        Err(LeaseError::LeaseLost(_)) => {
                            token.cancel();
                            return Execution::LeaseLost;
                        }
                        Err(e) => {
                            if !lease.is_valid_at(now_ms()) {
                                token.cancel();
                                return Execution::LeaseLost;
                            }
                            warn!(
                                worker_id = %self.id,
                                item_id = %item.id,
                                error = %e,
                                "Failed to renew item lease"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Writes a resolution, retrying store failures while the lease lasts.
    async fn resolve(
        &self,
        item_id: &str,
        resolution: &Resolution,
        lease: &Lease,
    ) -> Result<bool, StoreError> {
        let store = self.dispatch.shard.store();
        let mut delay = RESOLVE_RETRY_DELAY;
        let mut attempt = 1;

        loop {
            let result = self
                .dispatch
                .retry
                .apply(store.as_ref(), item_id, resolution, lease, now_ms())
                .await;
            match result {
                Err(e) if attempt < RESOLVE_ATTEMPTS && lease.is_valid_at(now_ms()) => {
                    warn!(
                        worker_id = %self.id,
                        item_id = %item_id,
                        attempt = attempt,
                        error = %e,
                        "Failed to resolve item, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
