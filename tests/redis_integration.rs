//! Integration tests against a live Redis server.
//!
//! Every test works under its own key prefix and clears it afterwards.
//! Run with:
//! FAIRQ_TEST_REDIS_URL=redis://localhost:6379 cargo test --test redis_integration -- --ignored

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fairq::lease::{item_resource, now_ms, Lease, LeaseManager};
use fairq::queue::{Identifier, KeyGenerator, ShardKind};
use fairq::store::{LeaseOutcome, QueueStore, RedisStore};
use fairq::{
    EnqueueOpts, Item, JobContext, Queue, QueueConfig, QueueItem, QueuePartition, QueueShard,
    RunInfo, RunResult,
};
use tokio_util::sync::CancellationToken;

fn get_test_redis_url() -> String {
    std::env::var("FAIRQ_TEST_REDIS_URL")
        .expect("FAIRQ_TEST_REDIS_URL environment variable must be set for integration tests")
}

async fn create_test_store() -> Arc<RedisStore> {
    let prefix = format!("{{fairq-test-{}}}", uuid::Uuid::new_v4().simple());
    let store = RedisStore::connect(&get_test_redis_url(), KeyGenerator::new(prefix))
        .await
        .expect("Should connect to Redis");
    Arc::new(store)
}

fn shard(store: &Arc<RedisStore>) -> QueueShard {
    QueueShard::new(
        "redis",
        ShardKind::Redis,
        store.keys().clone(),
        Arc::clone(store) as Arc<dyn QueueStore>,
    )
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_enqueue_peek_and_overwrite() {
    let store = create_test_store().await;
    let queue = Queue::new(shard(&store), QueueConfig::default()).expect("queue");
    let now = Utc::now();

    let envelope = QueueItem::from_item(
        Item::new("edge", Identifier::default())
            .with_queue_name("emails")
            .with_payload(serde_json::json!({ "v": 1 })),
    )
    .with_id("same-id");
    let first = queue
        .enqueue_item("redis", envelope.clone(), now, EnqueueOpts::default())
        .await
        .expect("enqueue");
    assert!(first.created);

    let mut replacement = envelope;
    replacement.data.payload = serde_json::json!({ "v": 2 });
    let second = queue
        .enqueue_item("redis", replacement, now, EnqueueOpts::default())
        .await
        .expect("enqueue");
    assert!(!second.created);
    assert_eq!(first.item_id, second.item_id);

    let items = queue
        .peek(&QueuePartition::queue("emails"), now, 10)
        .await
        .expect("peek");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].data.payload["v"], 2);

    store.clear().await.expect("clear");
}

#[tokio::test]
#[ignore]
async fn test_item_lease_is_exclusive() {
    let store = create_test_store().await;
    let item = QueueItem::from_item(Item::default()).with_id("leased");
    let partition = QueuePartition::for_item(&item);
    let now = now_ms();
    store.enqueue(&item, &partition, now).await.expect("enqueue");

    let first = Lease::new(item_resource("leased"), "a", now, Duration::from_secs(5));
    let second = Lease::new(item_resource("leased"), "b", now, Duration::from_secs(5));
    assert_eq!(
        store.lease_item("leased", &first, now).await.expect("lease"),
        LeaseOutcome::Acquired
    );
    assert_eq!(
        store.lease_item("leased", &second, now).await.expect("lease"),
        LeaseOutcome::Contended
    );

    let peeked = store
        .peek(&partition, i64::MAX, now, 10)
        .await
        .expect("peek");
    assert!(peeked.is_empty());

    assert!(!store.dequeue("leased", &second).await.expect("dequeue"));
    assert!(store.dequeue("leased", &first).await.expect("dequeue"));
    assert!(store.load("leased").await.expect("load").is_none());

    store.clear().await.expect("clear");
}

#[tokio::test]
#[ignore]
async fn test_reenqueue_while_leased_runs_again() {
    let store = create_test_store().await;
    let mut item = QueueItem::from_item(Item::default()).with_id("job");
    item.data.payload = serde_json::json!("v1");
    let partition = QueuePartition::for_item(&item);
    let now = now_ms();
    store.enqueue(&item, &partition, now).await.expect("enqueue");

    let lease = Lease::new(item_resource("job"), "a", now, Duration::from_secs(5));
    store.lease_item("job", &lease, now).await.expect("lease");

    let mut newer = item.clone();
    newer.data.payload = serde_json::json!("v2");
    assert!(!store.enqueue(&newer, &partition, now).await.expect("enqueue"));

    assert!(store.dequeue("job", &lease).await.expect("dequeue"));
    let stored = store.load("job").await.expect("load").expect("kept");
    assert_eq!(stored.data.payload, serde_json::json!("v2"));
    let peeked = store
        .peek(&partition, i64::MAX, now, 10)
        .await
        .expect("peek");
    assert_eq!(peeked.len(), 1);

    let again = Lease::new(item_resource("job"), "a", now, Duration::from_secs(5));
    store.lease_item("job", &again, now).await.expect("lease");
    assert!(store.dequeue("job", &again).await.expect("dequeue"));
    assert!(store.load("job").await.expect("load").is_none());

    store.clear().await.expect("clear");
}

#[tokio::test]
#[ignore]
async fn test_shared_queue_name_lists_every_account() {
    let store = create_test_store().await;
    let now = now_ms();
    let accounts = [uuid::Uuid::new_v4(), uuid::Uuid::new_v4()];

    for (n, account_id) in accounts.iter().enumerate() {
        let identifier = Identifier {
            account_id: *account_id,
            ..Default::default()
        };
        let mut item =
            QueueItem::from_item(Item::new("edge", identifier)).with_id(format!("item-{n}"));
        item.queue_name = Some("shared".to_string());
        item.score_ms = now - 10 + n as i64;
        let partition = QueuePartition::for_item(&item);
        store.enqueue(&item, &partition, now).await.expect("enqueue");
    }

    let listed = store.accounts(now, 10).await.expect("accounts");
    assert_eq!(listed, accounts.to_vec());
    for account_id in accounts {
        let partitions = store
            .account_partitions(account_id, now, 10)
            .await
            .expect("account partitions");
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].partition.account_id, account_id);
    }

    store.clear().await.expect("clear");
}

#[tokio::test]
#[ignore]
async fn test_sequential_lease_handover() {
    let store = create_test_store().await;
    let first = LeaseManager::new(Arc::clone(&store) as Arc<dyn QueueStore>, "first");
    let second = LeaseManager::new(Arc::clone(&store) as Arc<dyn QueueStore>, "second");

    let lease = first
        .acquire("sequential", Duration::from_millis(300))
        .await
        .expect("first acquires");
    assert!(second
        .acquire("sequential", Duration::from_millis(300))
        .await
        .is_err());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let taken = second
        .acquire("sequential", Duration::from_millis(300))
        .await
        .expect("second acquires after expiry");
    assert_eq!(taken.holder, "second");
    assert!(first.renew(&lease, Duration::from_millis(300)).await.is_err());

    store.clear().await.expect("clear");
}

#[tokio::test]
#[ignore]
async fn test_worker_drains_redis_queue() {
    let store = create_test_store().await;
    let config = QueueConfig::default()
        .with_num_workers(4)
        .with_poll_interval(Duration::from_millis(20));
    let queue = Arc::new(Queue::new(shard(&store), config).expect("queue"));

    for n in 0..10 {
        queue
            .enqueue(
                Item::new("edge", Identifier::default())
                    .with_payload(serde_json::json!({ "n": n })),
                Utc::now(),
                EnqueueOpts::default(),
            )
            .await
            .expect("enqueue");
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();
    let run = {
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        let calls = Arc::clone(&calls);
        tokio::spawn(async move {
            let handler = move |_ctx: JobContext, _info: RunInfo, _item: Item| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(RunResult::empty())
                }
            };
            queue.run(cancel, handler).await.expect("queue run");
        })
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        while queue.stats().jobs_completed < 10 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("all items processed");
    cancel.cancel();
    run.await.expect("join");

    assert_eq!(calls.load(Ordering::SeqCst), 10);
    let partitions = store.partitions(i64::MAX, 10).await.expect("partitions");
    assert!(partitions.is_empty());

    store.clear().await.expect("clear");
}
