//! Distributed lock tests

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_test::{assert_err, assert_ok};

use dockside::errors::OrchestratorError;
use dockside::kv::lock::DistributedLock;
use dockside::kv::memory::MemoryKv;
use dockside::kv::KvStore;

fn store() -> Arc<dyn KvStore> {
    Arc::new(MemoryKv::new())
}

#[tokio::test]
async fn test_second_lock_waits_for_unlock() {
    let store = store();
    let first = DistributedLock::new(store.clone(), "res-1", Duration::from_secs(5));
    let second = DistributedLock::new(store.clone(), "res-1", Duration::from_secs(5));

    assert_ok!(first.lock().await);

    let waiter = tokio::spawn(async move { second.lock().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    first.unlock().await.unwrap();
    let acquired = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_ok!(acquired);
}

#[tokio::test]
async fn test_lock_times_out_while_held() {
    let store = store();
    let holder = DistributedLock::new(store.clone(), "res-1", Duration::from_secs(5));
    holder.lock().await.unwrap();

    let waiter = DistributedLock::new(store.clone(), "res-1", Duration::from_millis(100));
    let started = Instant::now();
    let result = waiter.lock().await;
    assert_err!(&result);

    assert!(matches!(result, Err(OrchestratorError::LockTimeout(key)) if key == "res-1"));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_abandoned_lock_expires_with_ttl() {
    let store = store();
    let abandoned = DistributedLock::new(store.clone(), "res-1", Duration::from_millis(100));
    abandoned.lock().await.unwrap();

    let next = DistributedLock::new(store.clone(), "res-1", Duration::from_secs(2));
    let started = Instant::now();
    next.lock().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_distinct_keys_do_not_block() {
    let store = store();
    let a = DistributedLock::new(store.clone(), "res-a", Duration::from_millis(200));
    let b = DistributedLock::new(store.clone(), "res-b", Duration::from_millis(200));

    a.lock().await.unwrap();
    b.lock().await.unwrap();

    let buckets = store.list_buckets().await.unwrap();
    assert_eq!(buckets, vec!["locks-res-a", "locks-res-b"]);
}
