//! Cross-process coordination tests: admission control under concurrency,
//! lock mutual exclusion, and cached-status coherence between instances.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strata_core::{DistributedLock, KeyValueBackend, MemoryBackend};
use strata_query::cached::CachedQueryStatus;
use strata_query::config::{CacheConfig, RefreshMode, StorageCacheConfig};
use strata_query::result_queue::MemoryResultQueue;
use strata_query::status::QueryLifecycle;
use strata_query::storage_cache::QueryStorageCache;
use strata_query::task::{Checkpoint, TaskAction};
use strata_query::task_states::TaskLifecycle;

fn harness() -> (Arc<MemoryBackend>, QueryStorageCache) {
    let backend = Arc::new(MemoryBackend::new());
    let cache = QueryStorageCache::new(
        backend.clone(),
        Arc::new(MemoryResultQueue::new()),
        StorageCacheConfig::default(),
    );
    (backend, cache)
}

fn definition() -> serde_json::Value {
    serde_json::json!({"query": "field == value"})
}

#[tokio::test]
async fn admission_gate_bounds_concurrent_runners() {
    let (_, cache) = harness();
    let cache = Arc::new(cache);

    let first = cache
        .create_query(
            "default",
            "EventQuery",
            definition(),
            BTreeSet::new(),
            Some(2),
        )
        .await
        .expect("create");
    let query_key = first.query_key.clone();

    // Four more tasks alongside the initial one.
    let mut task_keys = vec![first];
    for _ in 0..4 {
        let task = cache
            .create_task(TaskAction::Next, Checkpoint::empty(query_key.clone()))
            .await
            .expect("create task");
        task_keys.push(task.to_key());
    }

    // All five race for RUNNING; the ceiling is two.
    let admitted = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for task_key in task_keys {
        let cache = cache.clone();
        let admitted = admitted.clone();
        handles.push(tokio::spawn(async move {
            if cache
                .update_task_state(&task_key, Some(TaskLifecycle::Running))
                .await
                .expect("transition")
            {
                admitted.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 2);

    let state = cache
        .get_query_state(query_key.query_id)
        .await
        .expect("state");
    let task_states = state.task_states.expect("task states");
    assert_eq!(task_states.running_count(), 2);
    assert_eq!(task_states.tasks_in(TaskLifecycle::Ready).len(), 3);
}

#[tokio::test]
async fn rejected_dispatch_succeeds_after_capacity_frees() {
    let (_, cache) = harness();

    let first = cache
        .create_query(
            "default",
            "EventQuery",
            definition(),
            BTreeSet::new(),
            Some(1),
        )
        .await
        .expect("create");
    let query_key = first.query_key.clone();
    let second = cache
        .create_task(TaskAction::Next, Checkpoint::empty(query_key))
        .await
        .expect("create task")
        .to_key();

    assert!(cache
        .update_task_state(&first, Some(TaskLifecycle::Running))
        .await
        .expect("first"));
    assert!(!cache
        .update_task_state(&second, Some(TaskLifecycle::Running))
        .await
        .expect("second rejected"));

    assert!(cache
        .update_task_state(&first, Some(TaskLifecycle::Completed))
        .await
        .expect("complete"));
    assert!(cache
        .update_task_state(&second, Some(TaskLifecycle::Running))
        .await
        .expect("second admitted"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_holders_never_overlap() {
    let backend: Arc<dyn KeyValueBackend> = Arc::new(MemoryBackend::new());
    let in_critical = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    for _ in 0..4 {
        let backend = backend.clone();
        let in_critical = in_critical.clone();
        handles.push(tokio::spawn(async move {
            let lock = DistributedLock::new(backend, "locks/shared-entity");
            let guard = lock.lock().await.expect("acquire");

            // No two holders may be inside the critical section at once.
            assert!(!in_critical.swap(true, Ordering::SeqCst));
            tokio::time::sleep(Duration::from_millis(10)).await;
            in_critical.store(false, Ordering::SeqCst);

            guard.release().await.expect("release");
        }));
    }

    for handle in handles {
        handle.await.expect("join");
    }
}

#[tokio::test]
async fn cached_instances_converge_on_counter_totals() {
    let (_, cache) = harness();

    let task_key = cache
        .create_query("default", "EventQuery", definition(), BTreeSet::new(), None)
        .await
        .expect("create");
    let id = task_key.query_key.query_id;

    // Two worker processes each hold their own cached wrapper.
    let config = CacheConfig {
        staleness: Duration::from_secs(60),
        refresh: RefreshMode::Lazy,
        lock_lease: Duration::from_secs(5),
    };
    let worker_a = CachedQueryStatus::new(cache.status_store().clone(), id, config.clone())
        .await
        .expect("worker a");
    let worker_b = CachedQueryStatus::new(cache.status_store().clone(), id, config)
        .await
        .expect("worker b");

    for _ in 0..10 {
        worker_a.add_results_generated(1).await;
    }
    for _ in 0..5 {
        worker_b.add_results_generated(1).await;
    }

    worker_a.refresh().await.expect("flush a");
    worker_b.refresh().await.expect("flush b");

    // B flushed last, so it already sees both contributions; A converges
    // on its next refresh.
    assert_eq!(worker_b.num_results_generated().await.expect("read b"), 15);
    worker_a.refresh().await.expect("reload a");
    assert_eq!(worker_a.num_results_generated().await.expect("read a"), 15);

    let status = cache
        .get_query_status(id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(status.num_results_generated, 15);
}

#[tokio::test]
async fn cached_write_does_not_clobber_other_instance_flush() {
    let (_, cache) = harness();

    let task_key = cache
        .create_query("default", "EventQuery", definition(), BTreeSet::new(), None)
        .await
        .expect("create");
    let id = task_key.query_key.query_id;

    let config = CacheConfig {
        staleness: Duration::from_secs(60),
        refresh: RefreshMode::Lazy,
        lock_lease: Duration::from_secs(5),
    };
    let worker_a = CachedQueryStatus::new(cache.status_store().clone(), id, config.clone())
        .await
        .expect("worker a");
    let worker_b = CachedQueryStatus::new(cache.status_store().clone(), id, config)
        .await
        .expect("worker b");

    // B flushes counters to the store; A's cached copy predates them.
    worker_b.add_next_count(7).await;
    worker_b.refresh().await.expect("flush b");

    // A's rare-field write reloads and merges before applying, so B's
    // flush survives.
    worker_a
        .set_lifecycle(QueryLifecycle::Closed)
        .await
        .expect("set state");

    let status = cache
        .get_query_status(id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(status.lifecycle, QueryLifecycle::Closed);
    assert_eq!(status.next_count, 7);
}
