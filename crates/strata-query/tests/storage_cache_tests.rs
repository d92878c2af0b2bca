//! End-to-end lifecycle tests for the query storage orchestrator.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;

use strata_core::{MemoryBackend, QueryId};
use strata_query::config::StorageCacheConfig;
use strata_query::error::Error;
use strata_query::result_queue::MemoryResultQueue;
use strata_query::status::{QueryFailure, QueryLifecycle};
use strata_query::storage_cache::QueryStorageCache;
use strata_query::task::{Checkpoint, TaskAction};
use strata_query::task_states::TaskLifecycle;

fn harness() -> (QueryStorageCache, Arc<MemoryResultQueue>) {
    let queue = Arc::new(MemoryResultQueue::new());
    let cache = QueryStorageCache::new(
        Arc::new(MemoryBackend::new()),
        queue.clone(),
        StorageCacheConfig::default(),
    );
    (cache, queue)
}

fn definition() -> serde_json::Value {
    serde_json::json!({"query": "field == value", "begin": "20240101", "end": "20240201"})
}

fn auths() -> BTreeSet<String> {
    BTreeSet::from(["A".to_string(), "B".to_string()])
}

#[tokio::test]
async fn define_writes_status_without_tasks() {
    let (cache, _) = harness();

    let key = cache
        .define_query("default", "EventQuery", definition(), auths())
        .await
        .expect("define");

    let status = cache
        .get_query_status(key.query_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(status.lifecycle, QueryLifecycle::Define);
    assert_eq!(status.computed_auths, auths());

    let state = cache.get_query_state(key.query_id).await.expect("state");
    assert!(state.task_states.is_none());
    assert!(cache.get_tasks(&key).await.expect("tasks").is_empty());
}

#[tokio::test]
async fn create_writes_status_and_initial_task() {
    let (cache, _) = harness();

    let task_key = cache
        .create_query("default", "EventQuery", definition(), auths(), Some(4))
        .await
        .expect("create");

    let query_key = task_key.query_key.clone();
    let status = cache
        .get_query_status(query_key.query_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(status.lifecycle, QueryLifecycle::Create);

    let tasks = cache.get_tasks(&query_key).await.expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].action, TaskAction::Create);
    assert_eq!(tasks[0].to_key(), task_key);

    let state = cache.get_query_state(query_key.query_id).await.expect("state");
    let task_states = state.task_states.expect("task states");
    assert_eq!(task_states.max_running, 4);
    assert_eq!(task_states.tasks_in(TaskLifecycle::Ready), vec![task_key.task_id]);
    assert!(task_states.has_unfinished_tasks());
}

#[tokio::test]
async fn plan_and_predict_tag_their_tasks() {
    let (cache, _) = harness();

    let plan_task = cache
        .plan_query("default", "EventQuery", definition(), auths(), None)
        .await
        .expect("plan");
    let predict_task = cache
        .predict_query("default", "EventQuery", definition(), auths(), None)
        .await
        .expect("predict");

    let plan = cache.get_task(&plan_task).await.expect("get").expect("present");
    assert_eq!(plan.action, TaskAction::Plan);

    let predict = cache
        .get_task(&predict_task)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(predict.action, TaskAction::Predict);
}

#[tokio::test]
async fn update_query_status_is_idempotent() {
    let (cache, _) = harness();

    let task_key = cache
        .create_query("default", "EventQuery", definition(), auths(), None)
        .await
        .expect("create");
    let id = task_key.query_key.query_id;

    cache
        .update_query_status(id, QueryLifecycle::Created)
        .await
        .expect("first transition");
    // Requesting the same state twice is a no-op, not an error.
    cache
        .update_query_status(id, QueryLifecycle::Created)
        .await
        .expect("repeat transition");

    let status = cache.get_query_status(id).await.expect("get").expect("present");
    assert_eq!(status.lifecycle, QueryLifecycle::Created);
    assert!(status.is_running());
}

#[tokio::test]
async fn update_status_of_missing_query_is_not_found() {
    let (cache, _) = harness();

    let err = cache
        .update_query_status(QueryId::generate(), QueryLifecycle::Canceled)
        .await
        .expect_err("should fail");
    assert!(matches!(err, Error::QueryNotFound { .. }));
}

#[tokio::test]
async fn failure_detail_lands_with_failed_state() {
    let (cache, _) = harness();

    let task_key = cache
        .create_query("default", "EventQuery", definition(), auths(), None)
        .await
        .expect("create");
    let id = task_key.query_key.query_id;

    cache
        .update_failed_query_status(
            id,
            QueryFailure::new("QUERY-500", "tablet server lost", "at scanner.rs:120"),
        )
        .await
        .expect("record failure");

    let status = cache.get_query_status(id).await.expect("get").expect("present");
    assert_eq!(status.lifecycle, QueryLifecycle::Failed);
    let failure = status.failure.expect("failure detail");
    assert_eq!(failure.code, "QUERY-500");
    assert_eq!(failure.message, "tablet server lost");
    assert_eq!(failure.stack, "at scanner.rs:120");
}

#[tokio::test]
async fn checkpoint_task_roundtrip_and_not_found() {
    let (cache, _) = harness();

    let task_key = cache
        .create_query("default", "EventQuery", definition(), auths(), None)
        .await
        .expect("create");
    let query_key = task_key.query_key.clone();

    let updated = cache
        .checkpoint_task(
            &task_key,
            Checkpoint::new(query_key.clone(), serde_json::json!({"range": "row-500"})),
        )
        .await
        .expect("checkpoint");
    assert_eq!(updated.checkpoint.payload["range"], "row-500");

    let stored = cache
        .get_task(&task_key)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(stored.checkpoint.payload["range"], "row-500");

    // Checkpointing a vanished task is a distinct not-found error.
    let missing = query_key.task(99);
    let err = cache
        .checkpoint_task(&missing, Checkpoint::empty(query_key))
        .await
        .expect_err("should fail");
    assert!(matches!(err, Error::TaskNotFound { .. }));
}

#[tokio::test]
async fn delete_task_removes_record_and_scheduling_entry() {
    let (cache, _) = harness();

    let task_key = cache
        .create_query("default", "EventQuery", definition(), auths(), None)
        .await
        .expect("create");
    let id = task_key.query_key.query_id;

    assert!(cache.delete_task(&task_key).await.expect("delete"));
    assert!(cache.get_task(&task_key).await.expect("get").is_none());

    let state = cache.get_query_state(id).await.expect("state");
    let task_states = state.task_states.expect("task states");
    assert_eq!(task_states.state_of(task_key.task_id), None);

    // Deleting again reports the task as already gone.
    assert!(!cache.delete_task(&task_key).await.expect("delete"));
}

#[tokio::test]
async fn delete_query_removes_full_footprint() {
    let (cache, queue) = harness();

    let task_key = cache
        .create_query("default", "EventQuery", definition(), auths(), None)
        .await
        .expect("create");
    let query_key = task_key.query_key.clone();
    let id = query_key.query_id;

    queue.publish(id, Bytes::from("page-1")).expect("publish");

    assert!(cache.delete_query(id).await.expect("delete"));

    assert!(cache.get_query_status(id).await.expect("get").is_none());
    assert!(cache.get_tasks(&query_key).await.expect("tasks").is_empty());
    assert_eq!(queue.len(id).expect("len"), None);
}

#[tokio::test]
async fn delete_missing_query_returns_false() {
    let (cache, _) = harness();
    assert!(!cache.delete_query(QueryId::generate()).await.expect("delete"));
}

#[tokio::test]
async fn clear_wipes_stores_and_drains_queues() {
    let (cache, queue) = harness();

    let a = cache
        .create_query("default", "EventQuery", definition(), auths(), None)
        .await
        .expect("create a");
    let b = cache
        .create_query("other", "LookupQuery", definition(), auths(), None)
        .await
        .expect("create b");

    queue
        .publish(a.query_key.query_id, Bytes::from("page"))
        .expect("publish");

    cache.clear().await.expect("clear");

    assert!(cache.list_query_status().await.expect("list").is_empty());
    assert!(cache.get_tasks(&a.query_key).await.expect("tasks").is_empty());
    assert!(cache.get_tasks(&b.query_key).await.expect("tasks").is_empty());
    // Queues are drained but not deleted.
    assert_eq!(queue.len(a.query_key.query_id).expect("len"), Some(0));
}

#[tokio::test]
async fn list_query_status_sees_all_pools() {
    let (cache, _) = harness();

    cache
        .create_query("pool-a", "EventQuery", definition(), auths(), None)
        .await
        .expect("create");
    cache
        .create_query("pool-b", "EventQuery", definition(), auths(), None)
        .await
        .expect("create");
    cache
        .define_query("pool-c", "EventQuery", definition(), auths())
        .await
        .expect("define");

    assert_eq!(cache.list_query_status().await.expect("list").len(), 3);
}
