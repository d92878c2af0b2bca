//! The orchestration surface workers call.
//!
//! `QueryStorageCache` composes the stores, the per-entity locks, and the
//! result-queue collaborator into the operations of the query lifecycle:
//! define/create/plan/predict a query, create/checkpoint/delete tasks,
//! transition query and task states, and tear a query's footprint down.
//!
//! Every compound read-modify-write is bracketed by the owning entity's
//! distributed lock. The status lock and the task-states lock for one
//! query are independent and never nested. No operation retries
//! automatically; the lock lease already bounds how long a stuck holder
//! can block others, and retry policy belongs to the caller.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use strata_core::{KeyValueBackend, QueryId};

use crate::cached::CachedQueryStatus;
use crate::config::StorageCacheConfig;
use crate::error::{Error, Result};
use crate::key::{QueryKey, TaskKey};
use crate::metrics::QueryMetrics;
use crate::result_queue::ResultQueue;
use crate::status::{QueryFailure, QueryLifecycle, QueryStatus};
use crate::store::{QueryStatusStore, TaskStatesStore, TaskStore};
use crate::task::{Checkpoint, QueryTask, TaskAction};
use crate::task_states::{TaskLifecycle, TaskStates};

/// Read-only composite of a query's status and scheduling state.
///
/// Assembled on demand for reporting; never persisted as one record. The
/// task-states half is absent for queries that were only defined and never
/// spawned a task batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryState {
    /// The query's status record.
    pub status: QueryStatus,
    /// The query's task-scheduling record, if any tasks were created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_states: Option<TaskStates>,
}

/// Orchestrator for the distributed query lifecycle.
pub struct QueryStorageCache {
    status_store: QueryStatusStore,
    task_states_store: TaskStatesStore,
    task_store: TaskStore,
    result_queue: Arc<dyn ResultQueue>,
    config: StorageCacheConfig,
    metrics: QueryMetrics,
}

impl QueryStorageCache {
    /// Creates an orchestrator over the given backend and result queue.
    #[must_use]
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        result_queue: Arc<dyn ResultQueue>,
        config: StorageCacheConfig,
    ) -> Self {
        Self {
            status_store: QueryStatusStore::new(Arc::clone(&backend))
                .with_lock_config(config.lock.clone()),
            task_states_store: TaskStatesStore::new(Arc::clone(&backend))
                .with_lock_config(config.lock.clone()),
            task_store: TaskStore::new(backend).with_lock_config(config.lock.clone()),
            result_queue,
            config,
            metrics: QueryMetrics::new(),
        }
    }

    /// The status store this orchestrator writes through.
    #[must_use]
    pub fn status_store(&self) -> &QueryStatusStore {
        &self.status_store
    }

    // --- Query creation --------------------------------------------------

    /// Registers a query definition without scheduling anything.
    ///
    /// Writes an initial status in the `Define` request state; no task and
    /// no task-states record exist until a create/plan/predict follows.
    ///
    /// # Errors
    ///
    /// Returns a storage error or a malformed-key error.
    #[tracing::instrument(skip(self, definition, auths))]
    pub async fn define_query(
        &self,
        pool: &str,
        logic: &str,
        definition: serde_json::Value,
        auths: BTreeSet<String>,
    ) -> Result<QueryKey> {
        let key = QueryKey::new(pool, QueryId::generate(), logic)?;
        let status = QueryStatus::new(key.clone(), definition, Utc::now()).with_auths(auths);
        // Fresh id, so no other process can be writing this entity yet.
        self.status_store.put(&status).await?;
        tracing::info!(key = %key, "query defined");
        Ok(key)
    }

    /// Registers a query for execution and enqueues its create task.
    ///
    /// # Errors
    ///
    /// Returns a storage error or a malformed-key error.
    pub async fn create_query(
        &self,
        pool: &str,
        logic: &str,
        definition: serde_json::Value,
        auths: BTreeSet<String>,
        max_running: Option<usize>,
    ) -> Result<TaskKey> {
        self.new_query_with_task(
            pool,
            logic,
            definition,
            auths,
            max_running,
            QueryLifecycle::Create,
            TaskAction::Create,
        )
        .await
    }

    /// Registers a one-shot planning query and enqueues its plan task.
    ///
    /// # Errors
    ///
    /// Returns a storage error or a malformed-key error.
    pub async fn plan_query(
        &self,
        pool: &str,
        logic: &str,
        definition: serde_json::Value,
        auths: BTreeSet<String>,
        max_running: Option<usize>,
    ) -> Result<TaskKey> {
        self.new_query_with_task(
            pool,
            logic,
            definition,
            auths,
            max_running,
            QueryLifecycle::Plan,
            TaskAction::Plan,
        )
        .await
    }

    /// Registers a one-shot prediction query and enqueues its predict task.
    ///
    /// # Errors
    ///
    /// Returns a storage error or a malformed-key error.
    pub async fn predict_query(
        &self,
        pool: &str,
        logic: &str,
        definition: serde_json::Value,
        auths: BTreeSet<String>,
        max_running: Option<usize>,
    ) -> Result<TaskKey> {
        self.new_query_with_task(
            pool,
            logic,
            definition,
            auths,
            max_running,
            QueryLifecycle::Predict,
            TaskAction::Predict,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(self, definition, auths), fields(request = %request))]
    async fn new_query_with_task(
        &self,
        pool: &str,
        logic: &str,
        definition: serde_json::Value,
        auths: BTreeSet<String>,
        max_running: Option<usize>,
        request: QueryLifecycle,
        action: TaskAction,
    ) -> Result<TaskKey> {
        let key = QueryKey::new(pool, QueryId::generate(), logic)?;
        let status = QueryStatus::new(key.clone(), definition, Utc::now())
            .with_lifecycle(request)
            .with_auths(auths);
        self.status_store.put(&status).await?;

        let mut states = TaskStates::new(
            key.clone(),
            max_running.unwrap_or(self.config.default_max_running),
        );
        let task_id = states.allocate_task_id();
        let task = QueryTask::new(task_id, action, Checkpoint::empty(key.clone()));
        self.task_store.put(&task).await?;
        states.set_state(task_id, Some(TaskLifecycle::Ready));
        self.task_states_store.put(&states).await?;

        tracing::info!(key = %key, task_id, action = %action, "query registered with initial task");
        Ok(task.to_key())
    }

    // --- Status reads ----------------------------------------------------

    /// Reads a query's status.
    ///
    /// # Errors
    ///
    /// Returns a storage error; absence is `Ok(None)`.
    pub async fn get_query_status(&self, query_id: QueryId) -> Result<Option<QueryStatus>> {
        self.status_store.get(query_id).await
    }

    /// Lists every query's status.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list_query_status(&self) -> Result<Vec<QueryStatus>> {
        self.status_store.list_all().await
    }

    /// Assembles the read-only composite view of one query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueryNotFound`] if the query doesn't exist, or a
    /// storage error.
    pub async fn get_query_state(&self, query_id: QueryId) -> Result<QueryState> {
        let status = self
            .status_store
            .get(query_id)
            .await?
            .ok_or(Error::QueryNotFound { query_id })?;
        let task_states = self.task_states_store.get(query_id).await?;
        Ok(QueryState {
            status,
            task_states,
        })
    }

    /// Builds a staleness-bounded cached wrapper for one query's status,
    /// wired with this orchestrator's configured cache tuning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueryNotFound`] if the query doesn't exist, or a
    /// storage error.
    pub async fn cached_status(&self, query_id: QueryId) -> Result<CachedQueryStatus> {
        CachedQueryStatus::new(self.status_store.clone(), query_id, self.config.cache.clone())
            .await
    }

    // --- Status writes ---------------------------------------------------

    /// Transitions a query's lifecycle state.
    ///
    /// Idempotent: requesting the state the query is already in is a
    /// no-op. Permissive by design — any caller holding the lock may set
    /// any state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueryNotFound`] or a storage error.
    #[tracing::instrument(skip(self), fields(query_id = %query_id, target = %target))]
    pub async fn update_query_status(
        &self,
        query_id: QueryId,
        target: QueryLifecycle,
    ) -> Result<()> {
        self.with_status(query_id, |status| {
            let from = status.lifecycle.as_label();
            if status.set_lifecycle(target) {
                self.metrics
                    .record_lifecycle_transition(from, target.as_label());
            }
        })
        .await
    }

    /// Records an execution failure into a query's status.
    ///
    /// The failure detail is written atomically with the `Failed` state so
    /// every process observes them together.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueryNotFound`] or a storage error.
    #[tracing::instrument(skip(self, failure), fields(query_id = %query_id))]
    pub async fn update_failed_query_status(
        &self,
        query_id: QueryId,
        failure: QueryFailure,
    ) -> Result<()> {
        self.with_status(query_id, |status| {
            let from = status.lifecycle.as_label();
            status.record_failure(failure);
            self.metrics.record_lifecycle_transition(from, "failed");
        })
        .await
    }

    /// Lock-bracketed read-modify-write on one query's status.
    async fn with_status(
        &self,
        query_id: QueryId,
        mutate: impl FnOnce(&mut QueryStatus),
    ) -> Result<()> {
        let lock = self.status_store.lock(query_id);
        let guard = lock.lock().await?;
        self.metrics.record_lock_acquisition("query-status", true);

        let outcome = async {
            let mut status = self
                .status_store
                .get(query_id)
                .await?
                .ok_or(Error::QueryNotFound { query_id })?;
            mutate(&mut status);
            status.touch_updated(Utc::now());
            self.status_store.put(&status).await
        }
        .await;

        match outcome {
            Ok(()) => {
                guard.release().await?;
                Ok(())
            }
            Err(e) => {
                let _ = guard.release().await;
                Err(e)
            }
        }
    }

    // --- Task scheduling -------------------------------------------------

    /// Attempts a task lifecycle transition.
    ///
    /// Returns `Ok(false)` when the transition was refused by the
    /// RUNNING-bucket admission gate — a normal scheduling signal meaning
    /// "no capacity, do not dispatch", never an error. `target = None`
    /// drops the task from the scheduling record entirely.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueryNotFound`] if the query has no task-states
    /// record, or a storage error.
    #[tracing::instrument(skip(self), fields(task = %task_key))]
    pub async fn update_task_state(
        &self,
        task_key: &TaskKey,
        target: Option<TaskLifecycle>,
    ) -> Result<bool> {
        let query_id = task_key.query_key.query_id;
        let lock = self.task_states_store.lock(query_id);
        let guard = lock.lock().await?;
        self.metrics.record_lock_acquisition("task-states", true);

        let outcome = async {
            let mut states = self
                .task_states_store
                .get(query_id)
                .await?
                .ok_or(Error::QueryNotFound { query_id })?;
            let admitted = states.set_state(task_key.task_id, target);
            if admitted {
                self.task_states_store.put(&states).await?;
            }
            Ok::<bool, Error>(admitted)
        }
        .await;

        match outcome {
            Ok(admitted) => {
                guard.release().await?;
                if target == Some(TaskLifecycle::Running) {
                    self.metrics.record_admission(admitted);
                }
                Ok(admitted)
            }
            Err(e) => {
                let _ = guard.release().await;
                Err(e)
            }
        }
    }

    /// Creates a new task for an existing query and marks it ready.
    ///
    /// The task id comes from the counter in the query's task-states
    /// record, so allocation serializes on the task-states lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueryNotFound`] if the query has no task-states
    /// record, or a storage error.
    #[tracing::instrument(skip(self, checkpoint), fields(query = %checkpoint.query_key, action = %action))]
    pub async fn create_task(
        &self,
        action: TaskAction,
        checkpoint: Checkpoint,
    ) -> Result<QueryTask> {
        let query_id = checkpoint.query_key.query_id;
        let lock = self.task_states_store.lock(query_id);
        let guard = lock.lock().await?;
        self.metrics.record_lock_acquisition("task-states", true);

        let outcome = async {
            let mut states = self
                .task_states_store
                .get(query_id)
                .await?
                .ok_or(Error::QueryNotFound { query_id })?;
            let task_id = states.allocate_task_id();
            let task = QueryTask::new(task_id, action, checkpoint);
            self.task_store.put(&task).await?;
            states.set_state(task_id, Some(TaskLifecycle::Ready));
            self.task_states_store.put(&states).await?;
            Ok::<QueryTask, Error>(task)
        }
        .await;

        match outcome {
            Ok(task) => {
                guard.release().await?;
                Ok(task)
            }
            Err(e) => {
                let _ = guard.release().await;
                Err(e)
            }
        }
    }

    /// Reads a task record.
    ///
    /// # Errors
    ///
    /// Returns a storage error; absence is `Ok(None)`.
    pub async fn get_task(&self, task_key: &TaskKey) -> Result<Option<QueryTask>> {
        self.task_store.get(task_key).await
    }

    /// Lists one query's task records in task-id order.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn get_tasks(&self, query_key: &QueryKey) -> Result<Vec<QueryTask>> {
        self.task_store.list_for_query(query_key).await
    }

    /// Replaces a task's checkpoint, returning the updated task.
    ///
    /// The running executor owns its task record, so this write is not
    /// lock-bracketed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] when the task no longer exists —
    /// distinct from a storage error, so callers can tell "someone else
    /// deleted this" from "the store is down".
    #[tracing::instrument(skip(self, checkpoint), fields(task = %task_key))]
    pub async fn checkpoint_task(
        &self,
        task_key: &TaskKey,
        checkpoint: Checkpoint,
    ) -> Result<QueryTask> {
        let task = self
            .task_store
            .get(task_key)
            .await?
            .ok_or_else(|| Error::TaskNotFound {
                task_key: task_key.clone(),
            })?;
        let updated = task.with_checkpoint(checkpoint);
        self.task_store.put(&updated).await?;
        Ok(updated)
    }

    /// Deletes a task record and drops it from the scheduling record.
    ///
    /// Returns whether the task previously existed.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    #[tracing::instrument(skip(self), fields(task = %task_key))]
    pub async fn delete_task(&self, task_key: &TaskKey) -> Result<bool> {
        if self.task_store.get(task_key).await?.is_none() {
            return Ok(false);
        }
        self.task_store.evict(task_key).await?;
        // Tolerate a scheduling record that was already torn down.
        match self.update_task_state(task_key, None).await {
            Ok(_) | Err(Error::QueryNotFound { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    // --- Teardown --------------------------------------------------------

    /// Deletes a query's entire footprint: status, task states, every task
    /// record, and the query's result queue.
    ///
    /// Returns false — mutating nothing — when the query doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    #[tracing::instrument(skip(self), fields(query_id = %query_id))]
    pub async fn delete_query(&self, query_id: QueryId) -> Result<bool> {
        let lock = self.status_store.lock(query_id);
        let guard = lock.lock().await?;
        self.metrics.record_lock_acquisition("query-status", true);

        let outcome = async {
            let Some(status) = self.status_store.get(query_id).await? else {
                return Ok::<bool, Error>(false);
            };

            self.status_store.evict(query_id).await?;
            self.task_states_store.evict(query_id).await?;
            self.task_store.evict_for_query(&status.key).await?;
            self.result_queue.delete_query(query_id).await?;
            tracing::info!(key = %status.key, "query deleted");
            Ok(true)
        }
        .await;

        match outcome {
            Ok(existed) => {
                guard.release().await?;
                Ok(existed)
            }
            Err(e) => {
                let _ = guard.release().await;
                Err(e)
            }
        }
    }

    /// Drains every query's result queue, then wipes all three stores.
    ///
    /// Administrative only: not safe under concurrent query activity.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    #[tracing::instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        for status in self.status_store.list_all().await? {
            self.result_queue
                .empty_query(status.key.query_id)
                .await?;
        }
        self.status_store.clear().await?;
        self.task_states_store.clear().await?;
        self.task_store.clear().await?;
        tracing::warn!("query storage cleared");
        Ok(())
    }
}
