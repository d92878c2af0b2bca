//! Persistence-facing stores for the three coordinated entity kinds.
//!
//! Thin wrappers translating entity reads and writes into backing-store
//! operations, each owning one key namespace. Entity writes are
//! unconditional: mutual exclusion comes from the per-entity distributed
//! lock, which each store also hands out. CAS stays reserved for the lock
//! protocol itself.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use strata_core::{DistributedLock, KeyValueBackend, LockConfig, QueryId};

use crate::error::{Error, Result};
use crate::key::{QueryKey, TaskKey};
use crate::paths;
use crate::status::QueryStatus;
use crate::task::QueryTask;
use crate::task_states::TaskStates;

async fn get_json<T: DeserializeOwned>(
    backend: &dyn KeyValueBackend,
    path: &str,
) -> Result<Option<T>> {
    match backend.get(path).await {
        Ok(data) => {
            let value = serde_json::from_slice(&data)
                .map_err(|e| Error::Serialization {
                    message: format!("parse {path}: {e}"),
                })?;
            Ok(Some(value))
        }
        Err(strata_core::Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn put_json<T: Serialize>(
    backend: &dyn KeyValueBackend,
    path: &str,
    value: &T,
) -> Result<()> {
    let data = serde_json::to_vec(value).map_err(|e| Error::Serialization {
        message: format!("serialize {path}: {e}"),
    })?;
    backend
        .put(path, Bytes::from(data), strata_core::WritePrecondition::None)
        .await?;
    Ok(())
}

async fn clear_prefix(backend: &dyn KeyValueBackend, prefix: &str) -> Result<()> {
    for meta in backend.list(prefix).await? {
        backend.delete(&meta.path).await?;
    }
    Ok(())
}

/// Store for [`QueryStatus`] records, keyed by query id.
pub struct QueryStatusStore {
    backend: Arc<dyn KeyValueBackend>,
    lock_config: LockConfig,
}

impl Clone for QueryStatusStore {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            lock_config: self.lock_config.clone(),
        }
    }
}

impl QueryStatusStore {
    /// Creates a new store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            backend,
            lock_config: LockConfig::default(),
        }
    }

    /// Overrides the lock tuning used by [`QueryStatusStore::lock`].
    #[must_use]
    pub fn with_lock_config(mut self, config: LockConfig) -> Self {
        self.lock_config = config;
        self
    }

    /// Reads a query's status record.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error; absence is `Ok(None)`.
    pub async fn get(&self, query_id: QueryId) -> Result<Option<QueryStatus>> {
        get_json(self.backend.as_ref(), &paths::query_status(query_id)).await
    }

    /// Writes a query's status record.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error.
    pub async fn put(&self, status: &QueryStatus) -> Result<()> {
        put_json(
            self.backend.as_ref(),
            &paths::query_status(status.key.query_id),
            status,
        )
        .await
    }

    /// Removes a query's status record (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn evict(&self, query_id: QueryId) -> Result<()> {
        Ok(self
            .backend
            .delete(&paths::query_status(query_id))
            .await?)
    }

    /// Lists every stored status record.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error.
    pub async fn list_all(&self) -> Result<Vec<QueryStatus>> {
        let mut out = Vec::new();
        for meta in self.backend.list(paths::QUERY_STATUS_PREFIX).await? {
            // A concurrent delete between list and get is not an error.
            if let Some(status) = get_json(self.backend.as_ref(), &meta.path).await? {
                out.push(status);
            }
        }
        Ok(out)
    }

    /// Returns the lock handle guarding one query's status record.
    #[must_use]
    pub fn lock(&self, query_id: QueryId) -> DistributedLock<dyn KeyValueBackend> {
        DistributedLock::with_config(
            Arc::clone(&self.backend),
            paths::query_status_lock(query_id),
            self.lock_config.clone(),
        )
    }

    /// Removes every status record. Administrative only.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn clear(&self) -> Result<()> {
        clear_prefix(self.backend.as_ref(), paths::QUERY_STATUS_PREFIX).await
    }
}

/// Store for [`TaskStates`] records, keyed by query id.
pub struct TaskStatesStore {
    backend: Arc<dyn KeyValueBackend>,
    lock_config: LockConfig,
}

impl Clone for TaskStatesStore {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            lock_config: self.lock_config.clone(),
        }
    }
}

impl TaskStatesStore {
    /// Creates a new store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            backend,
            lock_config: LockConfig::default(),
        }
    }

    /// Overrides the lock tuning used by [`TaskStatesStore::lock`].
    #[must_use]
    pub fn with_lock_config(mut self, config: LockConfig) -> Self {
        self.lock_config = config;
        self
    }

    /// Reads a query's task-states record.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error; absence is `Ok(None)`.
    pub async fn get(&self, query_id: QueryId) -> Result<Option<TaskStates>> {
        get_json(self.backend.as_ref(), &paths::task_states(query_id)).await
    }

    /// Writes a query's task-states record.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error.
    pub async fn put(&self, states: &TaskStates) -> Result<()> {
        put_json(
            self.backend.as_ref(),
            &paths::task_states(states.query_key.query_id),
            states,
        )
        .await
    }

    /// Removes a query's task-states record (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn evict(&self, query_id: QueryId) -> Result<()> {
        Ok(self.backend.delete(&paths::task_states(query_id)).await?)
    }

    /// Returns the lock handle guarding one query's task-states record.
    #[must_use]
    pub fn lock(&self, query_id: QueryId) -> DistributedLock<dyn KeyValueBackend> {
        DistributedLock::with_config(
            Arc::clone(&self.backend),
            paths::task_states_lock(query_id),
            self.lock_config.clone(),
        )
    }

    /// Removes every task-states record. Administrative only.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn clear(&self) -> Result<()> {
        clear_prefix(self.backend.as_ref(), paths::TASK_STATES_PREFIX).await
    }
}

/// Store for [`QueryTask`] records, keyed by canonical task key.
pub struct TaskStore {
    backend: Arc<dyn KeyValueBackend>,
    lock_config: LockConfig,
}

impl Clone for TaskStore {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            lock_config: self.lock_config.clone(),
        }
    }
}

impl TaskStore {
    /// Creates a new store over the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            backend,
            lock_config: LockConfig::default(),
        }
    }

    /// Overrides the lock tuning used by [`TaskStore::lock`].
    #[must_use]
    pub fn with_lock_config(mut self, config: LockConfig) -> Self {
        self.lock_config = config;
        self
    }

    /// Returns the lock handle guarding one task record.
    #[must_use]
    pub fn lock(&self, key: &TaskKey) -> DistributedLock<dyn KeyValueBackend> {
        DistributedLock::with_config(
            Arc::clone(&self.backend),
            paths::task_lock(key),
            self.lock_config.clone(),
        )
    }

    /// Reads a task record.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error; absence is `Ok(None)`.
    pub async fn get(&self, key: &TaskKey) -> Result<Option<QueryTask>> {
        get_json(self.backend.as_ref(), &paths::task(key)).await
    }

    /// Writes a task record.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error.
    pub async fn put(&self, task: &QueryTask) -> Result<()> {
        put_json(self.backend.as_ref(), &paths::task(&task.to_key()), task).await
    }

    /// Removes a task record (idempotent).
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn evict(&self, key: &TaskKey) -> Result<()> {
        Ok(self.backend.delete(&paths::task(key)).await?)
    }

    /// Lists one query's tasks via the shared key prefix.
    ///
    /// # Errors
    ///
    /// Returns a storage or serialization error.
    pub async fn list_for_query(&self, key: &QueryKey) -> Result<Vec<QueryTask>> {
        let mut out = Vec::new();
        for meta in self.backend.list(&paths::tasks_for_query(key)).await? {
            if let Some(task) = get_json(self.backend.as_ref(), &meta.path).await? {
                out.push(task);
            }
        }
        out.sort_by_key(|t: &QueryTask| t.task_id);
        Ok(out)
    }

    /// Removes every task record belonging to one query.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn evict_for_query(&self, key: &QueryKey) -> Result<()> {
        clear_prefix(self.backend.as_ref(), &paths::tasks_for_query(key)).await
    }

    /// Removes every task record. Administrative only.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn clear(&self) -> Result<()> {
        clear_prefix(self.backend.as_ref(), paths::TASKS_PREFIX).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::QueryLifecycle;
    use crate::task::{Checkpoint, QueryTask, TaskAction};
    use chrono::Utc;
    use strata_core::MemoryBackend;

    fn backend() -> Arc<dyn KeyValueBackend> {
        Arc::new(MemoryBackend::new())
    }

    fn query_key() -> QueryKey {
        QueryKey::new("default", QueryId::generate(), "EventQuery").unwrap()
    }

    #[tokio::test]
    async fn status_store_roundtrip() {
        let store = QueryStatusStore::new(backend());
        let key = query_key();
        let status = QueryStatus::new(key.clone(), serde_json::Value::Null, Utc::now())
            .with_lifecycle(QueryLifecycle::Create);

        store.put(&status).await.expect("put");
        let loaded = store
            .get(key.query_id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.key, key);
        assert_eq!(loaded.lifecycle, QueryLifecycle::Create);

        store.evict(key.query_id).await.expect("evict");
        assert!(store.get(key.query_id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn status_store_list_all() {
        let store = QueryStatusStore::new(backend());
        for _ in 0..3 {
            let status = QueryStatus::new(query_key(), serde_json::Value::Null, Utc::now());
            store.put(&status).await.expect("put");
        }
        assert_eq!(store.list_all().await.expect("list").len(), 3);

        store.clear().await.expect("clear");
        assert!(store.list_all().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn task_store_prefix_listing_is_per_query() {
        let store = TaskStore::new(backend());
        let key_a = query_key();
        let key_b = query_key();

        for id in 0..2 {
            store
                .put(&QueryTask::new(
                    id,
                    TaskAction::Next,
                    Checkpoint::empty(key_a.clone()),
                ))
                .await
                .expect("put");
        }
        store
            .put(&QueryTask::new(
                0,
                TaskAction::Create,
                Checkpoint::empty(key_b.clone()),
            ))
            .await
            .expect("put");

        let tasks_a = store.list_for_query(&key_a).await.expect("list");
        assert_eq!(tasks_a.len(), 2);
        assert_eq!(tasks_a[0].task_id, 0);
        assert_eq!(tasks_a[1].task_id, 1);

        store.evict_for_query(&key_a).await.expect("evict");
        assert!(store.list_for_query(&key_a).await.expect("list").is_empty());
        assert_eq!(store.list_for_query(&key_b).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn task_states_store_roundtrip() {
        let store = TaskStatesStore::new(backend());
        let key = query_key();
        let mut states = TaskStates::new(key.clone(), 4);
        let id = states.allocate_task_id();
        states.set_state(id, Some(crate::task_states::TaskLifecycle::Ready));

        store.put(&states).await.expect("put");
        let loaded = store
            .get(key.query_id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.max_running, 4);
        assert_eq!(loaded.next_task_id, 1);
    }

    #[tokio::test]
    async fn store_locks_are_per_entity() {
        let backend = backend();
        let status_store = QueryStatusStore::new(Arc::clone(&backend));
        let states_store = TaskStatesStore::new(backend);
        let id = QueryId::generate();

        // The two entity locks for one query never contend with each other.
        let g1 = status_store.lock(id).lock().await.expect("status lock");
        let g2 = states_store.lock(id).lock().await.expect("states lock");
        g1.release().await.expect("release");
        g2.release().await.expect("release");
    }
}
