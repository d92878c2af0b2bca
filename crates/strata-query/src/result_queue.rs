//! Result-queue collaborator boundary.
//!
//! The core never transports results itself; it only needs to purge a
//! query's in-flight result messages when the query is deleted or the
//! system is wiped. Everything else about the queue is someone else's
//! contract.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use strata_core::QueryId;

use crate::error::{Error, Result};

/// The two queue operations this core invokes.
#[async_trait]
pub trait ResultQueue: Send + Sync {
    /// Removes the queue for a query entirely.
    async fn delete_query(&self, query_id: QueryId) -> Result<()>;

    /// Drains a query's queue, leaving it in place.
    async fn empty_query(&self, query_id: QueryId) -> Result<()>;
}

/// In-memory result queue for tests.
///
/// Tracks per-query messages so tests can observe purging.
#[derive(Debug, Default)]
pub struct MemoryResultQueue {
    queues: RwLock<HashMap<QueryId, Vec<Bytes>>>,
}

impl MemoryResultQueue {
    /// Creates a new empty queue set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message to a query's queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn publish(&self, query_id: QueryId, message: Bytes) -> Result<()> {
        self.queues
            .write()
            .map_err(|_| Error::storage("lock poisoned"))?
            .entry(query_id)
            .or_default()
            .push(message);
        Ok(())
    }

    /// Returns the number of queued messages for a query, or `None` if the
    /// queue was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn len(&self, query_id: QueryId) -> Result<Option<usize>> {
        Ok(self
            .queues
            .read()
            .map_err(|_| Error::storage("lock poisoned"))?
            .get(&query_id)
            .map(Vec::len))
    }
}

#[async_trait]
impl ResultQueue for MemoryResultQueue {
    async fn delete_query(&self, query_id: QueryId) -> Result<()> {
        self.queues
            .write()
            .map_err(|_| Error::storage("lock poisoned"))?
            .remove(&query_id);
        Ok(())
    }

    async fn empty_query(&self, query_id: QueryId) -> Result<()> {
        if let Some(queue) = self
            .queues
            .write()
            .map_err(|_| Error::storage("lock poisoned"))?
            .get_mut(&query_id)
        {
            queue.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_removes_queue() {
        let queue = MemoryResultQueue::new();
        let id = QueryId::generate();
        queue.publish(id, Bytes::from("page-1")).unwrap();

        queue.delete_query(id).await.unwrap();
        assert_eq!(queue.len(id).unwrap(), None);
    }

    #[tokio::test]
    async fn empty_drains_but_keeps_queue() {
        let queue = MemoryResultQueue::new();
        let id = QueryId::generate();
        queue.publish(id, Bytes::from("page-1")).unwrap();
        queue.publish(id, Bytes::from("page-2")).unwrap();

        queue.empty_query(id).await.unwrap();
        assert_eq!(queue.len(id).unwrap(), Some(0));
    }

    #[tokio::test]
    async fn purging_unknown_query_is_a_noop() {
        let queue = MemoryResultQueue::new();
        let id = QueryId::generate();
        queue.delete_query(id).await.unwrap();
        queue.empty_query(id).await.unwrap();
    }
}
