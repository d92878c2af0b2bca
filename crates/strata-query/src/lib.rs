//! # strata-query
//!
//! Distributed lifecycle coordination for long-running, multi-stage query
//! executions.
//!
//! Many stateless worker processes act concurrently on the same logical
//! query — planning, producing results, paging, canceling. This crate
//! gives them a consistent view of where a query stands and what work
//! remains, using nothing but a shared key/value backing store and
//! per-entity leased locks: no central scheduler, no consensus protocol.
//!
//! ## Core Concepts
//!
//! - **Query status**: the authoritative per-query record (lifecycle
//!   state, counters, timestamps, failure detail), mutated only under the
//!   query's status lock
//! - **Task states**: the per-query scheduling record partitioning task
//!   ids into lifecycle buckets, with a hard concurrency ceiling on the
//!   RUNNING bucket
//! - **Cached status**: a staleness-bounded local copy that coalesces
//!   high-frequency counter increments into periodic merged flushes
//! - **Storage cache**: the orchestration surface workers call
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//!
//! use strata_core::MemoryBackend;
//! use strata_query::config::StorageCacheConfig;
//! use strata_query::result_queue::MemoryResultQueue;
//! use strata_query::storage_cache::QueryStorageCache;
//! use strata_query::task_states::TaskLifecycle;
//!
//! # async fn example() -> strata_query::error::Result<()> {
//! let cache = QueryStorageCache::new(
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(MemoryResultQueue::new()),
//!     StorageCacheConfig::default(),
//! );
//!
//! let task_key = cache
//!     .create_query(
//!         "default",
//!         "EventQuery",
//!         serde_json::json!({"query": "field == value"}),
//!         BTreeSet::from(["A".to_string()]),
//!         Some(4),
//!     )
//!     .await?;
//!
//! // Dispatch is admission-controlled: false means no capacity.
//! let admitted = cache
//!     .update_task_state(&task_key, Some(TaskLifecycle::Running))
//!     .await?;
//! assert!(admitted);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cached;
pub mod config;
pub mod error;
pub mod key;
pub mod metrics;
pub mod paths;
pub mod result_queue;
pub mod status;
pub mod storage_cache;
pub mod store;
pub mod task;
pub mod task_states;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cached::CachedQueryStatus;
    pub use crate::config::{CacheConfig, RefreshMode, StorageCacheConfig};
    pub use crate::error::{Error, Result};
    pub use crate::key::{QueryKey, TaskKey};
    pub use crate::metrics::QueryMetrics;
    pub use crate::result_queue::{MemoryResultQueue, ResultQueue};
    pub use crate::status::{QueryFailure, QueryLifecycle, QueryStatus};
    pub use crate::storage_cache::{QueryState, QueryStorageCache};
    pub use crate::store::{QueryStatusStore, TaskStatesStore, TaskStore};
    pub use crate::task::{Checkpoint, QueryTask, TaskAction};
    pub use crate::task_states::{TaskLifecycle, TaskStates};
}
