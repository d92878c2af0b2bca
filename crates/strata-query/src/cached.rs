//! Staleness-bounded cache for one query's status.
//!
//! Many cooperating processes increment the same per-query counters once
//! per record; writing the authoritative record on every increment would
//! turn the backing store into a contention point. `CachedQueryStatus`
//! wraps the plain [`QueryStatus`] with two mitigations:
//!
//! - **Staleness-bounded reads**: a local copy is refreshed at most every
//!   `staleness` interval (lazily on read, or on a background timer).
//! - **Counter coalescing**: the four high-frequency counters
//!   (`num_results_generated`, `num_results_returned`, `next_count`,
//!   `seek_count`) buffer locally and merge into the store on refresh.
//!   They are commutative under addition, so flush order between processes
//!   does not matter.
//!
//! Every other field changes rarely and must not silently lose a
//! concurrent counter flush from another process, so its setter pays the
//! full cost: lock, reload, merge local deltas, apply, write back, unlock.
//! The refresh body is shared between the lazy read path, the timer task,
//! and the write path.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use strata_core::QueryId;

use crate::config::{CacheConfig, RefreshMode};
use crate::error::{Error, Result};
use crate::metrics::QueryMetrics;
use crate::status::{QueryFailure, QueryLifecycle, QueryStatus};
use crate::store::QueryStatusStore;

/// Locally-buffered counter increments awaiting a flush.
#[derive(Debug, Clone, Copy, Default)]
struct CounterDeltas {
    results_generated: u64,
    results_returned: u64,
    next_count: u64,
    seek_count: u64,
}

impl CounterDeltas {
    fn apply_to(self, status: &mut QueryStatus) {
        status.num_results_generated = status
            .num_results_generated
            .saturating_add(self.results_generated);
        status.num_results_returned = status
            .num_results_returned
            .saturating_add(self.results_returned);
        status.next_count = status.next_count.saturating_add(self.next_count);
        status.seek_count = status.seek_count.saturating_add(self.seek_count);
    }
}

#[derive(Debug)]
struct Inner {
    status: QueryStatus,
    loaded_at: Instant,
    deltas: CounterDeltas,
}

struct Shared {
    store: QueryStatusStore,
    query_id: QueryId,
    config: CacheConfig,
    metrics: QueryMetrics,
    inner: Mutex<Inner>,
}

impl Shared {
    /// The one refresh body: lock, reload, merge deltas, optionally apply
    /// a mutation, write back, unlock.
    ///
    /// Deltas are only zeroed after the merged record is durably written;
    /// on any failure they stay buffered for the next attempt.
    async fn refresh_with(
        &self,
        trigger: &'static str,
        mutate: impl FnOnce(&mut QueryStatus),
    ) -> Result<()> {
        let lock = self.store.lock(self.query_id);
        let guard = lock.lock_with_lease(self.config.lock_lease).await?;
        self.metrics.record_lock_acquisition("query-status", true);

        let mut inner = self.inner.lock().await;
        let outcome = async {
            let mut status = self
                .store
                .get(self.query_id)
                .await?
                .ok_or(Error::QueryNotFound {
                    query_id: self.query_id,
                })?;
            inner.deltas.apply_to(&mut status);
            mutate(&mut status);
            self.store.put(&status).await?;
            Ok::<QueryStatus, Error>(status)
        }
        .await;

        match outcome {
            Ok(status) => {
                let flushed = inner.deltas;
                self.metrics
                    .record_counter_flush("num_results_generated", flushed.results_generated);
                self.metrics
                    .record_counter_flush("num_results_returned", flushed.results_returned);
                self.metrics
                    .record_counter_flush("next_count", flushed.next_count);
                self.metrics
                    .record_counter_flush("seek_count", flushed.seek_count);

                inner.deltas = CounterDeltas::default();
                inner.status = status;
                inner.loaded_at = Instant::now();
                drop(inner);

                guard.release().await?;
                self.metrics.record_cache_refresh(trigger);
                Ok(())
            }
            Err(e) => {
                drop(inner);
                // The lease cleans up if this release also fails.
                let _ = guard.release().await;
                Err(e)
            }
        }
    }

    async fn refresh(&self, trigger: &'static str) -> Result<()> {
        self.refresh_with(trigger, |_| {}).await
    }

    /// Lazy-mode staleness check; no-op under a timer.
    async fn ensure_fresh(&self) -> Result<()> {
        if self.config.refresh != RefreshMode::Lazy {
            return Ok(());
        }
        {
            let inner = self.inner.lock().await;
            if inner.loaded_at.elapsed() < self.config.staleness {
                return Ok(());
            }
        }
        self.refresh("lazy").await
    }
}

/// A query status wrapper with staleness control and counter coalescing.
///
/// Internally thread-safe: mutating and refreshing methods are mutually
/// exclusive within the process. Cross-process exclusion comes from the
/// per-query status lock taken on every refresh.
pub struct CachedQueryStatus {
    shared: Arc<Shared>,
    refresher: StdMutex<Option<JoinHandle<()>>>,
}

impl CachedQueryStatus {
    /// Creates a wrapper around one query's status, loading the initial
    /// authoritative copy.
    ///
    /// With [`RefreshMode::Timer`] the background refresh task starts
    /// immediately; it is owned by this instance and stops with it (or via
    /// [`CachedQueryStatus::stop`]).
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueryNotFound`] if the query doesn't exist, or a
    /// storage error.
    pub async fn new(
        store: QueryStatusStore,
        query_id: QueryId,
        config: CacheConfig,
    ) -> Result<Self> {
        let status = store
            .get(query_id)
            .await?
            .ok_or(Error::QueryNotFound { query_id })?;

        let shared = Arc::new(Shared {
            store,
            query_id,
            config,
            metrics: QueryMetrics::new(),
            inner: Mutex::new(Inner {
                status,
                loaded_at: Instant::now(),
                deltas: CounterDeltas::default(),
            }),
        });

        let cached = Self {
            shared,
            refresher: StdMutex::new(None),
        };
        if cached.shared.config.refresh == RefreshMode::Timer {
            cached.start();
        }
        Ok(cached)
    }

    /// Starts the background refresh task (timer mode). Idempotent.
    pub fn start(&self) {
        let mut slot = self.refresher.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(shared.config.staleness).await;
                if let Err(e) = shared.refresh("timer").await {
                    tracing::warn!(query_id = %shared.query_id, error = %e, "timer refresh failed");
                }
            }
        }));
    }

    /// Stops the background refresh task, if running.
    pub fn stop(&self) {
        let mut slot = self.refresher.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    /// The query this wrapper tracks.
    #[must_use]
    pub fn query_id(&self) -> QueryId {
        self.shared.query_id
    }

    /// Forces a refresh regardless of staleness.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::QueryNotFound`] if the query
    /// was deleted underneath us.
    pub async fn refresh(&self) -> Result<()> {
        self.shared.refresh("forced").await
    }

    // --- Reads -----------------------------------------------------------

    /// Returns a snapshot of the status with unflushed counter deltas
    /// folded in, refreshing first if the copy is stale (lazy mode).
    ///
    /// # Errors
    ///
    /// Returns a storage error from a triggered refresh.
    pub async fn status(&self) -> Result<QueryStatus> {
        self.shared.ensure_fresh().await?;
        let inner = self.shared.inner.lock().await;
        let mut snapshot = inner.status.clone();
        inner.deltas.apply_to(&mut snapshot);
        Ok(snapshot)
    }

    /// Results generated so far: last-loaded value plus unflushed delta.
    ///
    /// # Errors
    ///
    /// Returns a storage error from a triggered refresh.
    pub async fn num_results_generated(&self) -> Result<u64> {
        self.shared.ensure_fresh().await?;
        let inner = self.shared.inner.lock().await;
        Ok(inner
            .status
            .num_results_generated
            .saturating_add(inner.deltas.results_generated))
    }

    /// Results returned so far: last-loaded value plus unflushed delta.
    ///
    /// # Errors
    ///
    /// Returns a storage error from a triggered refresh.
    pub async fn num_results_returned(&self) -> Result<u64> {
        self.shared.ensure_fresh().await?;
        let inner = self.shared.inner.lock().await;
        Ok(inner
            .status
            .num_results_returned
            .saturating_add(inner.deltas.results_returned))
    }

    /// Paging calls so far: last-loaded value plus unflushed delta.
    ///
    /// # Errors
    ///
    /// Returns a storage error from a triggered refresh.
    pub async fn next_count(&self) -> Result<u64> {
        self.shared.ensure_fresh().await?;
        let inner = self.shared.inner.lock().await;
        Ok(inner.status.next_count.saturating_add(inner.deltas.next_count))
    }

    /// Seeks so far: last-loaded value plus unflushed delta.
    ///
    /// # Errors
    ///
    /// Returns a storage error from a triggered refresh.
    pub async fn seek_count(&self) -> Result<u64> {
        self.shared.ensure_fresh().await?;
        let inner = self.shared.inner.lock().await;
        Ok(inner.status.seek_count.saturating_add(inner.deltas.seek_count))
    }

    /// Current lifecycle state per the cached copy.
    ///
    /// # Errors
    ///
    /// Returns a storage error from a triggered refresh.
    pub async fn lifecycle(&self) -> Result<QueryLifecycle> {
        self.shared.ensure_fresh().await?;
        let inner = self.shared.inner.lock().await;
        Ok(inner.status.lifecycle)
    }

    /// In-flight paging calls per the cached copy.
    ///
    /// # Errors
    ///
    /// Returns a storage error from a triggered refresh.
    pub async fn active_next_calls(&self) -> Result<u64> {
        self.shared.ensure_fresh().await?;
        let inner = self.shared.inner.lock().await;
        Ok(inner.status.active_next_calls)
    }

    // --- Coalesced counter increments (no store round trip) --------------

    /// Buffers an increment to `num_results_generated`.
    pub async fn add_results_generated(&self, n: u64) {
        let mut inner = self.shared.inner.lock().await;
        inner.deltas.results_generated = inner.deltas.results_generated.saturating_add(n);
    }

    /// Buffers an increment to `num_results_returned`.
    pub async fn add_results_returned(&self, n: u64) {
        let mut inner = self.shared.inner.lock().await;
        inner.deltas.results_returned = inner.deltas.results_returned.saturating_add(n);
    }

    /// Buffers an increment to `next_count`.
    pub async fn add_next_count(&self, n: u64) {
        let mut inner = self.shared.inner.lock().await;
        inner.deltas.next_count = inner.deltas.next_count.saturating_add(n);
    }

    /// Buffers an increment to `seek_count`.
    pub async fn add_seek_count(&self, n: u64) {
        let mut inner = self.shared.inner.lock().await;
        inner.deltas.seek_count = inner.deltas.seek_count.saturating_add(n);
    }

    // --- Write-through mutators (full lock/merge/write cycle) ------------
    //
    // Each stamps `last_updated_at`: these are service writes.

    /// Sets the lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::QueryNotFound`].
    pub async fn set_lifecycle(&self, target: QueryLifecycle) -> Result<()> {
        self.update(move |status| {
            status.set_lifecycle(target);
        })
        .await
    }

    /// Sets the plan text.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::QueryNotFound`].
    pub async fn set_plan(&self, plan: impl Into<String>) -> Result<()> {
        let plan = plan.into();
        self.update(move |status| status.plan = Some(plan)).await
    }

    /// Replaces the query definition payload.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::QueryNotFound`].
    pub async fn set_definition(&self, definition: serde_json::Value) -> Result<()> {
        self.update(move |status| status.definition = definition)
            .await
    }

    /// Replaces the computed authorization set.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::QueryNotFound`].
    pub async fn set_computed_auths(
        &self,
        auths: std::collections::BTreeSet<String>,
    ) -> Result<()> {
        self.update(move |status| status.computed_auths = auths)
            .await
    }

    /// Records a failure atomically with the `Failed` state.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::QueryNotFound`].
    pub async fn record_failure(&self, failure: QueryFailure) -> Result<()> {
        self.update(move |status| status.record_failure(failure))
            .await
    }

    /// Increments the in-flight paging gauge.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::QueryNotFound`].
    pub async fn increment_active_next_calls(&self) -> Result<()> {
        self.update(QueryStatus::increment_active_next_calls).await
    }

    /// Decrements the in-flight paging gauge.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::QueryNotFound`].
    pub async fn decrement_active_next_calls(&self) -> Result<()> {
        self.update(QueryStatus::decrement_active_next_calls).await
    }

    /// Sets the highest page number handed out.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::QueryNotFound`].
    pub async fn set_last_page_number(&self, page: u64) -> Result<()> {
        self.update(move |status| status.last_page_number = page)
            .await
    }

    /// Stamps the last external/user interaction time.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::QueryNotFound`].
    pub async fn touch_used(&self) -> Result<()> {
        self.update(|status| status.touch_used(Utc::now())).await
    }

    /// Stamps the last internal/service write time without changing
    /// anything else.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::QueryNotFound`].
    pub async fn touch_updated(&self) -> Result<()> {
        self.update(|_| {}).await
    }

    async fn update(&self, mutate: impl FnOnce(&mut QueryStatus)) -> Result<()> {
        self.shared
            .refresh_with("write", |status| {
                mutate(status);
                status.touch_updated(Utc::now());
            })
            .await
    }
}

impl Drop for CachedQueryStatus {
    fn drop(&mut self) {
        self.stop();
    }
}
