//! Observability metrics for query coordination.
//!
//! Exposed through the `metrics` crate facade; install any compatible
//! recorder (e.g. a Prometheus exporter) at process startup.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `strata_query_lifecycle_transitions_total` | Counter | `from`, `to` | Query lifecycle changes |
//! | `strata_query_task_admissions_total` | Counter | `result` | RUNNING admissions granted/rejected |
//! | `strata_query_cache_refreshes_total` | Counter | `trigger` | Cached-status refreshes by trigger |
//! | `strata_query_counter_flush_total` | Counter | `counter` | Coalesced counter deltas flushed |
//! | `strata_query_lock_acquisitions_total` | Counter | `entity`, `result` | Lock acquisition outcomes |

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: query lifecycle transitions.
    pub const LIFECYCLE_TRANSITIONS_TOTAL: &str = "strata_query_lifecycle_transitions_total";
    /// Counter: RUNNING admissions granted and rejected.
    pub const TASK_ADMISSIONS_TOTAL: &str = "strata_query_task_admissions_total";
    /// Counter: cached-status refreshes by trigger.
    pub const CACHE_REFRESHES_TOTAL: &str = "strata_query_cache_refreshes_total";
    /// Counter: coalesced counter increments flushed to the store.
    pub const COUNTER_FLUSH_TOTAL: &str = "strata_query_counter_flush_total";
    /// Counter: lock acquisition outcomes.
    pub const LOCK_ACQUISITIONS_TOTAL: &str = "strata_query_lock_acquisitions_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous lifecycle state.
    pub const FROM: &str = "from";
    /// Target lifecycle state.
    pub const TO: &str = "to";
    /// Outcome (admitted/rejected, acquired/timeout).
    pub const RESULT: &str = "result";
    /// Refresh trigger (`lazy`, `timer`, `write`).
    pub const TRIGGER: &str = "trigger";
    /// Which coalesced counter was flushed.
    pub const COUNTER: &str = "counter";
    /// Entity kind a lock guards (`query-status`, `task-states`).
    pub const ENTITY: &str = "entity";
}

/// Recording handle for query-coordination metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryMetrics;

impl QueryMetrics {
    /// Creates a new metrics handle.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a query lifecycle transition.
    pub fn record_lifecycle_transition(self, from: &'static str, to: &'static str) {
        counter!(
            names::LIFECYCLE_TRANSITIONS_TOTAL,
            labels::FROM => from,
            labels::TO => to,
        )
        .increment(1);
    }

    /// Records a RUNNING admission decision.
    pub fn record_admission(self, admitted: bool) {
        let result = if admitted { "admitted" } else { "rejected" };
        counter!(names::TASK_ADMISSIONS_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records a cached-status refresh.
    pub fn record_cache_refresh(self, trigger: &'static str) {
        counter!(names::CACHE_REFRESHES_TOTAL, labels::TRIGGER => trigger).increment(1);
    }

    /// Records flushed counter delta magnitude.
    pub fn record_counter_flush(self, counter_name: &'static str, delta: u64) {
        if delta > 0 {
            counter!(names::COUNTER_FLUSH_TOTAL, labels::COUNTER => counter_name)
                .increment(delta);
        }
    }

    /// Records a lock acquisition outcome.
    pub fn record_lock_acquisition(self, entity: &'static str, acquired: bool) {
        let result = if acquired { "acquired" } else { "timeout" };
        counter!(
            names::LOCK_ACQUISITIONS_TOTAL,
            labels::ENTITY => entity,
            labels::RESULT => result,
        )
        .increment(1);
    }
}
