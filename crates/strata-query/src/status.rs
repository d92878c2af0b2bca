//! The per-query status entity and its lifecycle.
//!
//! `QueryStatus` is the authoritative record for one query, owned by the
//! backing store and mutated only under the query's status lock. There is
//! deliberately no enforced transition table: any lock holder may set any
//! lifecycle state, and correctness rests on single-writer discipline plus
//! callers following the documented request flow (define → create →
//! plan/predict as applicable → closed/canceled/failed).

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::QueryKey;

/// Query lifecycle states.
///
/// The four request states (`Define`, `Create`, `Plan`, `Predict`) are
/// transient: they mark that a transition has been requested but not yet
/// settled by a worker. Requesting the same terminal transition twice is a
/// no-op, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryLifecycle {
    /// Define requested, not yet registered.
    Define,
    /// Registered, not yet scheduled for creation.
    Defined,
    /// Create requested.
    Create,
    /// Actively running.
    Created,
    /// Plan requested.
    Plan,
    /// One-shot plan completed, no further tasks.
    Planned,
    /// Prediction requested.
    Predict,
    /// One-shot prediction completed, no further tasks.
    Predicted,
    /// Execution finished; a paging call may still be in flight.
    Closed,
    /// Canceled by the user or an operator.
    Canceled,
    /// Failed; detail is recorded alongside the state.
    Failed,
}

impl QueryLifecycle {
    /// Returns true for the transient request states.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        matches!(self, Self::Define | Self::Create | Self::Plan | Self::Predict)
    }

    /// Maps a request state to the state it settles into; settled states
    /// map to themselves.
    #[must_use]
    pub const fn settled(&self) -> Self {
        match self {
            Self::Define => Self::Defined,
            Self::Create => Self::Created,
            Self::Plan => Self::Planned,
            Self::Predict => Self::Predicted,
            other => *other,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Define => "define",
            Self::Defined => "defined",
            Self::Create => "create",
            Self::Created => "created",
            Self::Plan => "plan",
            Self::Planned => "planned",
            Self::Predict => "predict",
            Self::Predicted => "predicted",
            Self::Closed => "closed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueryLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Failure detail recorded atomically with the `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFailure {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Captured stack text from the reporting worker.
    pub stack: String,
}

impl QueryFailure {
    /// Creates a new failure detail.
    #[must_use]
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        stack: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            stack: stack.into(),
        }
    }
}

/// The authoritative per-query record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStatus {
    /// Query identity.
    pub key: QueryKey,
    /// Current lifecycle state.
    pub lifecycle: QueryLifecycle,
    /// Opaque query definition payload.
    pub definition: serde_json::Value,
    /// Plan text, once planning has produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    /// Authorizations computed for this query.
    #[serde(default)]
    pub computed_auths: BTreeSet<String>,

    /// Results returned to the caller so far.
    #[serde(default)]
    pub num_results_returned: u64,
    /// Results generated by workers so far.
    #[serde(default)]
    pub num_results_generated: u64,
    /// Paging (`next`) calls issued against this query.
    #[serde(default)]
    pub next_count: u64,
    /// Seeks issued while executing this query.
    #[serde(default)]
    pub seek_count: u64,
    /// Highest result page number handed out.
    #[serde(default)]
    pub last_page_number: u64,
    /// Paging calls currently in flight (live gauge, not monotonic).
    #[serde(default)]
    pub active_next_calls: u64,

    /// Last external/user interaction.
    pub last_used_at: DateTime<Utc>,
    /// Last internal/service write.
    pub last_updated_at: DateTime<Utc>,

    /// Failure detail, present iff a failure has been recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<QueryFailure>,
}

impl QueryStatus {
    /// Creates a new status record in the `Define` request state.
    #[must_use]
    pub fn new(key: QueryKey, definition: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            key,
            lifecycle: QueryLifecycle::Define,
            definition,
            plan: None,
            computed_auths: BTreeSet::new(),
            num_results_returned: 0,
            num_results_generated: 0,
            next_count: 0,
            seek_count: 0,
            last_page_number: 0,
            active_next_calls: 0,
            last_used_at: now,
            last_updated_at: now,
            failure: None,
        }
    }

    /// Sets the initial lifecycle state.
    #[must_use]
    pub const fn with_lifecycle(mut self, lifecycle: QueryLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Sets the computed authorizations.
    #[must_use]
    pub fn with_auths(mut self, auths: BTreeSet<String>) -> Self {
        self.computed_auths = auths;
        self
    }

    /// Returns true while the query is actively running.
    ///
    /// A query still counts as running after close while paging calls are
    /// draining.
    #[must_use]
    pub fn is_running(&self) -> bool {
        match self.lifecycle {
            QueryLifecycle::Created => true,
            QueryLifecycle::Closed => self.active_next_calls > 0,
            _ => false,
        }
    }

    /// Returns true if a paging call is in flight but the service has not
    /// written progress for at least `idle`.
    #[must_use]
    pub fn is_progress_idle(&self, now: DateTime<Utc>, idle: Duration) -> bool {
        self.active_next_calls > 0 && elapsed_at_least(self.last_updated_at, now, idle)
    }

    /// Returns true if no paging call is in flight and the user has not
    /// interacted for at least `idle`.
    #[must_use]
    pub fn is_user_idle(&self, now: DateTime<Utc>, idle: Duration) -> bool {
        self.active_next_calls == 0 && elapsed_at_least(self.last_used_at, now, idle)
    }

    /// Returns true if neither users nor the service have touched this
    /// query for at least `ttl`.
    #[must_use]
    pub fn is_inactive(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let oldest = self.last_used_at.min(self.last_updated_at);
        elapsed_at_least(oldest, now, ttl)
    }

    /// Sets the lifecycle state.
    ///
    /// Permissive by design: any state may follow any other. Returns false
    /// when the state was already `target` (idempotent no-op).
    pub fn set_lifecycle(&mut self, target: QueryLifecycle) -> bool {
        if self.lifecycle == target {
            return false;
        }
        tracing::debug!(key = %self.key, from = %self.lifecycle, to = %target, "query lifecycle change");
        self.lifecycle = target;
        true
    }

    /// Records a failure: sets the `Failed` state and the failure detail
    /// together so no observer can see one without the other.
    pub fn record_failure(&mut self, failure: QueryFailure) {
        self.lifecycle = QueryLifecycle::Failed;
        self.failure = Some(failure);
    }

    /// Stamps the last external/user interaction time.
    pub fn touch_used(&mut self, now: DateTime<Utc>) {
        self.last_used_at = now;
    }

    /// Stamps the last internal/service write time.
    pub fn touch_updated(&mut self, now: DateTime<Utc>) {
        self.last_updated_at = now;
    }

    /// Increments the in-flight paging gauge.
    pub fn increment_active_next_calls(&mut self) {
        self.active_next_calls = self.active_next_calls.saturating_add(1);
    }

    /// Decrements the in-flight paging gauge, saturating at zero.
    pub fn decrement_active_next_calls(&mut self) {
        self.active_next_calls = self.active_next_calls.saturating_sub(1);
    }
}

fn elapsed_at_least(since: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    let elapsed = now.signed_duration_since(since);
    elapsed >= chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::QueryId;

    fn status() -> QueryStatus {
        let key = QueryKey::new("default", QueryId::generate(), "EventQuery").unwrap();
        QueryStatus::new(key, serde_json::json!({"query": "a == b"}), Utc::now())
    }

    #[test]
    fn request_states_settle() {
        assert_eq!(QueryLifecycle::Define.settled(), QueryLifecycle::Defined);
        assert_eq!(QueryLifecycle::Create.settled(), QueryLifecycle::Created);
        assert_eq!(QueryLifecycle::Plan.settled(), QueryLifecycle::Planned);
        assert_eq!(QueryLifecycle::Predict.settled(), QueryLifecycle::Predicted);
        assert_eq!(QueryLifecycle::Closed.settled(), QueryLifecycle::Closed);
        assert!(QueryLifecycle::Create.is_request());
        assert!(!QueryLifecycle::Created.is_request());
    }

    #[test]
    fn is_running_created() {
        let mut s = status();
        s.set_lifecycle(QueryLifecycle::Created);
        assert!(s.is_running());
    }

    #[test]
    fn is_running_closed_depends_on_active_next_calls() {
        let mut s = status();
        s.set_lifecycle(QueryLifecycle::Closed);
        assert!(!s.is_running());

        s.increment_active_next_calls();
        s.increment_active_next_calls();
        assert!(s.is_running());

        s.decrement_active_next_calls();
        s.decrement_active_next_calls();
        assert!(!s.is_running());
    }

    #[test]
    fn progress_idle_thresholds() {
        let now = Utc::now();
        let mut s = status();
        s.increment_active_next_calls();
        s.touch_updated(now - chrono::Duration::seconds(5));

        assert!(s.is_progress_idle(now, Duration::from_secs(3)));
        assert!(!s.is_progress_idle(now, Duration::from_secs(10)));
    }

    #[test]
    fn progress_idle_requires_active_call() {
        let now = Utc::now();
        let mut s = status();
        s.touch_updated(now - chrono::Duration::seconds(500));
        assert!(!s.is_progress_idle(now, Duration::from_secs(3)));
    }

    #[test]
    fn user_idle_requires_no_active_calls() {
        let now = Utc::now();
        let mut s = status();
        s.touch_used(now - chrono::Duration::seconds(60));
        assert!(s.is_user_idle(now, Duration::from_secs(30)));

        s.increment_active_next_calls();
        assert!(!s.is_user_idle(now, Duration::from_secs(30)));
    }

    #[test]
    fn inactive_uses_oldest_timestamp() {
        let now = Utc::now();
        let mut s = status();
        s.touch_used(now - chrono::Duration::seconds(100));
        s.touch_updated(now - chrono::Duration::seconds(10));

        // min(used, updated) is 100s old, so a 50s ttl trips ...
        assert!(s.is_inactive(now, Duration::from_secs(50)));
        // ... and a 200s ttl does not.
        assert!(!s.is_inactive(now, Duration::from_secs(200)));
    }

    #[test]
    fn set_lifecycle_is_idempotent() {
        let mut s = status();
        assert!(s.set_lifecycle(QueryLifecycle::Created));
        assert!(!s.set_lifecycle(QueryLifecycle::Created));
    }

    #[test]
    fn record_failure_sets_state_and_detail_together() {
        let mut s = status();
        s.record_failure(QueryFailure::new("QUERY-500", "boom", "at worker.rs:42"));
        assert_eq!(s.lifecycle, QueryLifecycle::Failed);
        let failure = s.failure.expect("failure detail");
        assert_eq!(failure.code, "QUERY-500");
        assert_eq!(failure.message, "boom");
    }

    #[test]
    fn gauge_saturates_at_zero() {
        let mut s = status();
        s.decrement_active_next_calls();
        assert_eq!(s.active_next_calls, 0);
    }

    #[test]
    fn serde_roundtrip() {
        let s = status();
        let json = serde_json::to_string(&s).unwrap();
        let back: QueryStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, s.key);
        assert_eq!(back.lifecycle, s.lifecycle);
    }
}
