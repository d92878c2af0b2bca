//! Backing-store key layout.
//!
//! One namespace per logical cache, so each store can be listed and wiped
//! independently. Task records key by the full canonical task key, which
//! makes one query's tasks a contiguous prefix range.

use strata_core::QueryId;

use crate::key::{QueryKey, TaskKey};

/// Namespace prefix for query status records.
pub const QUERY_STATUS_PREFIX: &str = "query-status/";

/// Namespace prefix for task-states records.
pub const TASK_STATES_PREFIX: &str = "task-states/";

/// Namespace prefix for task records.
pub const TASKS_PREFIX: &str = "tasks/";

/// Returns the storage key for a query's status record.
#[must_use]
pub fn query_status(query_id: QueryId) -> String {
    format!("{QUERY_STATUS_PREFIX}{query_id}.json")
}

/// Returns the storage key for a query's task-states record.
#[must_use]
pub fn task_states(query_id: QueryId) -> String {
    format!("{TASK_STATES_PREFIX}{query_id}.json")
}

/// Returns the storage key for a task record.
#[must_use]
pub fn task(key: &TaskKey) -> String {
    format!("{TASKS_PREFIX}{}.json", key.to_key())
}

/// Returns the listing prefix covering one query's task records.
#[must_use]
pub fn tasks_for_query(key: &QueryKey) -> String {
    format!("{TASKS_PREFIX}{}", key.task_prefix())
}

/// Returns the lock key guarding a query's status record.
#[must_use]
pub fn query_status_lock(query_id: QueryId) -> String {
    format!("locks/query-status/{query_id}.json")
}

/// Returns the lock key guarding a query's task-states record.
#[must_use]
pub fn task_states_lock(query_id: QueryId) -> String {
    format!("locks/task-states/{query_id}.json")
}

/// Returns the lock key guarding one task record.
#[must_use]
pub fn task_lock(key: &TaskKey) -> String {
    format!("locks/tasks/{}.json", key.to_key())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_paths_share_the_query_prefix() {
        let id = QueryId::generate();
        let key = QueryKey::new("default", id, "EventQuery").unwrap();
        let prefix = tasks_for_query(&key);

        assert!(task(&key.task(0)).starts_with(&prefix));
        assert!(task(&key.task(41)).starts_with(&prefix));
    }

    #[test]
    fn namespaces_are_disjoint() {
        let id = QueryId::generate();
        assert!(query_status(id).starts_with(QUERY_STATUS_PREFIX));
        assert!(task_states(id).starts_with(TASK_STATES_PREFIX));
        assert!(query_status_lock(id).starts_with("locks/"));
        assert_ne!(query_status(id), task_states(id));
        assert_ne!(query_status_lock(id), task_states_lock(id));
    }
}
