//! Per-query task scheduling state with admission control.
//!
//! `TaskStates` partitions a query's task ids into lifecycle buckets and
//! enforces exactly one capacity invariant: the RUNNING bucket never
//! exceeds `max_running`. That check is the admission-control gate bounding
//! concurrent executors per query; every other invariant in the system is
//! advisory.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::key::QueryKey;

/// Task lifecycle buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskLifecycle {
    /// Eligible for dispatch.
    Ready,
    /// Currently held by an executor.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskLifecycle {
    /// Returns true for states that still have work pending.
    #[must_use]
    pub const fn is_unfinished(&self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// The authoritative per-query task-scheduling record.
///
/// Mutated only under the query's task-states lock; the task-id counter is
/// held here so allocation serializes with every other scheduling change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStates {
    /// The query these tasks belong to.
    pub query_key: QueryKey,
    /// Concurrency ceiling for the RUNNING bucket.
    pub max_running: usize,
    /// Next task id to hand out.
    #[serde(default)]
    pub next_task_id: u32,

    #[serde(default)]
    ready: BTreeSet<u32>,
    #[serde(default)]
    running: BTreeSet<u32>,
    #[serde(default)]
    completed: BTreeSet<u32>,
    #[serde(default)]
    failed: BTreeSet<u32>,
}

impl TaskStates {
    /// Creates a new record with the given concurrency ceiling.
    #[must_use]
    pub fn new(query_key: QueryKey, max_running: usize) -> Self {
        Self {
            query_key,
            max_running,
            next_task_id: 0,
            ready: BTreeSet::new(),
            running: BTreeSet::new(),
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
        }
    }

    /// Hands out the next task id.
    ///
    /// Callers must hold the task-states lock: the increment is only
    /// atomic because every allocator serializes on it.
    pub fn allocate_task_id(&mut self) -> u32 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    /// Moves a task into `target`, or drops it entirely when `target` is
    /// `None`.
    ///
    /// Returns true on success, including the idempotent case where the
    /// task is already in `target`. Returns false — mutating nothing —
    /// when `target` is `Running` and the RUNNING bucket is full: that is
    /// the admission-control signal, not an error.
    pub fn set_state(&mut self, task_id: u32, target: Option<TaskLifecycle>) -> bool {
        let current = self.state_of(task_id);

        if current == target {
            return true;
        }

        if target == Some(TaskLifecycle::Running) && self.running.len() >= self.max_running {
            return false;
        }

        if let Some(state) = current {
            self.bucket_mut(state).remove(&task_id);
        }
        if let Some(state) = target {
            self.bucket_mut(state).insert(task_id);
        }
        true
    }

    /// Returns the bucket a task currently belongs to, if any.
    #[must_use]
    pub fn state_of(&self, task_id: u32) -> Option<TaskLifecycle> {
        [
            TaskLifecycle::Ready,
            TaskLifecycle::Running,
            TaskLifecycle::Completed,
            TaskLifecycle::Failed,
        ]
        .into_iter()
        .find(|state| self.bucket(*state).contains(&task_id))
    }

    /// Returns the task ids in a bucket, in ascending order.
    #[must_use]
    pub fn tasks_in(&self, state: TaskLifecycle) -> Vec<u32> {
        self.bucket(state).iter().copied().collect()
    }

    /// Returns the number of tasks currently running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Returns true while any task is ready or running.
    #[must_use]
    pub fn has_unfinished_tasks(&self) -> bool {
        !self.ready.is_empty() || !self.running.is_empty()
    }

    /// Returns the total number of tracked tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.ready.len() + self.running.len() + self.completed.len() + self.failed.len()
    }

    const fn bucket(&self, state: TaskLifecycle) -> &BTreeSet<u32> {
        match state {
            TaskLifecycle::Ready => &self.ready,
            TaskLifecycle::Running => &self.running,
            TaskLifecycle::Completed => &self.completed,
            TaskLifecycle::Failed => &self.failed,
        }
    }

    fn bucket_mut(&mut self, state: TaskLifecycle) -> &mut BTreeSet<u32> {
        match state {
            TaskLifecycle::Ready => &mut self.ready,
            TaskLifecycle::Running => &mut self.running,
            TaskLifecycle::Completed => &mut self.completed,
            TaskLifecycle::Failed => &mut self.failed,
        }
    }
}
