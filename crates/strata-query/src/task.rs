//! Dispatchable work units and their resumable checkpoints.

use serde::{Deserialize, Serialize};

use crate::key::{QueryKey, TaskKey};

/// The request kind a task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    /// Register the query definition.
    Define,
    /// Start query execution.
    Create,
    /// Produce a one-shot plan.
    Plan,
    /// Produce a one-shot prediction.
    Predict,
    /// Produce the next page of results.
    Next,
    /// Tear execution down.
    Close,
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Define => "define",
            Self::Create => "create",
            Self::Plan => "plan",
            Self::Predict => "predict",
            Self::Next => "next",
            Self::Close => "close",
        };
        f.write_str(label)
    }
}

/// Resumable-work payload carried by a task.
///
/// The payload is opaque to this core; workers read and advance it. It
/// carries its own query key so a checkpoint alone is enough to resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// The query this work belongs to.
    pub query_key: QueryKey,
    /// Opaque progress payload.
    pub payload: serde_json::Value,
}

impl Checkpoint {
    /// Creates a new checkpoint.
    #[must_use]
    pub fn new(query_key: QueryKey, payload: serde_json::Value) -> Self {
        Self { query_key, payload }
    }

    /// Creates an empty checkpoint for a freshly created task.
    #[must_use]
    pub fn empty(query_key: QueryKey) -> Self {
        Self {
            query_key,
            payload: serde_json::Value::Null,
        }
    }
}

/// One unit of dispatchable work belonging to a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTask {
    /// Per-query task id.
    pub task_id: u32,
    /// The request kind this task executes.
    pub action: TaskAction,
    /// Resumable progress payload.
    pub checkpoint: Checkpoint,
}

impl QueryTask {
    /// Creates a new task.
    #[must_use]
    pub const fn new(task_id: u32, action: TaskAction, checkpoint: Checkpoint) -> Self {
        Self {
            task_id,
            action,
            checkpoint,
        }
    }

    /// Returns this task's canonical key.
    #[must_use]
    pub fn to_key(&self) -> TaskKey {
        self.checkpoint.query_key.task(self.task_id)
    }

    /// Returns a copy with the checkpoint replaced.
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = checkpoint;
        self
    }
}
