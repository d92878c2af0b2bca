//! Canonical addressing for queries and tasks.
//!
//! `QueryKey` and `TaskKey` are the cross-process addressing scheme for
//! every stored entity. Their string forms are stable and round-trippable
//! so worker processes of different versions interoperate:
//!
//! - `QueryKey`: `{pool}:{query_id}:{logic}`
//! - `TaskKey`: `{pool}:{query_id}:{logic}.T-{task_id}`

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use strata_core::QueryId;

use crate::error::{Error, Result};

/// Characters that would break the canonical string form.
const RESERVED: [char; 2] = [':', '.'];

/// Identity of one logical query: the pool it runs in, its unique id, and
/// the name of the query logic executing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryKey {
    /// Execution pool the query is assigned to.
    pub pool: String,
    /// Unique query id.
    pub query_id: QueryId,
    /// Name of the query logic.
    pub logic: String,
}

impl QueryKey {
    /// Creates a new query key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedKey`] if `pool` or `logic` is empty or
    /// contains a reserved character (`:` or `.`).
    pub fn new(
        pool: impl Into<String>,
        query_id: QueryId,
        logic: impl Into<String>,
    ) -> Result<Self> {
        let pool = pool.into();
        let logic = logic.into();
        validate_segment(&pool, "pool")?;
        validate_segment(&logic, "logic")?;
        Ok(Self {
            pool,
            query_id,
            logic,
        })
    }

    /// Returns the canonical storage-key string: `pool:queryId:logic`.
    #[must_use]
    pub fn to_key(&self) -> String {
        format!("{}:{}:{}", self.pool, self.query_id, self.logic)
    }

    /// Builds the key of a task belonging to this query.
    #[must_use]
    pub fn task(&self, task_id: u32) -> TaskKey {
        TaskKey {
            query_key: self.clone(),
            task_id,
        }
    }

    /// Returns the prefix under which all of this query's task keys sort:
    /// `pool:queryId:logic.T-`.
    #[must_use]
    pub fn task_prefix(&self) -> String {
        format!("{}.T-", self.to_key())
    }
}

fn validate_segment(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::malformed_key(value, format!("{field} is empty")));
    }
    if value.contains(RESERVED) {
        return Err(Error::malformed_key(
            value,
            format!("{field} contains a reserved character"),
        ));
    }
    Ok(())
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

impl FromStr for QueryKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(pool), Some(id), Some(logic)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::malformed_key(s, "expected pool:queryId:logic"));
        };
        let query_id = id
            .parse::<QueryId>()
            .map_err(|e| Error::malformed_key(s, e.to_string()))?;
        Self::new(pool, query_id, logic)
    }
}

impl PartialOrd for QueryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pool
            .cmp(&other.pool)
            .then_with(|| self.query_id.cmp(&other.query_id))
            .then_with(|| self.logic.cmp(&other.logic))
    }
}

/// Identity of one task: its query plus a small per-query task id.
///
/// Task ids are allocated by the query's task-states record, not minted
/// globally; a `TaskKey` is purely an address and owns nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskKey {
    /// The query this task belongs to.
    pub query_key: QueryKey,
    /// Per-query task id.
    pub task_id: u32,
}

impl TaskKey {
    /// Returns the canonical storage-key string:
    /// `pool:queryId:logic.T-{taskId}`.
    #[must_use]
    pub fn to_key(&self) -> String {
        format!("{}.T-{}", self.query_key.to_key(), self.task_id)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

impl FromStr for TaskKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // Pool and logic cannot contain '.', so the rightmost ".T-" is
        // unambiguous.
        let Some((query_part, id_part)) = s.rsplit_once(".T-") else {
            return Err(Error::malformed_key(s, "missing .T-<taskId> suffix"));
        };
        let query_key = query_part.parse::<QueryKey>()?;
        let task_id = id_part
            .parse::<u32>()
            .map_err(|e| Error::malformed_key(s, format!("bad task id: {e}")))?;
        Ok(Self { query_key, task_id })
    }
}

impl PartialOrd for TaskKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.query_key
            .cmp(&other.query_key)
            .then_with(|| self.task_id.cmp(&other.task_id))
    }
}
