//! Error types for the query-coordination domain.

use strata_core::QueryId;

use crate::key::TaskKey;

/// The result type used throughout strata-query.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in query-coordination operations.
///
/// Storage failures and not-found are deliberately distinct variants so
/// callers can tell "someone else deleted this" apart from "the store is
/// down". Admission rejection is never an error; it is a boolean result.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A query was not found.
    #[error("query not found: {query_id}")]
    QueryNotFound {
        /// The query id that was looked up.
        query_id: QueryId,
    },

    /// A task was not found.
    #[error("task not found: {task_key}")]
    TaskNotFound {
        /// The task key that was looked up.
        task_key: TaskKey,
    },

    /// A stored key could not be parsed back into its fields.
    #[error("malformed key '{key}': {reason}")]
    MalformedKey {
        /// The raw key text.
        key: String,
        /// What made it unparseable.
        reason: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from strata-core.
    #[error("core error: {0}")]
    Core(#[from] strata_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a malformed-key error.
    #[must_use]
    pub fn malformed_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error means the entity no longer exists.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        match self {
            Self::QueryNotFound { .. } | Self::TaskNotFound { .. } => true,
            Self::Core(core) => core.is_not_found(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::QueryKey;

    #[test]
    fn query_not_found_display() {
        let err = Error::QueryNotFound {
            query_id: QueryId::generate(),
        };
        assert!(err.to_string().contains("query not found"));
        assert!(err.is_not_found());
    }

    #[test]
    fn task_not_found_display() {
        let key = QueryKey::new("default", QueryId::generate(), "EventQuery").unwrap();
        let err = Error::TaskNotFound {
            task_key: key.task(7),
        };
        assert!(err.to_string().contains("task not found"));
        assert!(err.is_not_found());
    }

    #[test]
    fn storage_error_is_not_not_found() {
        assert!(!Error::storage("down").is_not_found());
    }

    #[test]
    fn core_not_found_maps_through() {
        let err = Error::from(strata_core::Error::NotFound("x".into()));
        assert!(err.is_not_found());
    }
}
