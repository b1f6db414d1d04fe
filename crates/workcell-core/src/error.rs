//! Error types and result aliases for workcell primitives.
//!
//! Errors are structured for programmatic handling: callers match on the
//! variant, the message carries context for operators.

use std::fmt;

/// The result type used throughout workcell-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
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

    /// The lock backend could not be reached.
    ///
    /// Distinct from "lock is held": a caller that sees this error does not
    /// know who holds the lock.
    #[error("lock backend unavailable: {message}")]
    LockBackendUnavailable {
        /// Description of the backend failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The requested resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A path or object was not found (simple variant for storage).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Wraps a backend failure observed while operating on a lock.
    #[must_use]
    pub fn lock_backend(message: impl Into<String>, source: Self) -> Self {
        Self::LockBackendUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Returns true if this error reports an unreachable lock backend.
    #[must_use]
    pub const fn is_lock_backend_unavailable(&self) -> bool {
        matches!(self, Self::LockBackendUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn lock_backend_error_keeps_source() {
        let err = Error::lock_backend("acquire pipette-1", Error::storage("connection refused"));
        assert!(err.is_lock_backend_unavailable());
        assert!(err.to_string().contains("lock backend unavailable"));
        let source = err.source().expect("source");
        assert!(source.to_string().contains("connection refused"));
    }

    #[test]
    fn resource_not_found_display() {
        let err = Error::resource_not_found("run", "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(
            err.to_string(),
            "not found: run with id 01ARZ3NDEKTSV4RRFFQ69G5FAV"
        );
    }
}
