//! Error types and result aliases for the reconciliation pipeline.
//!
//! Collaborator boundaries report "not found" as `Option`/`bool` results, so
//! every variant here is a real failure the caller must handle or propagate.

/// The result type used throughout the pipeline.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An object-store operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A work-queue operation failed.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the queue failure.
        message: String,
    },

    /// A lease-manager operation failed.
    #[error("lease error: {message}")]
    Lease {
        /// Description of the lease failure.
        message: String,
    },

    /// A table-store operation failed.
    #[error("table error: {message}")]
    Table {
        /// Description of the table failure.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An optimistic write lost to a concurrent writer.
    #[error("write contention: {message}")]
    Contention {
        /// Description of the contended write.
        message: String,
    },

    /// The operation was cancelled by shutdown.
    #[error("operation cancelled")]
    Cancelled,

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

    /// Creates a new queue error.
    #[must_use]
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Creates a new lease error.
    #[must_use]
    pub fn lease(message: impl Into<String>) -> Self {
        Self::Lease {
            message: message.into(),
        }
    }

    /// Creates a new table error.
    #[must_use]
    pub fn table(message: impl Into<String>) -> Self {
        Self::Table {
            message: message.into(),
        }
    }

    /// Creates a new contention error.
    #[must_use]
    pub fn contention(message: impl Into<String>) -> Self {
        Self::Contention {
            message: message.into(),
        }
    }

    /// Error returned when an in-memory lock was poisoned by a panicking holder.
    #[must_use]
    pub fn poisoned() -> Self {
        Self::Internal {
            message: "lock poisoned".into(),
        }
    }

    /// Returns true if retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. }
                | Self::Queue { .. }
                | Self::Lease { .. }
                | Self::Table { .. }
                | Self::Contention { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_keeps_source() {
        let io = std::io::Error::other("disk gone");
        let err = Error::storage_with_source("read failed", io);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "storage error: read failed");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::contention("row changed").is_transient());
        assert!(Error::queue("timeout").is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::InvalidInput("bad".into()).is_transient());
    }
}
