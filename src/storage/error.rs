//! Storage error type.

use thiserror::Error;

/// Errors raised by the queue store and the queue directory.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The queue name is not usable as a directory name
    #[error("invalid queue name '{0}'")]
    InvalidName(String),

    /// `delete` of a queue the directory does not know
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    /// `delete` of a queue with open items or in-flight pushes
    #[error("queue '{0}' is busy")]
    QueueBusy(String),

    /// Operation on a queue that was deleted while it was referenced
    #[error("queue '{0}' was deleted")]
    QueueDeleted(String),

    /// An item file ended before its recorded size
    #[error("item {id} truncated: expected {expected} bytes")]
    Truncated { id: u64, expected: u64 },

    /// A push was committed with a different number of bytes than declared
    #[error("item size mismatch: declared {declared}, written {written}")]
    SizeMismatch { declared: u64, written: u64 },
}

impl StorageError {
    /// Returns true if the error was caused by the client's request rather
    /// than by the store, in which case the connection can stay open.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StorageError::InvalidName(_)
                | StorageError::UnknownQueue(_)
                | StorageError::QueueBusy(_)
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
