//! Storage errors.

use cohort_common::LogIndex;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors raised by the log, snapshot store, and meta store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A file's contents did not match the expected layout.
    #[error("corrupted storage: {0}")]
    Corrupted(String),

    /// The requested range was removed by compaction.
    #[error("log compacted below index {first_index}")]
    Compacted {
        /// The first index still present in the log.
        first_index: LogIndex,
    },

    /// A truncation would have removed committed entries.
    #[error("cannot truncate to {index}: commit index is {commit_index}")]
    TruncateCommitted {
        /// The requested truncation index.
        index: LogIndex,
        /// The current commit index.
        commit_index: LogIndex,
    },

    /// An append targeted an index the log cannot accept.
    #[error("index {index} out of sequence: expected {expected}")]
    OutOfSequence {
        /// The offered index.
        index: LogIndex,
        /// The index the log expected.
        expected: LogIndex,
    },

    /// An offset or position exceeded the index's addressable bounds.
    #[error("offset index bound exceeded: {0}")]
    IndexBounds(String),

    /// A value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Codec(err.to_string())
    }
}
