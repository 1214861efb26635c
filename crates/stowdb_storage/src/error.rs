//! Errors raised by log stores.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while reading or writing a log store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error from the underlying medium.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read asked for bytes beyond the end of the store.
    #[error("read past end of store: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Store size at the time of the read.
        size: u64,
    },

    /// A truncation asked to grow the store.
    #[error("cannot truncate store of {size} bytes to {requested} bytes")]
    TruncateBeyondEnd {
        /// Requested new length.
        requested: u64,
        /// Current length.
        size: u64,
    },
}
