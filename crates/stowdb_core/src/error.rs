//! Error types for stowdb core.

use crate::types::{ResourceId, TransactionId};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Log store error.
    #[error("storage error: {0}")]
    Storage(#[from] stowdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The log holds a record that cannot be interpreted. Recovery stops
    /// without applying anything.
    #[error("log corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// A log record failed its checksum.
    #[error("checksum mismatch at offset {offset}: stored {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch {
        /// Store offset of the record.
        offset: u64,
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed over the record bytes.
        actual: u32,
    },

    /// A single lock wait expired. The transaction stays usable.
    #[error("{txid} timed out after {waited:?} waiting for lock on {resource}")]
    LockTimeout {
        /// Waiting transaction.
        txid: TransactionId,
        /// Resource that could not be locked.
        resource: ResourceId,
        /// Effective lock timeout that elapsed.
        waited: Duration,
    },

    /// The transaction outlived its transaction timeout and must abort.
    #[error("{txid} exceeded its transaction timeout of {limit:?}")]
    TransactionTimeout {
        /// Transaction that timed out.
        txid: TransactionId,
        /// Transaction timeout that elapsed.
        limit: Duration,
    },

    /// The transaction was chosen as the victim of a wait-for cycle and
    /// must abort.
    #[error("{txid} chosen as deadlock victim in cycle {cycle:?}")]
    Deadlock {
        /// Victim transaction.
        txid: TransactionId,
        /// Transactions forming the cycle.
        cycle: Vec<TransactionId>,
    },

    /// A size wait was abandoned.
    #[error("wait abandoned: {cause}")]
    WaitAbandoned {
        /// Cause handed to `abandon`.
        cause: String,
    },

    /// A blocking call was cancelled through its cancel token.
    #[error("blocking call interrupted")]
    Interrupted,

    /// A tunable was rejected before it could take effect.
    #[error("invalid configuration for {param}: {message}")]
    InvalidConfiguration {
        /// Parameter name.
        param: String,
        /// Why the value was rejected.
        message: String,
    },

    /// The transaction was marked for mandatory abort by an earlier
    /// failure; only `abort` is allowed.
    #[error("{txid} must be aborted: {reason}")]
    TransactionMustAbort {
        /// Transaction id.
        txid: TransactionId,
        /// Failure that forced the abort.
        reason: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            param: param.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a wait abandoned error.
    pub fn wait_abandoned(cause: impl Into<String>) -> Self {
        Self::WaitAbandoned {
            cause: cause.into(),
        }
    }

    /// Whether the log could not be interpreted.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::ChecksumMismatch { .. })
    }

    /// Whether the error forces the owning transaction to abort.
    #[must_use]
    pub fn is_fatal_to_transaction(&self) -> bool {
        matches!(
            self,
            Self::TransactionTimeout { .. }
                | Self::Deadlock { .. }
                | Self::TransactionMustAbort { .. }
        )
    }
}
