//! The log store trait.

use crate::error::StorageResult;

/// An append-only byte store holding the log.
///
/// # Invariants
///
/// - `append` returns the offset at which the bytes start, and offsets grow
///   by exactly the appended length
/// - bytes are never rewritten in place; the only way to remove data is
///   [`LogStore::truncate`], which cuts the tail off
/// - once `sync` returns, every previously appended byte survives a crash
///
/// Implementations must be `Send + Sync` so a store can sit behind the log
/// manager's mutex and be shared across threads.
pub trait LogStore: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range is not
    /// fully inside the store.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset where it starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails. A failed append may leave a
    /// prefix of `data` behind, which readers see as a torn tail.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes towards the medium.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Makes all appended data durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Current length of the store in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the length cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Cuts the store back to `new_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::TruncateBeyondEnd`] if `new_size` is
    /// larger than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
