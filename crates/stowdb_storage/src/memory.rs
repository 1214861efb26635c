//! Volatile in-memory log store.

use crate::error::{StorageError, StorageResult};
use crate::store::LogStore;
use parking_lot::RwLock;
use std::sync::Arc;

/// A log store kept entirely in memory.
///
/// Clones share the same buffer, which lets a test hold on to the bytes an
/// environment wrote, drop the environment, and reopen a new one over the
/// same "disk".
///
/// ```rust
/// use stowdb_storage::{LogStore, MemoryStore};
///
/// let mut store = MemoryStore::new();
/// let disk = store.clone();
/// store.append(b"abc").unwrap();
/// assert_eq!(disk.size().unwrap(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store preloaded with `bytes`.
    #[must_use]
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Overwrites a single byte. Only meant for corruption tests.
    pub fn corrupt_byte(&self, offset: usize, value: u8) {
        let mut bytes = self.bytes.write();
        if let Some(b) = bytes.get_mut(offset) {
            *b = value;
        }
    }
}

impl LogStore for MemoryStore {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let bytes = self.bytes.read();
        let size = bytes.len() as u64;
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(bytes[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut bytes = self.bytes.write();
        let offset = bytes.len() as u64;
        bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut bytes = self.bytes.write();
        let size = bytes.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size,
            });
        }
        bytes.truncate(new_size as usize);
        Ok(())
    }
}
