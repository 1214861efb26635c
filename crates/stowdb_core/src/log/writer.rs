//! Log manager: appends records and reads them back.

use crate::error::{CoreError, CoreResult};
use crate::log::iterator::LogIterator;
use crate::log::record::{LogEntry, LogRecord};
use crate::types::Lsn;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use stowdb_storage::LogStore;

/// Manages appends to and reads from the log.
///
/// LSNs are allocated under the store lock, so the order of records in the
/// store always matches their LSN order.
pub struct LogManager {
    store: Mutex<Box<dyn LogStore>>,
    next_lsn: AtomicU64,
    poisoned: AtomicBool,
}

impl LogManager {
    /// Opens a log over `store`.
    ///
    /// Scans the existing records to resume LSN allocation. A torn record
    /// at the end is cut off so later appends start on a clean boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the existing log is corrupt or the store fails.
    pub fn open(store: Box<dyn LogStore>) -> CoreResult<Self> {
        let manager = Self {
            store: Mutex::new(store),
            next_lsn: AtomicU64::new(1),
            poisoned: AtomicBool::new(false),
        };

        {
            let mut iter = manager.iter()?;
            for result in iter.by_ref() {
                result?;
            }
            let last_lsn = iter.last_lsn();
            let torn_at = iter.hit_torn_tail().then(|| iter.valid_end());
            let mut store = iter.into_store();
            if let Some(valid_end) = torn_at {
                tracing::warn!(valid_end, "cutting torn record from end of log");
                store.truncate(valid_end)?;
            }
            manager
                .next_lsn
                .store(last_lsn.as_u64() + 1, Ordering::SeqCst);
        }
        Ok(manager)
    }

    /// Appends an entry and returns the LSN assigned to it.
    ///
    /// The record reaches the store's write path but is not flushed; call
    /// [`sync`](Self::sync) for durability. A failed write is cut back off
    /// the store so no partial record is left ahead of later appends. If
    /// that cut fails too, the manager refuses every further append.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or written, or if
    /// an earlier failed write could not be rolled back.
    pub fn append(&self, entry: &LogEntry) -> CoreResult<Lsn> {
        let mut store = self.store.lock();
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(CoreError::invalid_operation(
                "log holds a partial record that could not be removed; reopen to recover",
            ));
        }
        let lsn = Lsn::new(self.next_lsn.load(Ordering::SeqCst));
        let frame = LogRecord::new(lsn, entry.clone()).encode()?;
        let prior = store.size()?;
        if let Err(err) = store.append(&frame) {
            if let Err(rollback) = store.truncate(prior) {
                self.poisoned.store(true, Ordering::SeqCst);
                tracing::error!(%lsn, prior, error = %rollback, "could not remove partial record");
            } else {
                tracing::warn!(%lsn, prior, error = %err, "append failed, partial record removed");
            }
            return Err(err.into());
        }
        self.next_lsn.store(lsn.as_u64() + 1, Ordering::SeqCst);
        Ok(lsn)
    }

    /// Hands buffered bytes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.store.lock().flush()?;
        Ok(())
    }

    /// Makes every appended record durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn sync(&self) -> CoreResult<()> {
        self.store.lock().sync()?;
        Ok(())
    }

    /// Returns a streaming iterator over all records.
    ///
    /// The iterator holds the store lock; appends block until it is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store size cannot be read.
    pub fn iter(&self) -> CoreResult<LogIterator<'_>> {
        LogIterator::new(self.store.lock())
    }

    /// Reads every record with LSN at most `target`, or all records when
    /// `target` is `None`.
    ///
    /// # Errors
    ///
    /// Returns the first corruption or store error met.
    pub fn read_up_to(&self, target: Option<Lsn>) -> CoreResult<Vec<LogRecord>> {
        let mut records = Vec::new();
        for result in self.iter()? {
            let (_, record) = result?;
            if target.is_some_and(|t| record.lsn > t) {
                break;
            }
            records.push(record);
        }
        Ok(records)
    }

    /// LSN of the newest record, or [`Lsn::ZERO`] for an empty log.
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        Lsn::new(self.next_lsn.load(Ordering::SeqCst) - 1)
    }

    /// LSN the next append will receive.
    #[must_use]
    pub fn next_lsn(&self) -> Lsn {
        Lsn::new(self.next_lsn.load(Ordering::SeqCst))
    }

    /// Current store size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.store.lock().size()?)
    }

    /// Discards every record with LSN greater than `lsn`.
    ///
    /// LSN allocation resumes right after the newest kept record.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupt before the cut point or the
    /// store cannot be truncated.
    pub fn truncate_after(&self, lsn: Lsn) -> CoreResult<()> {
        let mut iter = self.iter()?;
        let mut cut = None;
        let mut kept = Lsn::ZERO;
        for result in iter.by_ref() {
            let (offset, record) = result?;
            if record.lsn > lsn {
                cut = Some(offset);
                break;
            }
            kept = record.lsn;
        }
        let mut store = iter.into_store();
        if let Some(offset) = cut {
            store.truncate(offset)?;
        }
        self.next_lsn.store(kept.as_u64() + 1, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("next_lsn", &self.next_lsn())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;
    use stowdb_storage::MemoryStore;

    fn t(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    #[test]
    fn lsns_start_at_one_and_increase() {
        let log = LogManager::open(Box::new(MemoryStore::new())).unwrap();
        assert_eq!(log.last_lsn(), Lsn::ZERO);
        assert_eq!(log.append(&LogEntry::put("a", "1")).unwrap(), Lsn::new(1));
        assert_eq!(log.append(&LogEntry::put("b", "2")).unwrap(), Lsn::new(2));
        assert_eq!(log.last_lsn(), Lsn::new(2));
    }

    #[test]
    fn reopen_resumes_lsn_allocation() {
        let mem = MemoryStore::new();
        {
            let log = LogManager::open(Box::new(mem.clone())).unwrap();
            log.append(&LogEntry::txn_put(t(1), "k", "v")).unwrap();
            log.append(&LogEntry::commit(t(1))).unwrap();
            log.sync().unwrap();
        }
        let log = LogManager::open(Box::new(mem)).unwrap();
        assert_eq!(log.next_lsn(), Lsn::new(3));
        assert_eq!(log.append(&LogEntry::abort(t(2))).unwrap(), Lsn::new(3));
        assert_eq!(log.read_up_to(None).unwrap().len(), 3);
    }

    #[test]
    fn open_cuts_torn_tail() {
        let mem = MemoryStore::new();
        {
            let log = LogManager::open(Box::new(mem.clone())).unwrap();
            log.append(&LogEntry::put("a", "1")).unwrap();
        }
        let intact = mem.snapshot().len();
        let mut torn = mem.snapshot();
        torn.extend_from_slice(&LogRecord::new(Lsn::new(2), LogEntry::put("b", "2"))
            .encode()
            .unwrap()[..10]);
        let torn_store = MemoryStore::with_bytes(torn);

        let log = LogManager::open(Box::new(torn_store.clone())).unwrap();
        assert_eq!(torn_store.snapshot().len(), intact);
        assert_eq!(log.append(&LogEntry::put("c", "3")).unwrap(), Lsn::new(2));
        let lsns: Vec<_> = log.read_up_to(None).unwrap().iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, vec![Lsn::new(1), Lsn::new(2)]);
    }

    #[test]
    fn open_rejects_corrupt_log() {
        let mem = MemoryStore::new();
        {
            let log = LogManager::open(Box::new(mem.clone())).unwrap();
            log.append(&LogEntry::put("a", "1")).unwrap();
        }
        mem.corrupt_byte(0, b'X');
        assert!(LogManager::open(Box::new(mem)).unwrap_err().is_corruption());
    }

    #[test]
    fn damaged_length_mid_log_is_corruption_not_a_torn_tail() {
        let mem = MemoryStore::new();
        {
            let log = LogManager::open(Box::new(mem.clone())).unwrap();
            log.append(&LogEntry::put("a", "1")).unwrap();
            log.append(&LogEntry::put("b", "2")).unwrap();
            log.append(&LogEntry::put("c", "3")).unwrap();
        }
        let before = mem.snapshot();
        // High byte of the first record's payload length.
        mem.corrupt_byte(18, 0x7F);

        let err = LogManager::open(Box::new(mem.clone())).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(mem.snapshot().len(), before.len());
    }

    /// Writes half of each append and then fails; truncation can be made to
    /// fail as well.
    struct HalfWriteStore {
        inner: MemoryStore,
        fail_appends: bool,
        fail_truncate: bool,
    }

    impl LogStore for HalfWriteStore {
        fn read_at(&self, offset: u64, len: usize) -> stowdb_storage::StorageResult<Vec<u8>> {
            self.inner.read_at(offset, len)
        }

        fn append(&mut self, data: &[u8]) -> stowdb_storage::StorageResult<u64> {
            if self.fail_appends {
                self.inner.append(&data[..data.len() / 2])?;
                return Err(std::io::Error::other("half write").into());
            }
            self.inner.append(data)
        }

        fn flush(&mut self) -> stowdb_storage::StorageResult<()> {
            Ok(())
        }

        fn sync(&mut self) -> stowdb_storage::StorageResult<()> {
            Ok(())
        }

        fn size(&self) -> stowdb_storage::StorageResult<u64> {
            self.inner.size()
        }

        fn truncate(&mut self, new_size: u64) -> stowdb_storage::StorageResult<()> {
            if self.fail_truncate {
                return Err(std::io::Error::other("truncate refused").into());
            }
            self.inner.truncate(new_size)
        }
    }

    #[test]
    fn failed_append_leaves_no_partial_record() {
        let mem = MemoryStore::new();
        let log = LogManager::open(Box::new(HalfWriteStore {
            inner: mem.clone(),
            fail_appends: true,
            fail_truncate: false,
        }))
        .unwrap();
        assert!(log.append(&LogEntry::put("a", "1")).is_err());
        assert_eq!(mem.snapshot().len(), 0);
        assert_eq!(log.next_lsn(), Lsn::new(1));
    }

    #[test]
    fn unrecoverable_partial_write_poisons_appends() {
        let log = LogManager::open(Box::new(HalfWriteStore {
            inner: MemoryStore::new(),
            fail_appends: true,
            fail_truncate: true,
        }))
        .unwrap();
        assert!(matches!(
            log.append(&LogEntry::put("a", "1")),
            Err(CoreError::Storage(_))
        ));
        assert!(matches!(
            log.append(&LogEntry::put("b", "2")),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn read_up_to_stops_at_target() {
        let log = LogManager::open(Box::new(MemoryStore::new())).unwrap();
        for i in 0..5u8 {
            log.append(&LogEntry::put(vec![i], vec![i])).unwrap();
        }
        assert_eq!(log.read_up_to(Some(Lsn::new(3))).unwrap().len(), 3);
        assert!(log.read_up_to(Some(Lsn::ZERO)).unwrap().is_empty());
        assert_eq!(log.read_up_to(Some(Lsn::new(99))).unwrap().len(), 5);
    }

    #[test]
    fn truncate_after_drops_newer_records() {
        let log = LogManager::open(Box::new(MemoryStore::new())).unwrap();
        for i in 0..4u8 {
            log.append(&LogEntry::put(vec![i], vec![i])).unwrap();
        }
        log.truncate_after(Lsn::new(2)).unwrap();
        assert_eq!(log.last_lsn(), Lsn::new(2));
        assert_eq!(log.read_up_to(None).unwrap().len(), 2);
        assert_eq!(log.append(&LogEntry::delete_key(vec![0])).unwrap(), Lsn::new(3));
    }
}
