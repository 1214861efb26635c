//! Streaming log iterator.

use crate::error::{CoreError, CoreResult};
use crate::log::record::{
    LogEntry, LogRecord, RecordKind, CRC_SIZE, HEADER_CRC_OFFSET, HEADER_SIZE, LOG_MAGIC,
    LOG_VERSION,
};
use crate::types::Lsn;
use parking_lot::MutexGuard;
use stowdb_storage::LogStore;

/// A streaming iterator over log records.
///
/// Reads one record at a time from the store and yields
/// `(offset, LogRecord)` pairs. Memory use is bounded by the largest
/// record, not the log size.
///
/// A record cut short at the end of the store is a torn write and ends
/// iteration cleanly. The header carries its own CRC, so a damaged length
/// field is reported as corruption rather than mistaken for a torn write.
/// A bad checksum, magic, version, kind, payload or a
/// non-increasing LSN yields an error and stops iteration.
pub struct LogIterator<'a> {
    store: MutexGuard<'a, Box<dyn LogStore>>,
    total_size: u64,
    offset: u64,
    last_lsn: Lsn,
    torn_tail: bool,
    finished: bool,
}

impl<'a> LogIterator<'a> {
    /// Creates an iterator reading from offset zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the store size cannot be read.
    pub fn new(store: MutexGuard<'a, Box<dyn LogStore>>) -> CoreResult<Self> {
        let total_size = store.size()?;
        Ok(Self {
            store,
            total_size,
            offset: 0,
            last_lsn: Lsn::ZERO,
            torn_tail: false,
            finished: false,
        })
    }

    /// Offset just past the last complete record read so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    /// Whether iteration stopped at an incomplete trailing record.
    #[must_use]
    pub fn hit_torn_tail(&self) -> bool {
        self.torn_tail
    }

    /// LSN of the last record yielded, or [`Lsn::ZERO`].
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Ends iteration and hands back the store lock.
    #[must_use]
    pub fn into_store(self) -> MutexGuard<'a, Box<dyn LogStore>> {
        self.store
    }

    fn end_torn(&mut self, remaining: u64) -> CoreResult<Option<(u64, LogRecord)>> {
        tracing::warn!(
            offset = self.offset,
            discarded = remaining,
            "incomplete record at end of log, treating as end"
        );
        self.torn_tail = true;
        self.finished = true;
        Ok(None)
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, LogRecord)>> {
        let start = self.offset;
        let remaining = self.total_size - start;
        if remaining == 0 {
            self.finished = true;
            return Ok(None);
        }
        if remaining < HEADER_SIZE as u64 {
            return self.end_torn(remaining);
        }

        let header = self.store.read_at(start, HEADER_SIZE)?;
        let stored_header_crc = u32::from_le_bytes([
            header[HEADER_CRC_OFFSET],
            header[HEADER_CRC_OFFSET + 1],
            header[HEADER_CRC_OFFSET + 2],
            header[HEADER_CRC_OFFSET + 3],
        ]);
        let header_crc = crc32fast::hash(&header[..HEADER_CRC_OFFSET]);
        if stored_header_crc != header_crc {
            return Err(CoreError::ChecksumMismatch {
                offset: start,
                expected: stored_header_crc,
                actual: header_crc,
            });
        }
        if header[0..4] != LOG_MAGIC {
            return Err(CoreError::corruption(format!("bad magic at offset {start}")));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != LOG_VERSION {
            return Err(CoreError::corruption(format!(
                "unsupported log version {version} at offset {start}"
            )));
        }
        let kind = RecordKind::from_byte(header[6]).ok_or_else(|| {
            CoreError::corruption(format!("unknown record kind {} at offset {start}", header[6]))
        })?;
        let mut raw_lsn = [0u8; 8];
        raw_lsn.copy_from_slice(&header[7..15]);
        let lsn = Lsn::new(u64::from_le_bytes(raw_lsn));
        let payload_len =
            u32::from_le_bytes([header[15], header[16], header[17], header[18]]) as u64;

        let body_len = payload_len + CRC_SIZE as u64;
        if remaining - (HEADER_SIZE as u64) < body_len {
            return self.end_torn(remaining);
        }

        let body = self.store.read_at(start + HEADER_SIZE as u64, body_len as usize)?;
        let (payload, crc_bytes) = body.split_at(payload_len as usize);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(payload);
        let actual = hasher.finalize();
        if expected != actual {
            return Err(CoreError::ChecksumMismatch {
                offset: start,
                expected,
                actual,
            });
        }

        if lsn <= self.last_lsn {
            return Err(CoreError::corruption(format!(
                "{lsn} at offset {start} does not follow {}",
                self.last_lsn
            )));
        }

        let entry = LogEntry::decode_payload(kind, payload)?;
        self.offset = start + HEADER_SIZE as u64 + body_len;
        self.last_lsn = lsn;
        Ok(Some((start, LogRecord::new(lsn, entry))))
    }
}

impl Iterator for LogIterator<'_> {
    type Item = CoreResult<(u64, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use stowdb_storage::MemoryStore;

    fn store_with(records: &[LogRecord]) -> (MemoryStore, Mutex<Box<dyn LogStore>>) {
        let mem = MemoryStore::new();
        let mut boxed: Box<dyn LogStore> = Box::new(mem.clone());
        for record in records {
            boxed.append(&record.encode().unwrap()).unwrap();
        }
        (mem, Mutex::new(boxed))
    }

    fn rec(lsn: u64, entry: LogEntry) -> LogRecord {
        LogRecord::new(Lsn::new(lsn), entry)
    }

    #[test]
    fn empty_log() {
        let (_, store) = store_with(&[]);
        let mut iter = LogIterator::new(store.lock()).unwrap();
        assert!(iter.next().is_none());
        assert!(!iter.hit_torn_tail());
    }

    #[test]
    fn yields_records_in_order() {
        let records = vec![rec(1, LogEntry::put("a", "1")), rec(2, LogEntry::delete_key("a"))];
        let (_, store) = store_with(&records);
        let read: Vec<_> = LogIterator::new(store.lock())
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(read, records);
    }

    #[test]
    fn torn_tail_ends_cleanly() {
        let records = vec![rec(1, LogEntry::put("a", "1")), rec(2, LogEntry::put("b", "2"))];
        let (mem, _) = store_with(&records);
        let bytes = mem.snapshot();
        let cut = bytes.len() - 3;
        let store: Mutex<Box<dyn LogStore>> =
            Mutex::new(Box::new(MemoryStore::with_bytes(bytes[..cut].to_vec())));

        let mut iter = LogIterator::new(store.lock()).unwrap();
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.1, records[0]);
        assert!(iter.next().is_none());
        assert!(iter.hit_torn_tail());
        assert_eq!(iter.valid_end(), records[0].encode().unwrap().len() as u64);
    }

    #[test]
    fn flipped_payload_byte_is_checksum_mismatch() {
        let (mem, store) = store_with(&[rec(1, LogEntry::put("key", "value"))]);
        mem.corrupt_byte(HEADER_SIZE + 2, 0xEE);
        let result: Vec<_> = LogIterator::new(store.lock()).unwrap().collect();
        assert_eq!(result.len(), 1);
        assert!(matches!(result[0], Err(CoreError::ChecksumMismatch { offset: 0, .. })));
    }

    #[test]
    fn oversized_length_in_middle_record_is_corruption() {
        let records = vec![
            rec(1, LogEntry::put("a", "1")),
            rec(2, LogEntry::put("b", "2")),
            rec(3, LogEntry::put("c", "3")),
        ];
        let (mem, store) = store_with(&records);
        let second = records[0].encode().unwrap().len();
        mem.corrupt_byte(second + 18, 0x7F);

        let mut iter = LogIterator::new(store.lock()).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().1, records[0]);
        assert!(matches!(
            iter.next(),
            Some(Err(CoreError::ChecksumMismatch { .. }))
        ));
        assert!(!iter.hit_torn_tail());
    }

    #[test]
    fn torn_header_ends_cleanly() {
        let (mem, _) = store_with(&[rec(1, LogEntry::put("a", "1"))]);
        let mut bytes = mem.snapshot();
        bytes.extend_from_slice(&rec(2, LogEntry::put("b", "2")).encode().unwrap()[..HEADER_SIZE - 1]);
        let store: Mutex<Box<dyn LogStore>> = Mutex::new(Box::new(MemoryStore::with_bytes(bytes)));

        let mut iter = LogIterator::new(store.lock()).unwrap();
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().is_none());
        assert!(iter.hit_torn_tail());
    }

    #[test]
    fn unknown_kind_is_corruption() {
        let (mem, store) = store_with(&[rec(1, LogEntry::commit(crate::TransactionId::new(1)))]);
        mem.corrupt_byte(6, 42);
        let err = LogIterator::new(store.lock()).unwrap().next().unwrap().unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn repeated_lsn_is_corruption() {
        let (_, store) = store_with(&[rec(3, LogEntry::put("a", "1")), rec(3, LogEntry::put("b", "2"))]);
        let mut iter = LogIterator::new(store.lock()).unwrap();
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().unwrap_err().is_corruption());
        assert!(iter.next().is_none());
    }
}
