//! Log record types and their binary encoding.

use crate::error::{CoreError, CoreResult};
use crate::types::{Lsn, TransactionId};

/// Magic bytes opening every log record.
pub const LOG_MAGIC: [u8; 4] = *b"SLOG";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// Header size: magic (4) + version (2) + kind (1) + lsn (8) + length (4)
/// + header CRC (4).
pub const HEADER_SIZE: usize = 23;

/// Bytes of the header covered by the header CRC.
pub const HEADER_CRC_OFFSET: usize = 19;

/// Trailing CRC size.
pub const CRC_SIZE: usize = 4;

/// Kind byte of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Immediate insert.
    NonTxnalPut = 1,
    /// Immediate delete.
    NonTxnalDelete = 2,
    /// Insert deferred until commit.
    TxnalPut = 3,
    /// Delete deferred until commit.
    TxnalDelete = 4,
    /// Transaction commit.
    Commit = 5,
    /// Transaction abort.
    Abort = 6,
}

impl RecordKind {
    /// Converts a kind byte, returning `None` for unknown kinds.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::NonTxnalPut),
            2 => Some(Self::NonTxnalDelete),
            3 => Some(Self::TxnalPut),
            4 => Some(Self::TxnalDelete),
            5 => Some(Self::Commit),
            6 => Some(Self::Abort),
            _ => None,
        }
    }

    /// Returns the kind byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// The body of a log record.
///
/// A delete whose `value` is `None` carries the "no value" sentinel and
/// removes the first record stored under its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogEntry {
    /// Insert `(key, value)` immediately.
    NonTxnalPut {
        /// Key.
        key: Vec<u8>,
        /// Value.
        value: Vec<u8>,
    },
    /// Delete immediately.
    NonTxnalDelete {
        /// Key.
        key: Vec<u8>,
        /// Exact value to delete, or `None` for any value under the key.
        value: Option<Vec<u8>>,
    },
    /// Insert `(key, value)` when `txid` commits.
    TxnalPut {
        /// Owning transaction.
        txid: TransactionId,
        /// Key.
        key: Vec<u8>,
        /// Value.
        value: Vec<u8>,
    },
    /// Delete when `txid` commits.
    TxnalDelete {
        /// Owning transaction.
        txid: TransactionId,
        /// Key.
        key: Vec<u8>,
        /// Exact value to delete, or `None` for any value under the key.
        value: Option<Vec<u8>>,
    },
    /// Commit `txid`.
    Commit {
        /// Transaction being committed.
        txid: TransactionId,
    },
    /// Abort `txid`.
    Abort {
        /// Transaction being aborted.
        txid: TransactionId,
    },
}

impl LogEntry {
    /// Immediate insert.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::NonTxnalPut {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Immediate delete of the first record under `key`.
    pub fn delete_key(key: impl Into<Vec<u8>>) -> Self {
        Self::NonTxnalDelete {
            key: key.into(),
            value: None,
        }
    }

    /// Immediate delete of the exact pair.
    pub fn delete(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::NonTxnalDelete {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Transactional insert.
    pub fn txn_put(
        txid: TransactionId,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self::TxnalPut {
            txid,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Transactional delete. `value` of `None` is the key-only sentinel.
    pub fn txn_delete(
        txid: TransactionId,
        key: impl Into<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> Self {
        Self::TxnalDelete {
            txid,
            key: key.into(),
            value,
        }
    }

    /// Commit record.
    #[must_use]
    pub const fn commit(txid: TransactionId) -> Self {
        Self::Commit { txid }
    }

    /// Abort record.
    #[must_use]
    pub const fn abort(txid: TransactionId) -> Self {
        Self::Abort { txid }
    }

    /// Returns the record kind.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::NonTxnalPut { .. } => RecordKind::NonTxnalPut,
            Self::NonTxnalDelete { .. } => RecordKind::NonTxnalDelete,
            Self::TxnalPut { .. } => RecordKind::TxnalPut,
            Self::TxnalDelete { .. } => RecordKind::TxnalDelete,
            Self::Commit { .. } => RecordKind::Commit,
            Self::Abort { .. } => RecordKind::Abort,
        }
    }

    /// Returns the transaction this record belongs to, if any.
    #[must_use]
    pub fn txid(&self) -> Option<TransactionId> {
        match self {
            Self::TxnalPut { txid, .. }
            | Self::TxnalDelete { txid, .. }
            | Self::Commit { txid }
            | Self::Abort { txid } => Some(*txid),
            Self::NonTxnalPut { .. } | Self::NonTxnalDelete { .. } => None,
        }
    }

    /// Encodes the payload (no envelope).
    ///
    /// # Errors
    ///
    /// Returns an error if a key or value is longer than `u32::MAX` bytes.
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::NonTxnalPut { key, value } => {
                put_bytes(&mut buf, key)?;
                put_bytes(&mut buf, value)?;
            }
            Self::NonTxnalDelete { key, value } => {
                put_bytes(&mut buf, key)?;
                put_optional(&mut buf, value.as_deref())?;
            }
            Self::TxnalPut { txid, key, value } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                put_bytes(&mut buf, key)?;
                put_bytes(&mut buf, value)?;
            }
            Self::TxnalDelete { txid, key, value } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
                put_bytes(&mut buf, key)?;
                put_optional(&mut buf, value.as_deref())?;
            }
            Self::Commit { txid } | Self::Abort { txid } => {
                buf.extend_from_slice(&txid.as_u64().to_le_bytes());
            }
        }
        Ok(buf)
    }

    /// Decodes a payload of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] for a short payload, a bad
    /// presence flag, or trailing bytes.
    pub fn decode_payload(kind: RecordKind, payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader::new(kind, payload);
        let entry = match kind {
            RecordKind::NonTxnalPut => Self::NonTxnalPut {
                key: reader.bytes()?,
                value: reader.bytes()?,
            },
            RecordKind::NonTxnalDelete => Self::NonTxnalDelete {
                key: reader.bytes()?,
                value: reader.optional()?,
            },
            RecordKind::TxnalPut => Self::TxnalPut {
                txid: TransactionId::new(reader.u64()?),
                key: reader.bytes()?,
                value: reader.bytes()?,
            },
            RecordKind::TxnalDelete => Self::TxnalDelete {
                txid: TransactionId::new(reader.u64()?),
                key: reader.bytes()?,
                value: reader.optional()?,
            },
            RecordKind::Commit => Self::Commit {
                txid: TransactionId::new(reader.u64()?),
            },
            RecordKind::Abort => Self::Abort {
                txid: TransactionId::new(reader.u64()?),
            },
        };
        reader.finish()?;
        Ok(entry)
    }
}

/// A log record: an entry at a position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogRecord {
    /// Position in the log.
    pub lsn: Lsn,
    /// What the record does.
    pub entry: LogEntry,
}

impl LogRecord {
    /// Creates a record.
    #[must_use]
    pub const fn new(lsn: Lsn, entry: LogEntry) -> Self {
        Self { lsn, entry }
    }

    /// Encodes the full framed record: header, payload and CRC.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not fit the 4-byte length field.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload = self.entry.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("log record payload too large"))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&LOG_MAGIC);
        frame.extend_from_slice(&LOG_VERSION.to_le_bytes());
        frame.push(self.entry.kind().as_byte());
        frame.extend_from_slice(&self.lsn.as_u64().to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        let header_crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&header_crc.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> CoreResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| CoreError::invalid_operation("key or value longer than 4 GiB"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_optional(buf: &mut Vec<u8>, bytes: Option<&[u8]>) -> CoreResult<()> {
    match bytes {
        Some(bytes) => {
            buf.push(1);
            put_bytes(buf, bytes)
        }
        None => {
            buf.push(0);
            Ok(())
        }
    }
}

struct PayloadReader<'a> {
    kind: RecordKind,
    payload: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(kind: RecordKind, payload: &'a [u8]) -> Self {
        Self {
            kind,
            payload,
            pos: 0,
        }
    }

    fn take(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.payload.len())
            .ok_or_else(|| {
                CoreError::corruption(format!("{:?} payload ends early", self.kind))
            })?;
        let slice = &self.payload[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn bytes(&mut self) -> CoreResult<Vec<u8>> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        let len = u32::from_le_bytes(raw) as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn optional(&mut self) -> CoreResult<Option<Vec<u8>>> {
        match self.take(1)?[0] {
            0 => Ok(None),
            1 => Ok(Some(self.bytes()?)),
            flag => Err(CoreError::corruption(format!(
                "{:?} payload has value flag {flag}",
                self.kind
            ))),
        }
    }

    fn finish(self) -> CoreResult<()> {
        if self.pos != self.payload.len() {
            return Err(CoreError::corruption(format!(
                "trailing bytes in {:?} payload: used {} of {}",
                self.kind,
                self.pos,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    #[test]
    fn kind_bytes() {
        for kind in [
            RecordKind::NonTxnalPut,
            RecordKind::NonTxnalDelete,
            RecordKind::TxnalPut,
            RecordKind::TxnalDelete,
            RecordKind::Commit,
            RecordKind::Abort,
        ] {
            assert_eq!(RecordKind::from_byte(kind.as_byte()), Some(kind));
        }
        assert_eq!(RecordKind::from_byte(0), None);
        assert_eq!(RecordKind::from_byte(7), None);
    }

    #[test]
    fn sentinel_and_explicit_deletes_decode_distinctly() {
        let sentinel = LogEntry::txn_delete(t(4), "k", None);
        let exact = LogEntry::txn_delete(t(4), "k", Some(b"v".to_vec()));
        let a = sentinel.encode_payload().unwrap();
        let b = exact.encode_payload().unwrap();
        assert_ne!(a, b);
        assert_eq!(
            LogEntry::decode_payload(RecordKind::TxnalDelete, &a).unwrap(),
            sentinel
        );
        assert_eq!(
            LogEntry::decode_payload(RecordKind::TxnalDelete, &b).unwrap(),
            exact
        );
    }

    #[test]
    fn empty_value_is_not_the_sentinel() {
        let entry = LogEntry::delete("k", Vec::new());
        let payload = entry.encode_payload().unwrap();
        let decoded = LogEntry::decode_payload(RecordKind::NonTxnalDelete, &payload).unwrap();
        assert_eq!(decoded, entry);
        assert!(matches!(decoded, LogEntry::NonTxnalDelete { value: Some(v), .. } if v.is_empty()));
    }

    #[test]
    fn short_payload_is_corruption() {
        let payload = LogEntry::put("key", "value").encode_payload().unwrap();
        let err = LogEntry::decode_payload(RecordKind::NonTxnalPut, &payload[..payload.len() - 1])
            .unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let mut payload = LogEntry::commit(t(1)).encode_payload().unwrap();
        payload.push(0);
        assert!(LogEntry::decode_payload(RecordKind::Commit, &payload)
            .unwrap_err()
            .is_corruption());
    }

    #[test]
    fn bad_presence_flag_is_corruption() {
        let mut payload = LogEntry::delete_key("k").encode_payload().unwrap();
        let last = payload.len() - 1;
        payload[last] = 7;
        assert!(LogEntry::decode_payload(RecordKind::NonTxnalDelete, &payload)
            .unwrap_err()
            .is_corruption());
    }

    #[test]
    fn frame_layout() {
        let record = LogRecord::new(Lsn::new(9), LogEntry::abort(t(3)));
        let frame = record.encode().unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + 8 + CRC_SIZE);
        assert_eq!(&frame[0..4], b"SLOG");
        assert_eq!(frame[6], RecordKind::Abort.as_byte());
        assert_eq!(u64::from_le_bytes(frame[7..15].try_into().unwrap()), 9);
        let header_crc = u32::from_le_bytes(frame[19..23].try_into().unwrap());
        assert_eq!(header_crc, crc32fast::hash(&frame[..HEADER_CRC_OFFSET]));
        let crc = u32::from_le_bytes(frame[frame.len() - 4..].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(&frame[..frame.len() - 4]));
    }

    #[test]
    fn txid_only_on_transactional_kinds() {
        assert_eq!(LogEntry::put("k", "v").txid(), None);
        assert_eq!(LogEntry::delete_key("k").txid(), None);
        assert_eq!(LogEntry::txn_put(t(2), "k", "v").txid(), Some(t(2)));
        assert_eq!(LogEntry::commit(t(5)).txid(), Some(t(5)));
    }
}
