//! The write-ahead log.
//!
//! Every change to the live record set is written here first. Recovery
//! rebuilds the set by replaying the log in LSN order.
//!
//! ## Record format
//!
//! ```text
//! | magic "SLOG" (4) | version (2) | kind (1) | lsn (8) | length (4) | header crc32 (4) | payload (N) | crc32 (4) |
//! ```
//!
//! Integers are little endian. The header CRC covers the 19 bytes before
//! it; the trailing CRC covers header and payload. Keys and
//! values in the payload are length-prefixed with a `u32`; a delete carries
//! a one-byte flag before its value, `0` for the key-only sentinel and `1`
//! for an explicit value.
//!
//! ## Reading policy
//!
//! - A record cut short at the end of the store is a torn write. Reading
//!   stops there without error, and [`LogManager::open`] cuts it off. A
//!   record is only torn if fewer than a header's worth of bytes remain, or
//!   its header checks out and the payload it declares runs past the end.
//! - A bad checksum, magic, version, kind or payload is fatal.
//! - LSNs must strictly increase; a repeat or step back is fatal.

mod iterator;
mod record;
mod writer;

pub use iterator::LogIterator;
pub use record::{
    LogEntry, LogRecord, RecordKind, CRC_SIZE, HEADER_CRC_OFFSET, HEADER_SIZE, LOG_MAGIC,
    LOG_VERSION,
};
pub use writer::LogManager;
