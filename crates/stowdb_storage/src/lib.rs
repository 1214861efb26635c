//! # stowdb storage
//!
//! Append-only byte stores that hold the stowdb log.
//!
//! A [`LogStore`] knows nothing about log records. It hands out the offset
//! of every append, reads back byte ranges, and can be cut back to a shorter
//! length. All record framing, checksums and LSN bookkeeping live in
//! `stowdb_core`.
//!
//! ## Available stores
//!
//! - [`MemoryStore`] - volatile, for tests and ephemeral environments
//! - [`FileStore`] - a single append-only file
//!
//! ## Example
//!
//! ```rust
//! use stowdb_storage::{LogStore, MemoryStore};
//!
//! let mut store = MemoryStore::new();
//! let offset = store.append(b"record").unwrap();
//! assert_eq!(store.read_at(offset, 6).unwrap(), b"record");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::LogStore;
