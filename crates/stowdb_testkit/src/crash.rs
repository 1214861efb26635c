//! Crash simulation for recovery tests.
//!
//! [`CrashableStore`] wraps a real store and fails once a byte budget is
//! spent, leaving the bytes that fit behind. The log manager removes them
//! again by truncating; with truncation failing as well, the bytes stay and
//! the next reader sees what a crash mid-append leaves: a torn tail.
//!
//! ```rust
//! use stowdb_core::{Environment, TxnConfig};
//! use stowdb_storage::MemoryStore;
//! use stowdb_testkit::{test_config, CrashableStore};
//!
//! let inner = MemoryStore::new();
//! let (store, control) = CrashableStore::new(Box::new(inner.clone()));
//! let env = Environment::open(test_config(), Box::new(store)).unwrap();
//! env.put_non_txnal(b"k", b"v").unwrap();
//!
//! control.crash_after(control.bytes_written() + 10);
//! assert!(env.put_non_txnal(b"k", b"w").is_err());
//! drop(env);
//!
//! let env = Environment::open(test_config(), Box::new(inner)).unwrap();
//! assert_eq!(env.live_records().len(), 1);
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use stowdb_storage::{LogStore, StorageError, StorageResult};

#[derive(Debug)]
struct CrashState {
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    crashed: AtomicBool,
    fail_on_flush: AtomicBool,
    fail_on_truncate: AtomicBool,
}

/// Handle that arms a [`CrashableStore`] after it has been moved into an
/// environment.
#[derive(Debug, Clone)]
pub struct CrashControl {
    state: Arc<CrashState>,
}

impl CrashControl {
    /// Fails appends once `bytes` bytes have been written in total. The
    /// append that crosses the line writes the bytes that fit.
    pub fn crash_after(&self, bytes: usize) {
        self.state.crash_after_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sets whether flush and sync fail.
    pub fn set_fail_on_flush(&self, fail: bool) {
        self.state.fail_on_flush.store(fail, Ordering::SeqCst);
    }

    /// Sets whether truncation fails.
    pub fn set_fail_on_truncate(&self, fail: bool) {
        self.state.fail_on_truncate.store(fail, Ordering::SeqCst);
    }

    /// Bytes appended through the wrapper so far.
    pub fn bytes_written(&self) -> usize {
        self.state.bytes_written.load(Ordering::SeqCst)
    }

    /// Returns whether a simulated crash has happened.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Disarms every failure.
    pub fn reset(&self) {
        self.state.crash_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.state.crashed.store(false, Ordering::SeqCst);
        self.state.fail_on_flush.store(false, Ordering::SeqCst);
        self.state.fail_on_truncate.store(false, Ordering::SeqCst);
    }
}

/// A log store that can simulate crashes.
pub struct CrashableStore {
    inner: Box<dyn LogStore>,
    state: Arc<CrashState>,
}

impl CrashableStore {
    /// Wraps `inner`, returning the store and its control handle.
    pub fn new(inner: Box<dyn LogStore>) -> (Self, CrashControl) {
        let state = Arc::new(CrashState {
            crash_after_bytes: AtomicUsize::new(usize::MAX),
            bytes_written: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            fail_on_flush: AtomicBool::new(false),
            fail_on_truncate: AtomicBool::new(false),
        });
        let control = CrashControl {
            state: Arc::clone(&state),
        };
        (Self { inner, state }, control)
    }

    fn crash(&self, what: &str) -> StorageError {
        self.state.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(io::Error::other(format!("simulated crash during {what}")))
    }
}

impl LogStore for CrashableStore {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let written = self.state.bytes_written.load(Ordering::SeqCst);
        let threshold = self.state.crash_after_bytes.load(Ordering::SeqCst);

        if written >= threshold {
            return Err(self.crash("write"));
        }
        if written + data.len() > threshold {
            let partial = threshold - written;
            self.inner.append(&data[..partial])?;
            self.state.bytes_written.fetch_add(partial, Ordering::SeqCst);
            return Err(self.crash("partial write"));
        }

        let offset = self.inner.append(data)?;
        self.state.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.state.fail_on_flush.load(Ordering::SeqCst) {
            return Err(self.crash("flush"));
        }
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.state.fail_on_flush.load(Ordering::SeqCst) {
            return Err(self.crash("sync"));
        }
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        if self.state.fail_on_truncate.load(Ordering::SeqCst) {
            return Err(self.crash("truncate"));
        }
        self.inner.truncate(new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::test_config;
    use stowdb_core::{CoreError, Environment, TxnConfig};
    use stowdb_storage::MemoryStore;

    fn crashable() -> (MemoryStore, Environment, CrashControl) {
        let inner = MemoryStore::new();
        let (store, control) = CrashableStore::new(Box::new(inner.clone()));
        let env = Environment::open(test_config(), Box::new(store)).unwrap();
        (inner, env, control)
    }

    #[test]
    fn partial_append_leaves_torn_tail() {
        let inner = MemoryStore::new();
        let (mut store, control) = CrashableStore::new(Box::new(inner.clone()));
        control.crash_after(4);
        assert!(store.append(b"abcdef").is_err());
        assert!(control.has_crashed());
        assert_eq!(inner.snapshot(), b"abcd");
        assert!(store.append(b"x").is_err());
    }

    #[test]
    fn crash_mid_commit_loses_the_transaction() {
        let (inner, env, control) = crashable();
        env.put_non_txnal(b"a", b"1").unwrap();

        let mut txn = env.begin(TxnConfig::default()).unwrap();
        env.put(&mut txn, b"b", b"2").unwrap();
        control.crash_after(control.bytes_written() + 3);
        assert!(env.commit(&mut txn).is_err());
        drop(env);

        let env = Environment::open(test_config(), Box::new(inner)).unwrap();
        let live = env.live_records();
        assert!(live.contains(b"a", b"1"));
        assert!(!live.contains_key(b"b"));
        assert_eq!(env.stats().recovered_aborts, 1);
    }

    #[test]
    fn crash_after_commit_keeps_the_transaction() {
        let (inner, env, control) = crashable();
        let mut txn = env.begin(TxnConfig::default()).unwrap();
        env.put(&mut txn, b"b", b"2").unwrap();
        env.commit(&mut txn).unwrap();
        control.crash_after(control.bytes_written());
        assert!(env.put_non_txnal(b"c", b"3").is_err());
        drop(env);

        let env = Environment::open(test_config(), Box::new(inner)).unwrap();
        assert!(env.live_records().contains(b"b", b"2"));
        assert!(!env.live_records().contains_key(b"c"));
    }

    #[test]
    fn appends_resume_after_a_failed_partial_append() {
        let (inner, env, control) = crashable();
        env.put_non_txnal(b"a", b"1").unwrap();
        env.transaction(TxnConfig::default(), |txn| env.put(txn, b"b", b"2").map(drop))
            .unwrap();
        let clean_len = inner.snapshot().len();

        control.crash_after(control.bytes_written() + 7);
        assert!(env.put_non_txnal(b"x", b"lost").is_err());
        assert_eq!(inner.snapshot().len(), clean_len);

        control.reset();
        env.put_non_txnal(b"c", b"3").unwrap();
        drop(env);

        let env = Environment::open(test_config(), Box::new(inner)).unwrap();
        let live = env.live_records();
        assert_eq!(live.len(), 3);
        assert!(live.contains(b"a", b"1"));
        assert!(live.contains(b"b", b"2"));
        assert!(live.contains(b"c", b"3"));
        assert!(!live.contains_key(b"x"));
        assert_eq!(env.stats().recovered_aborts, 0);
    }

    #[test]
    fn torn_tail_that_cannot_be_removed_stops_appends() {
        let (inner, env, control) = crashable();
        env.put_non_txnal(b"a", b"1").unwrap();
        let clean_len = inner.snapshot().len();

        control.set_fail_on_truncate(true);
        control.crash_after(control.bytes_written() + 7);
        assert!(env.put_non_txnal(b"x", b"lost").is_err());
        assert_eq!(inner.snapshot().len(), clean_len + 7);

        control.reset();
        assert!(matches!(
            env.put_non_txnal(b"c", b"3"),
            Err(CoreError::InvalidOperation { .. })
        ));
        drop(env);

        let env = Environment::open(test_config(), Box::new(inner)).unwrap();
        assert_eq!(env.live_records().len(), 1);
        assert!(env.live_records().contains(b"a", b"1"));
    }

    #[test]
    fn failed_sync_is_reported() {
        let inner = MemoryStore::new();
        let (store, control) = CrashableStore::new(Box::new(inner));
        let env = Environment::open(
            test_config().sync_on_commit(true),
            Box::new(store),
        )
        .unwrap();
        control.set_fail_on_flush(true);
        let mut txn = env.begin(TxnConfig::default()).unwrap();
        env.put(&mut txn, b"k", b"v").unwrap();
        assert!(env.commit(&mut txn).is_err());
        assert_eq!(env.lock_manager().locks_held(txn.id()), 0);

        control.reset();
        assert!(!control.has_crashed());
    }
}
