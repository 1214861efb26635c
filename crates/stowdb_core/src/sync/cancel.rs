//! Cancellation signal for blocking calls.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type Waker = Arc<dyn Fn() + Send + Sync>;

/// A sticky, cloneable cancellation flag.
///
/// Blocking primitives register a waker for the length of a wait. The waker
/// takes the primitive's mutex before notifying its condition variable, so
/// a cancel that races with a waiter going to sleep is never lost.
///
/// ```rust
/// use stowdb_core::CancelToken;
///
/// let token = CancelToken::new();
/// let handle = token.clone();
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    wakers: Mutex<HashMap<u64, Waker>>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token and runs every registered waker.
    ///
    /// Cancelling twice is harmless.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let wakers: Vec<Waker> = self.inner.wakers.lock().values().cloned().collect();
        for wake in wakers {
            wake();
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Registers `waker` until the returned guard drops.
    pub fn register(&self, waker: impl Fn() + Send + Sync + 'static) -> CancelRegistration<'_> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.wakers.lock().insert(id, Arc::new(waker));
        CancelRegistration { token: self, id }
    }

    fn deregister(&self, id: u64) {
        self.inner.wakers.lock().remove(&id);
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        self.inner.wakers.lock().len()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Keeps a waker registered with a [`CancelToken`].
#[must_use = "the waker is removed when the registration drops"]
pub struct CancelRegistration<'a> {
    token: &'a CancelToken,
    id: u64,
}

impl Drop for CancelRegistration<'_> {
    fn drop(&mut self) {
        self.token.deregister(self.id);
    }
}
