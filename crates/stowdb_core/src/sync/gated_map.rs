//! A shared map whose callers can wait for it to reach a size.

use crate::error::{CoreError, CoreResult};
use crate::sync::cancel::CancelToken;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A concurrent map with size-threshold waits.
///
/// [`wait_for_size`](Self::wait_for_size) blocks until the map holds at
/// least `n` entries. Every put that grows the map wakes all waiters, and
/// each rechecks its own threshold under the map lock, so no satisfying put
/// can slip past a waiter.
///
/// [`abandon`](Self::abandon) fails every current waiter and every later
/// wait until [`reset`](Self::reset). Current waiters notice through a
/// generation counter captured when their wait began.
///
/// ```rust
/// use stowdb_core::SizeGatedMap;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let map = Arc::new(SizeGatedMap::new());
/// let writer = Arc::clone(&map);
/// let t = std::thread::spawn(move || {
///     writer.put("a", 1);
///     writer.put("b", 2);
/// });
/// assert!(map.wait_for_size(2, Some(Duration::from_secs(5))).unwrap());
/// t.join().unwrap();
/// ```
pub struct SizeGatedMap<K, V> {
    shared: Arc<GateShared<K, V>>,
}

struct GateShared<K, V> {
    state: Mutex<GateState<K, V>>,
    changed: Condvar,
}

struct GateState<K, V> {
    entries: HashMap<K, V>,
    generation: u64,
    abandoned: Option<String>,
    last_cause: String,
    waiters: usize,
}

impl<K, V> SizeGatedMap<K, V>
where
    K: Eq + Hash,
{
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(GateShared {
                state: Mutex::new(GateState {
                    entries: HashMap::new(),
                    generation: 0,
                    abandoned: None,
                    last_cause: String::new(),
                    waiters: 0,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Inserts or replaces an entry, returning the old value.
    ///
    /// Waiters are woken when the map grows.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let mut state = self.shared.state.lock();
        let old = state.entries.insert(key, value);
        if old.is_none() && state.waiters > 0 {
            self.shared.changed.notify_all();
        }
        old
    }

    /// Removes an entry.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.shared.state.lock().entries.remove(key)
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.shared.state.lock().entries.clear();
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.shared.state.lock().entries.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of callers blocked in a size wait.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.shared.state.lock().waiters
    }

    /// Blocks until the map holds at least `n` entries.
    ///
    /// Returns `Ok(true)` once the size is reached and `Ok(false)` if
    /// `timeout` elapses first. `None` waits without bound.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WaitAbandoned`] if the map is or becomes
    /// abandoned.
    pub fn wait_for_size(&self, n: usize, timeout: Option<Duration>) -> CoreResult<bool> {
        self.wait(n, timeout, None)
    }

    /// Like [`wait_for_size`](Self::wait_for_size), but returns
    /// [`CoreError::Interrupted`] when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WaitAbandoned`] or [`CoreError::Interrupted`].
    pub fn wait_for_size_cancellable(
        &self,
        n: usize,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> CoreResult<bool>
    where
        K: Send + 'static,
        V: Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let _registration = cancel.register(move || {
            let _state = shared.state.lock();
            shared.changed.notify_all();
        });
        self.wait(n, timeout, Some(cancel))
    }

    fn wait(
        &self,
        n: usize,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> CoreResult<bool> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.shared.state.lock();
        if let Some(cause) = &state.abandoned {
            return Err(CoreError::wait_abandoned(cause.clone()));
        }
        let generation = state.generation;

        state.waiters += 1;
        let outcome = loop {
            if state.generation != generation {
                break Err(CoreError::wait_abandoned(state.last_cause.clone()));
            }
            if state.entries.len() >= n {
                break Ok(true);
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                break Err(CoreError::Interrupted);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        break Ok(false);
                    }
                    self.shared.changed.wait_until(&mut state, deadline);
                }
                None => self.shared.changed.wait(&mut state),
            }
        };
        state.waiters -= 1;
        outcome
    }

    /// Fails every current and future size wait with `cause` until
    /// [`reset`](Self::reset).
    pub fn abandon(&self, cause: impl Into<String>) {
        let cause = cause.into();
        let mut state = self.shared.state.lock();
        tracing::debug!(waiters = state.waiters, cause = %cause, "abandoning size waits");
        state.generation += 1;
        state.last_cause.clone_from(&cause);
        state.abandoned = Some(cause);
        self.shared.changed.notify_all();
    }

    /// Clears an abandonment so waits block again. Entries are kept.
    pub fn reset(&self) {
        self.shared.state.lock().abandoned = None;
    }

    /// Cause of the current abandonment, if any.
    #[must_use]
    pub fn abandoned(&self) -> Option<String> {
        self.shared.state.lock().abandoned.clone()
    }
}

impl<K, V> SizeGatedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Returns a copy of the value under `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.shared.state.lock().entries.get(key).cloned()
    }

    /// Copies every entry out.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.shared.state.lock().entries.clone()
    }
}

impl<K: Eq + Hash, V> Default for SizeGatedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for SizeGatedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SizeGatedMap")
            .field("len", &state.entries.len())
            .field("waiters", &state.waiters)
            .field("abandoned", &state.abandoned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn wait_for_waiters<K: Eq + Hash, V>(map: &SizeGatedMap<K, V>, n: usize) {
        let start = Instant::now();
        while map.waiting() < n {
            assert!(start.elapsed() < Duration::from_secs(5), "waiters never blocked");
            thread::yield_now();
        }
    }

    #[test]
    fn satisfied_wait_returns_at_once() {
        let map = SizeGatedMap::new();
        map.put(1, "a");
        assert!(map.wait_for_size(1, Some(Duration::ZERO)).unwrap());
        assert!(map.wait_for_size(0, None).unwrap());
    }

    #[test]
    fn wait_times_out() {
        let map: SizeGatedMap<u32, u32> = SizeGatedMap::new();
        let start = Instant::now();
        assert!(!map.wait_for_size(1, Some(Duration::from_millis(30))).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(map.waiting(), 0);
    }

    #[test]
    fn replacing_a_value_does_not_grow() {
        let map = SizeGatedMap::new();
        assert_eq!(map.put("k", 1), None);
        assert_eq!(map.put("k", 2), Some(1));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"k"), Some(2));
    }

    #[test]
    fn thresholds_wake_in_order() {
        const N: usize = 6;
        let map = Arc::new(SizeGatedMap::new());
        let handles: Vec<_> = (1..=N)
            .map(|threshold| {
                let map = Arc::clone(&map);
                thread::spawn(move || map.wait_for_size(threshold, Some(Duration::from_secs(10))))
            })
            .collect();
        wait_for_waiters(&map, N);

        for i in 1..=N {
            map.put(i, i);
            let start = Instant::now();
            while map.waiting() > N - i {
                assert!(start.elapsed() < Duration::from_secs(5), "waiters never woke");
                thread::yield_now();
            }
            assert_eq!(map.waiting(), N - i);
        }
        for handle in handles {
            assert!(handle.join().unwrap().unwrap());
        }
    }

    #[test]
    fn waiter_above_size_keeps_waiting() {
        let map = Arc::new(SizeGatedMap::new());
        let low = {
            let map = Arc::clone(&map);
            thread::spawn(move || map.wait_for_size(1, Some(Duration::from_secs(10))))
        };
        let high = {
            let map = Arc::clone(&map);
            thread::spawn(move || map.wait_for_size(3, Some(Duration::from_secs(10))))
        };
        wait_for_waiters(&map, 2);
        map.put("a", ());
        assert!(low.join().unwrap().unwrap());
        wait_for_waiters(&map, 1);
        assert_eq!(map.waiting(), 1);
        map.put("b", ());
        map.put("c", ());
        assert!(high.join().unwrap().unwrap());
    }

    #[test]
    fn abandon_fails_current_and_future_waits() {
        let map: Arc<SizeGatedMap<u8, u8>> = Arc::new(SizeGatedMap::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || map.wait_for_size(10, None))
            })
            .collect();
        wait_for_waiters(&map, 4);

        map.abandon("shutting down");
        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(matches!(err, CoreError::WaitAbandoned { ref cause } if cause == "shutting down"));
        }

        let start = Instant::now();
        assert!(matches!(
            map.wait_for_size(1, Some(Duration::from_secs(10))),
            Err(CoreError::WaitAbandoned { .. })
        ));
        assert!(start.elapsed() < Duration::from_secs(1));

        map.reset();
        map.put(1, 1);
        assert!(map.wait_for_size(1, Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn cancel_interrupts_wait() {
        let map: Arc<SizeGatedMap<u8, u8>> = Arc::new(SizeGatedMap::new());
        let token = CancelToken::new();
        let handle = {
            let map = Arc::clone(&map);
            let token = token.clone();
            thread::spawn(move || map.wait_for_size_cancellable(1, None, &token))
        };
        wait_for_waiters(&map, 1);
        token.cancel();
        assert!(matches!(handle.join().unwrap(), Err(CoreError::Interrupted)));
        assert_eq!(map.waiting(), 0);
    }
}
