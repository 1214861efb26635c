//! Per-operation latency tracking with contention dumps.
//!
//! A slow operation on its own is not interesting here. A dump is taken only
//! when the finishing operation was slow *and* enough other operations were
//! in flight, and had themselves been running for at least the minimum
//! duration, at the moment it finished.

use crate::config::{TRACKER_CONCURRENCY_THRESHOLD, TRACKER_SAMPLE_CAPACITY};
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Operation types the environment reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpKind {
    /// Transactional or non-transactional put.
    Put,
    /// Transactional or non-transactional delete.
    Delete,
    /// Read.
    Get,
    /// Commit.
    Commit,
    /// Abort.
    Abort,
    /// Time spent blocked on a lock.
    LockWait,
}

/// Tracker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// A dump needs more than this many overlapping operations. At least 1.
    pub concurrency_threshold: usize,
    /// Operations shorter than this neither trigger nor count as overlap.
    pub min_duration: Duration,
    /// Dumps taken at most.
    pub max_dumps: usize,
    /// Recent samples kept per operation type for percentiles. At least 1.
    pub sample_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            concurrency_threshold: 8,
            min_duration: Duration::from_millis(100),
            max_dumps: 5,
            sample_capacity: 1024,
        }
    }
}

impl TrackerConfig {
    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] for a zero threshold or
    /// sample capacity.
    pub fn validate(&self) -> CoreResult<()> {
        if self.concurrency_threshold == 0 {
            return Err(CoreError::invalid_config(
                TRACKER_CONCURRENCY_THRESHOLD,
                "must be at least 1",
            ));
        }
        if self.sample_capacity == 0 {
            return Err(CoreError::invalid_config(
                TRACKER_SAMPLE_CAPACITY,
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Summary of one operation type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    /// Operations finished.
    pub count: u64,
    /// Sum of all durations.
    pub total: Duration,
    /// Shortest duration.
    pub min: Duration,
    /// Longest duration.
    pub max: Duration,
    /// `total / count`.
    pub mean: Duration,
    /// Median of the recent window.
    pub p50: Duration,
    /// 95th percentile of the recent window.
    pub p95: Duration,
    /// 99th percentile of the recent window.
    pub p99: Duration,
}

/// An in-flight operation captured in a dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightOp<O> {
    /// Operation type.
    pub op: O,
    /// Time it had been running when the dump was taken.
    pub elapsed: Duration,
}

/// Diagnostics taken when contention was seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentionDump<O> {
    /// Operation whose finish triggered the dump.
    pub trigger: O,
    /// Its duration.
    pub duration: Duration,
    /// Other slow operations still in flight, longest running first.
    pub overlapping: Vec<InFlightOp<O>>,
    /// Per-type stats at dump time.
    pub stats: Vec<(O, LatencyStats)>,
}

/// Handle for an operation started with [`LatencyTracker::start`].
#[derive(Debug)]
#[must_use = "pass the ticket to `finish` or the operation stays in flight"]
pub struct OpTicket<O> {
    id: u64,
    op: O,
    started: Instant,
}

impl<O: Copy> OpTicket<O> {
    /// Operation type.
    pub fn op(&self) -> O {
        self.op
    }
}

#[derive(Debug, Default)]
struct Samples {
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
    window: VecDeque<Duration>,
}

impl Samples {
    fn record(&mut self, d: Duration, capacity: usize) {
        if self.count == 0 || d < self.min {
            self.min = d;
        }
        self.max = self.max.max(d);
        self.count += 1;
        self.total += d;
        if self.window.len() == capacity {
            self.window.pop_front();
        }
        self.window.push_back(d);
    }

    fn stats(&self) -> LatencyStats {
        let mut sorted: Vec<Duration> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        let pick = |per_mille: usize| {
            let n = sorted.len();
            if n == 0 {
                Duration::ZERO
            } else {
                sorted[(n * per_mille / 1000).min(n - 1)]
            }
        };
        let mean =
            Duration::from_nanos((self.total.as_nanos() / u128::from(self.count.max(1))) as u64);
        LatencyStats {
            count: self.count,
            total: self.total,
            min: self.min,
            max: self.max,
            mean,
            p50: pick(500),
            p95: pick(950),
            p99: pick(990),
        }
    }
}

struct TrackerInner<O> {
    next_ticket: u64,
    in_flight: HashMap<u64, (O, Instant)>,
    samples: BTreeMap<O, Samples>,
    dumps: Vec<ContentionDump<O>>,
}

/// Records operation latencies from many threads and dumps diagnostics
/// when operations pile up.
///
/// ```rust
/// use stowdb_core::{LatencyTracker, OpKind, TrackerConfig};
///
/// let tracker = LatencyTracker::new(TrackerConfig::default()).unwrap();
/// let ticket = tracker.start(OpKind::Get);
/// tracker.finish(ticket);
/// assert_eq!(tracker.stats(OpKind::Get).unwrap().count, 1);
/// ```
pub struct LatencyTracker<O = OpKind> {
    config: TrackerConfig,
    inner: Mutex<TrackerInner<O>>,
}

impl<O> LatencyTracker<O>
where
    O: Copy + Ord + Debug,
{
    /// Creates a tracker.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] if `config` is invalid.
    pub fn new(config: TrackerConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(TrackerInner {
                next_ticket: 0,
                in_flight: HashMap::new(),
                samples: BTreeMap::new(),
                dumps: Vec::new(),
            }),
        })
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Marks the start of an operation.
    pub fn start(&self, op: O) -> OpTicket<O> {
        let started = Instant::now();
        let mut inner = self.inner.lock();
        let id = inner.next_ticket;
        inner.next_ticket += 1;
        inner.in_flight.insert(id, (op, started));
        OpTicket { id, op, started }
    }

    /// Marks the end of an operation and returns its duration.
    pub fn finish(&self, ticket: OpTicket<O>) -> Duration {
        let now = Instant::now();
        let duration = now.saturating_duration_since(ticket.started);
        let mut inner = self.inner.lock();
        inner.in_flight.remove(&ticket.id);
        inner
            .samples
            .entry(ticket.op)
            .or_default()
            .record(duration, self.config.sample_capacity);

        if duration < self.config.min_duration || inner.dumps.len() >= self.config.max_dumps {
            return duration;
        }
        let mut overlapping: Vec<InFlightOp<O>> = inner
            .in_flight
            .values()
            .map(|&(op, started)| InFlightOp {
                op,
                elapsed: now.saturating_duration_since(started),
            })
            .filter(|o| o.elapsed >= self.config.min_duration)
            .collect();
        if overlapping.len() < self.config.concurrency_threshold {
            return duration;
        }

        overlapping.sort_by(|a, b| b.elapsed.cmp(&a.elapsed));
        let stats = inner.samples.iter().map(|(op, s)| (*op, s.stats())).collect();
        let dump = ContentionDump {
            trigger: ticket.op,
            duration,
            overlapping,
            stats,
        };
        tracing::warn!(
            trigger = ?dump.trigger,
            duration_us = dump.duration.as_micros() as u64,
            overlapping = dump.overlapping.len(),
            dump_no = inner.dumps.len() + 1,
            "contention detected: {:?}",
            dump.overlapping
        );
        inner.dumps.push(dump);
        duration
    }

    /// Runs `f` as an operation of type `op`.
    pub fn time<R>(&self, op: O, f: impl FnOnce() -> R) -> R {
        let ticket = self.start(op);
        let result = f();
        self.finish(ticket);
        result
    }

    /// Stats for one operation type.
    #[must_use]
    pub fn stats(&self, op: O) -> Option<LatencyStats> {
        self.inner.lock().samples.get(&op).map(Samples::stats)
    }

    /// Stats for every operation type seen, in type order.
    #[must_use]
    pub fn all_stats(&self) -> Vec<(O, LatencyStats)> {
        self.inner
            .lock()
            .samples
            .iter()
            .map(|(op, s)| (*op, s.stats()))
            .collect()
    }

    /// Dumps taken so far.
    #[must_use]
    pub fn dumps(&self) -> Vec<ContentionDump<O>> {
        self.inner.lock().dumps.clone()
    }

    /// Operations started and not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }
}

impl<O> Debug for LatencyTracker<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyTracker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn config(threshold: usize, min_ms: u64, max_dumps: usize) -> TrackerConfig {
        TrackerConfig {
            concurrency_threshold: threshold,
            min_duration: Duration::from_millis(min_ms),
            max_dumps,
            sample_capacity: 16,
        }
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = LatencyTracker::<OpKind>::new(config(0, 0, 1)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfiguration { .. }));
    }

    #[test]
    fn lone_slow_operation_never_dumps() {
        let tracker = LatencyTracker::new(config(1, 5, 10)).unwrap();
        let ticket = tracker.start(OpKind::Commit);
        thread::sleep(Duration::from_millis(15));
        assert!(tracker.finish(ticket) >= Duration::from_millis(15));
        assert!(tracker.dumps().is_empty());
    }

    #[test]
    fn overlapping_slow_operations_dump() {
        let tracker = LatencyTracker::new(config(1, 10, 10)).unwrap();
        let long = tracker.start(OpKind::LockWait);
        let short = tracker.start(OpKind::Get);
        thread::sleep(Duration::from_millis(20));
        tracker.finish(short);
        tracker.finish(long);

        let dumps = tracker.dumps();
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].trigger, OpKind::Get);
        assert_eq!(dumps[0].overlapping.len(), 1);
        assert_eq!(dumps[0].overlapping[0].op, OpKind::LockWait);
    }

    #[test]
    fn fast_overlap_does_not_count() {
        let tracker = LatencyTracker::new(config(1, 10, 10)).unwrap();
        let slow = tracker.start(OpKind::Put);
        thread::sleep(Duration::from_millis(20));
        let fresh = tracker.start(OpKind::Get);
        tracker.finish(slow);
        tracker.finish(fresh);
        assert!(tracker.dumps().is_empty());
    }

    #[test]
    fn dumps_are_capped() {
        let tracker = LatencyTracker::new(config(2, 0, 2)).unwrap();
        let tickets: Vec<_> = (0..6).map(|_| tracker.start(OpKind::Put)).collect();
        for ticket in tickets {
            tracker.finish(ticket);
        }
        assert_eq!(tracker.dumps().len(), 2);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn stats_track_window_percentiles() {
        let tracker = LatencyTracker::new(config(100, 0, 0)).unwrap();
        for _ in 0..5 {
            tracker.time(OpKind::Delete, || ());
        }
        let stats = tracker.stats(OpKind::Delete).unwrap();
        assert_eq!(stats.count, 5);
        assert!(stats.min <= stats.p50 && stats.p50 <= stats.p99 && stats.p99 <= stats.max);
        assert!(tracker.stats(OpKind::Abort).is_none());
    }

    #[test]
    fn samples_window_is_bounded() {
        let mut samples = Samples::default();
        for ms in [50, 1, 2, 3] {
            samples.record(Duration::from_millis(ms), 3);
        }
        let stats = samples.stats();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.max, Duration::from_millis(50));
        assert_eq!(stats.min, Duration::from_millis(1));
        assert_eq!(stats.p99, Duration::from_millis(3));
        assert_eq!(stats.mean, Duration::from_millis(14));
    }
}
