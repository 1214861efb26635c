//! Stress tests for stowdb.
//!
//! These run the lock manager, the environment and the size-gated map
//! from several threads at once and check the invariants that only show
//! up under contention.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use stowdb_core::lock::WaitDeadlines;
use stowdb_core::{
    Environment, LockManager, LockMode, LockRequest, ResourceId, SizeGatedMap, TransactionId,
    TxnConfig,
};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Times an invariant was observed broken. Always zero on a correct
    /// build.
    pub violations: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, violations: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            violations,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {name} ===");
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Violations: {}", self.violations);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of distinct resources or keys.
    pub resources: usize,
    /// Fraction of lock requests that ask for read mode.
    pub read_ratio: f64,
    /// Lock timeout for each request.
    pub lock_timeout: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 500,
            threads: 4,
            resources: 8,
            read_ratio: 0.5,
            lock_timeout: Duration::from_millis(200),
        }
    }
}

#[derive(Default)]
struct Occupancy {
    readers: AtomicUsize,
    writers: AtomicUsize,
}

/// Hammers a lock manager with single-lock lockers and checks that a
/// write lock is never held together with any other lock on the same
/// resource.
pub fn stress_lock_exclusivity(locks: Arc<LockManager>, config: &StressConfig) -> StressTestResult {
    let resources: Arc<Vec<ResourceId>> = Arc::new(
        (0..config.resources)
            .map(|i| ResourceId::from(format!("r{i}").as_str()))
            .collect(),
    );
    let occupancy: Arc<Vec<Occupancy>> =
        Arc::new((0..config.resources).map(|_| Occupancy::default()).collect());
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let locks = Arc::clone(&locks);
            let resources = Arc::clone(&resources);
            let occupancy = Arc::clone(&occupancy);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let violations = Arc::clone(&violations);
            let config = config.clone();

            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for i in 0..config.operations {
                    let txid = TransactionId::new((t * config.operations + i + 1) as u64);
                    let slot = rng.gen_range(0..resources.len());
                    let mode = if rng.gen_bool(config.read_ratio) {
                        LockMode::Read
                    } else {
                        LockMode::Write
                    };
                    let now = Instant::now();
                    let deadlines =
                        WaitDeadlines::new(now, Some(config.lock_timeout), now, None);
                    let request =
                        LockRequest::new(txid, &resources[slot], mode).deadlines(deadlines);
                    if locks.acquire(request).is_err() {
                        failed.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    let cell = &occupancy[slot];
                    match mode {
                        LockMode::Write => {
                            let others = cell.writers.fetch_add(1, Ordering::SeqCst)
                                + cell.readers.load(Ordering::SeqCst);
                            if others != 0 {
                                violations.fetch_add(1, Ordering::Relaxed);
                            }
                            thread::yield_now();
                            cell.writers.fetch_sub(1, Ordering::SeqCst);
                        }
                        LockMode::Read => {
                            cell.readers.fetch_add(1, Ordering::SeqCst);
                            if cell.writers.load(Ordering::SeqCst) != 0 {
                                violations.fetch_add(1, Ordering::Relaxed);
                            }
                            thread::yield_now();
                            cell.readers.fetch_sub(1, Ordering::SeqCst);
                        }
                    }

                    locks.release_all(txid);
                    successful.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        violations.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Runs concurrent two-key transactions against an environment.
///
/// Transactions that time out or lose a deadlock are aborted and counted
/// as failed. Afterwards every committed transaction must have left both
/// of its pairs in the live set; a missing pair counts as a violation.
pub fn stress_transactions(env: Arc<Environment>, config: &StressConfig) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let committed: Arc<Mutex<Vec<(String, String, String)>>> = Arc::default();

    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let env = Arc::clone(&env);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let committed = Arc::clone(&committed);
            let config = config.clone();

            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let txn_config = TxnConfig::default().lock_timeout(config.lock_timeout);
                for i in 0..config.operations {
                    let a = format!("k{}", rng.gen_range(0..config.resources));
                    let b = format!("k{}", rng.gen_range(0..config.resources));
                    let value = format!("t{t}-{i}");
                    let result = env.transaction(txn_config.clone(), |txn| {
                        env.put(txn, a.as_bytes(), value.as_bytes())?;
                        env.put(txn, b.as_bytes(), value.as_bytes())?;
                        Ok(())
                    });
                    match result {
                        Ok(()) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                            committed.lock().push((a, b, value));
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }
    let duration = start.elapsed();

    let live = env.live_records();
    let violations = std::mem::take(&mut *committed.lock())
        .into_iter()
        .filter(|(a, b, value)| {
            !live.contains(a.as_bytes(), value.as_bytes())
                || !live.contains(b.as_bytes(), value.as_bytes())
        })
        .count();

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        violations,
        duration,
    )
}

/// Producers fill a size-gated map while waiters block on its final size.
///
/// Each of `config.threads` producers inserts `config.operations` distinct
/// keys. Every waiter must return `true`; a waiter that times out or
/// errors counts as a violation.
pub fn stress_gated_map(config: &StressConfig) -> StressTestResult {
    let map: Arc<SizeGatedMap<usize, usize>> = Arc::new(SizeGatedMap::new());
    let target = config.threads * config.operations;
    let violations = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let waiters: Vec<_> = (0..config.threads)
        .map(|_| {
            let map = Arc::clone(&map);
            let violations = Arc::clone(&violations);
            thread::spawn(move || {
                if !matches!(map.wait_for_size(target, Some(Duration::from_secs(30))), Ok(true)) {
                    violations.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    let producers: Vec<_> = (0..config.threads)
        .map(|t| {
            let map = Arc::clone(&map);
            let operations = config.operations;
            thread::spawn(move || {
                for i in 0..operations {
                    map.put(t * operations + i, i);
                }
            })
        })
        .collect();

    for handle in producers.into_iter().chain(waiters) {
        let _ = handle.join();
    }

    StressTestResult::new(map.len(), 0, violations.load(Ordering::Relaxed), start.elapsed())
}
