//! Environment and transaction configuration.
//!
//! Settings can be applied through the builder methods or by parameter name
//! with [`EnvironmentConfig::set_param`]. Both routes validate eagerly: a bad
//! value is rejected with [`CoreError::InvalidConfiguration`] and never
//! clamped or replaced by a default.
//!
//! | parameter                             | value                       |
//! |---------------------------------------|-----------------------------|
//! | `stow.lock.timeout`                   | duration, `0` = wait forever |
//! | `stow.txn.timeout`                    | duration, `0` = unlimited   |
//! | `stow.log.sync_on_commit`             | `true` / `false`            |
//! | `stow.lock.deadlock_detection`        | `true` / `false`            |
//! | `stow.tracker.concurrency_threshold`  | integer >= 1                |
//! | `stow.tracker.min_duration`           | duration                    |
//! | `stow.tracker.max_dumps`              | integer                     |
//! | `stow.tracker.sample_capacity`        | integer >= 1                |
//!
//! Durations are written `<integer> [ns|us|ms|s|min]`; a bare integer is
//! read as microseconds.
//!
//! A zero timeout means no timeout on every route: by parameter, through
//! the builders, or as a per-transaction or per-request override. An
//! override of zero therefore leaves the inherited timeout in place.

use crate::error::{CoreError, CoreResult};
use crate::lock::bounded;
use crate::sync::TrackerConfig;
use std::time::Duration;

/// Upper bound accepted for any timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(75 * 60);

/// Parameter name for the environment lock timeout.
pub const LOCK_TIMEOUT: &str = "stow.lock.timeout";
/// Parameter name for the environment transaction timeout.
pub const TXN_TIMEOUT: &str = "stow.txn.timeout";
/// Parameter name for commit-time log sync.
pub const SYNC_ON_COMMIT: &str = "stow.log.sync_on_commit";
/// Parameter name for wait-for cycle detection.
pub const DEADLOCK_DETECTION: &str = "stow.lock.deadlock_detection";
/// Parameter name for the tracker's concurrency threshold.
pub const TRACKER_CONCURRENCY_THRESHOLD: &str = "stow.tracker.concurrency_threshold";
/// Parameter name for the tracker's minimum duration.
pub const TRACKER_MIN_DURATION: &str = "stow.tracker.min_duration";
/// Parameter name for the tracker's dump cap.
pub const TRACKER_MAX_DUMPS: &str = "stow.tracker.max_dumps";
/// Parameter name for the tracker's per-type sample window.
pub const TRACKER_SAMPLE_CAPACITY: &str = "stow.tracker.sample_capacity";

/// Isolation level of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read locks are held until the transaction resolves.
    #[default]
    Serializable,
    /// Read locks are dropped as soon as the read completes.
    ReadCommitted,
}

/// Configuration for an environment.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Default bound on a single lock wait. `None` or zero waits forever.
    pub lock_timeout: Option<Duration>,
    /// Default bound on a transaction's lifetime. `None` or zero is
    /// unlimited.
    pub txn_timeout: Option<Duration>,
    /// Whether commit syncs the log before returning.
    pub sync_on_commit: bool,
    /// Whether blocked lock requests run wait-for cycle detection.
    pub deadlock_detection: bool,
    /// Contention tracker settings.
    pub tracker: TrackerConfig,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Some(Duration::from_millis(500)),
            txn_timeout: None,
            sync_on_commit: true,
            deadlock_detection: true,
            tracker: TrackerConfig::default(),
        }
    }
}

impl EnvironmentConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default lock timeout. Zero waits forever, like `None`.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = bounded(timeout);
        self
    }

    /// Sets the default transaction timeout. Zero is unlimited, like
    /// `None`.
    #[must_use]
    pub fn txn_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.txn_timeout = bounded(timeout);
        self
    }

    /// Sets whether commit syncs the log.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Enables or disables deadlock detection.
    #[must_use]
    pub const fn deadlock_detection(mut self, value: bool) -> Self {
        self.deadlock_detection = value;
        self
    }

    /// Replaces the tracker settings.
    #[must_use]
    pub fn tracker(mut self, tracker: TrackerConfig) -> Self {
        self.tracker = tracker;
        self
    }

    /// Sets a parameter by name. A timeout of `0` means no timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] for an unknown name or a
    /// malformed or out-of-range value. The config is unchanged on error.
    pub fn set_param(&mut self, name: &str, value: &str) -> CoreResult<()> {
        match name {
            LOCK_TIMEOUT => self.lock_timeout = parse_timeout(name, value)?,
            TXN_TIMEOUT => self.txn_timeout = parse_timeout(name, value)?,
            SYNC_ON_COMMIT => self.sync_on_commit = parse_bool(name, value)?,
            DEADLOCK_DETECTION => self.deadlock_detection = parse_bool(name, value)?,
            TRACKER_CONCURRENCY_THRESHOLD => {
                let threshold = parse_count(name, value)?;
                if threshold == 0 {
                    return Err(CoreError::invalid_config(name, "must be at least 1"));
                }
                self.tracker.concurrency_threshold = threshold;
            }
            TRACKER_MIN_DURATION => self.tracker.min_duration = parse_duration(name, value)?,
            TRACKER_MAX_DUMPS => self.tracker.max_dumps = parse_count(name, value)?,
            TRACKER_SAMPLE_CAPACITY => {
                let capacity = parse_count(name, value)?;
                if capacity == 0 {
                    return Err(CoreError::invalid_config(name, "must be at least 1"));
                }
                self.tracker.sample_capacity = capacity;
            }
            _ => return Err(CoreError::invalid_config(name, "unknown parameter")),
        }
        Ok(())
    }

    /// Checks every setting.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] naming the first bad
    /// setting.
    pub fn validate(&self) -> CoreResult<()> {
        check_timeout(LOCK_TIMEOUT, self.lock_timeout)?;
        check_timeout(TXN_TIMEOUT, self.txn_timeout)?;
        self.tracker.validate()
    }
}

/// Per-transaction settings.
#[derive(Debug, Clone, Default)]
pub struct TxnConfig {
    /// Isolation level.
    pub isolation: IsolationLevel,
    /// Lock timeout for this transaction. Can only shorten the
    /// environment's; `None` or zero inherits it.
    pub lock_timeout: Option<Duration>,
    /// Transaction timeout for this transaction. Can only shorten the
    /// environment's; `None` or zero inherits it.
    pub txn_timeout: Option<Duration>,
}

impl TxnConfig {
    /// Creates a serializable transaction config with no overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the isolation level.
    #[must_use]
    pub const fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Sets the transaction's lock timeout. Zero means no timeout of its
    /// own, so the environment's applies.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    /// Sets the transaction's lifetime bound. Zero means no bound of its
    /// own, so the environment's applies.
    #[must_use]
    pub const fn txn_timeout(mut self, timeout: Duration) -> Self {
        self.txn_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    /// Checks the overrides.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] for an out-of-range
    /// timeout.
    pub fn validate(&self) -> CoreResult<()> {
        check_timeout(LOCK_TIMEOUT, self.lock_timeout)?;
        check_timeout(TXN_TIMEOUT, self.txn_timeout)
    }
}

pub(crate) fn check_timeout(param: &str, timeout: Option<Duration>) -> CoreResult<()> {
    match timeout {
        Some(t) if t > MAX_TIMEOUT => Err(CoreError::invalid_config(
            param,
            format!("{t:?} exceeds the maximum of {MAX_TIMEOUT:?}"),
        )),
        _ => Ok(()),
    }
}

fn parse_timeout(param: &str, value: &str) -> CoreResult<Option<Duration>> {
    let duration = parse_duration(param, value)?;
    if duration.is_zero() {
        return Ok(None);
    }
    check_timeout(param, Some(duration))?;
    Ok(Some(duration))
}

/// Parses `<integer> [unit]`. A bare integer is microseconds.
pub fn parse_duration(param: &str, value: &str) -> CoreResult<Duration> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(CoreError::invalid_config(
            param,
            format!("{value:?} is not a duration"),
        ));
    }
    let amount: u64 = digits.parse().map_err(|_| {
        CoreError::invalid_config(param, format!("{value:?} is out of range"))
    })?;
    let duration = match unit.trim() {
        "" | "us" => Duration::from_micros(amount),
        "ns" => Duration::from_nanos(amount),
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "min" => amount
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| CoreError::invalid_config(param, "duration overflows"))?,
        other => {
            return Err(CoreError::invalid_config(
                param,
                format!("unknown duration unit {other:?}"),
            ))
        }
    };
    Ok(duration)
}

fn parse_bool(param: &str, value: &str) -> CoreResult<bool> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(CoreError::invalid_config(
            param,
            format!("{other:?} is not true or false"),
        )),
    }
}

fn parse_count(param: &str, value: &str) -> CoreResult<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| CoreError::invalid_config(param, format!("{value:?} is not a count")))
}
