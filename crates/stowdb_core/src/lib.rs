//! # stowdb core
//!
//! Recovery, locking and coordination for stowdb.
//!
//! This crate provides:
//! - The log format and [`LogManager`]
//! - Log replay and the [`RecoveryEngine`], which rebuild the live record set
//! - A [`LockManager`] with layered timeouts and deadlock detection
//! - [`SizeGatedMap`], a shared map callers can wait on for a size
//! - [`LatencyTracker`], which dumps diagnostics when slow operations pile up
//! - The [`Environment`] facade that ties them together

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
mod environment;
mod error;
pub mod lock;
pub mod log;
mod quorum;
pub mod recovery;
mod stats;
pub mod sync;
pub mod txn;
mod types;

pub use config::{EnvironmentConfig, IsolationLevel, TxnConfig};
pub use environment::Environment;
pub use error::{CoreError, CoreResult};
pub use lock::{LockGrant, LockManager, LockMode, LockRequest, LockStats};
pub use log::{LogEntry, LogManager, LogRecord};
pub use quorum::{AckQuorum, ReplicaId};
pub use recovery::{replay, LiveRecordSet, RecoveryEngine, RecoveryOutcome, ReplayState};
pub use stats::{EnvironmentStats, StatsSnapshot};
pub use sync::{CancelToken, LatencyTracker, OpKind, SizeGatedMap, TrackerConfig};
pub use txn::{Transaction, TxnState};
pub use types::{Lsn, ResourceId, TransactionId};
