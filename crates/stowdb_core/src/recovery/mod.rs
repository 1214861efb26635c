//! Log replay and crash recovery.
//!
//! Replay is a single forward pass in LSN order:
//!
//! - Non-transactional puts and deletes change the live set at once.
//! - Transactional puts and deletes are buffered per transaction.
//! - A commit folds the transaction's buffer into the live set; an abort
//!   drops it. A transaction with no resolution in the replayed prefix is
//!   treated as aborted.
//! - A commit or abort for a transaction with no buffered work is a no-op,
//!   which lets replay start in the middle of a transaction's history.
//!
//! Replaying the same prefix always yields the same live set.

mod engine;
mod live_set;
mod replay;

pub use engine::{RecoveryEngine, RecoveryOutcome};
pub use live_set::LiveRecordSet;
pub use replay::{replay, PendingTxn, ReplayState, ReplayStats};
