//! Read/Write locks with layered timeouts and deadlock detection.
//!
//! - Read locks are shared; a Write lock excludes every other holder.
//! - A request covered by a lock the transaction already holds returns
//!   at once without queuing.
//! - Timeouts come from the environment, the transaction and the request,
//!   and each layer can only shorten the one around it.
//! - A lock timeout fails the request only. A transaction timeout or a
//!   deadlock also marks the transaction for abort.
//! - Deadlocks are found on a wait-for graph; the youngest transaction in
//!   the cycle is the victim.

mod deadlock;
mod manager;
mod mode;
mod timeout;

pub use deadlock::WaitForGraph;
pub use manager::{LockGrant, LockManager, LockRequest, LockStats};
pub use mode::LockMode;
pub use timeout::{bounded, narrow, Expiry, TimeoutLayers, WaitDeadlines};
