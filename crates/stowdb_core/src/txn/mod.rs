//! Transactions.
//!
//! A [`Transaction`] is created by
//! [`Environment::begin`](crate::Environment::begin) and resolved by
//! `commit` or `abort` on the same environment.

mod state;

pub(crate) use state::TxnRelease;
pub use state::{Transaction, TxnState};
