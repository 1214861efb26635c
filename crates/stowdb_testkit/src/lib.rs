//! # stowdb testkit
//!
//! Test utilities for stowdb.
//!
//! This crate provides:
//! - Environment fixtures over memory and temporary files
//! - A store wrapper that simulates crashes mid-append
//! - A reference model and a harness that checks every log prefix against it
//! - Property-based workload generators using proptest
//! - Named replay scenarios that round-trip through JSON
//! - Concurrency stress helpers
//! - Test logging setup
//!
//! ## Usage
//!
//! ```rust
//! use stowdb_testkit::prelude::*;
//! use stowdb_core::TxnConfig;
//!
//! with_temp_env(|env| {
//!     let mut txn = env.begin(TxnConfig::default()).unwrap();
//!     env.put(&mut txn, b"k", b"v").unwrap();
//!     env.commit(&mut txn).unwrap();
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod model;
pub mod scenarios;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::model::*;
    pub use crate::scenarios::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use model::*;
pub use scenarios::*;
pub use stress::*;
