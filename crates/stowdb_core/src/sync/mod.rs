//! Coordination primitives shared by the engine.
//!
//! Each is an ordinary owned value. Callers that need to share one wrap it
//! in an `Arc` and hand out clones.

mod cancel;
mod gated_map;
mod latency;

pub use cancel::{CancelRegistration, CancelToken};
pub use gated_map::SizeGatedMap;
pub use latency::{
    ContentionDump, InFlightOp, LatencyStats, LatencyTracker, OpKind, OpTicket, TrackerConfig,
};
