//! Router - role resolution, retry and fallback
//!
//! # Module Structure
//!
//! - `classify`: connection-class vs non-connection-class failures
//! - `types`: per-call options, call records and the metrics sink trait
//! - `router_impl`: the [`Router`] itself

mod classify;
mod router_impl;
mod types;


pub use classify::{classify, FailureClass, CONNECTION_STATUSES, NON_CONNECTION_STATUSES};
pub use router_impl::Router;
pub use types::{CallOptions, CallRecord, MetricsSink};
