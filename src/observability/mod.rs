//! # Observability
//!
//! Prometheus metrics for the refresh engine and the `NodeRefresh` reconciler.
//! Logging goes through `tracing`; the subscriber is installed by the runtime.

pub mod metrics;

pub use metrics::*;
