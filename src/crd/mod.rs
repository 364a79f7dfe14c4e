//! # Custom Resource Definitions
//!
//! CRD types for the Node Refresh Controller.
//!
//! ## Module Structure
//!
//! - `spec.rs` - `NodeRefresh` specification and default values
//! - `status.rs` - Status types summarising refresh progress

mod spec;
mod status;

pub use spec::{
    default_drain_timeout, default_false, default_interval_days, default_max_concurrent_nodes,
    default_max_pods_to_move, default_min_healthy_pods, default_readiness_timeout,
    HealthChecks, NodeRefresh, NodeRefreshSpec, PodManagement, ScheduleSpec, TargetNodes,
};
pub use status::{Condition, FailedNode, NodeRefreshStatus, PolicyPhase};
