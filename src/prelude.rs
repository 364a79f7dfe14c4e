//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ```rust
//! use node_refresh_controller::prelude::*;
//! ```

// CRD types
pub use crate::crd::*;

// Cluster access
pub use crate::cluster::{
    ClusterClient, ClusterError, ClusterResult, DisruptionBudget, InMemoryCluster,
    KubeClusterClient, NodeSpec, NodeStatus, PodInfo, PodPhase,
};

// Persistence
pub use crate::store::{
    ConfigMapStatusStore, MemoryStatusStore, StatusStore, StoreError, StoreResult,
};

// Refresh engine
pub use crate::controller::health::{DisruptionScope, HealthChecker};
pub use crate::controller::planner::{EvictionBatch, EvictionPlan, EvictionPlanner};
pub use crate::controller::reconciliation_loop::ReconciliationLoop;
pub use crate::controller::request::{NodeRefreshRequest, RefreshPhase};
pub use crate::controller::retry::RetryPolicy;
pub use crate::controller::state_machine::{Advance, Next, NodeRefreshStateMachine};
pub use crate::controller::trigger::{TriggerEvent, TriggerSource};

// Reconciler types
pub use crate::controller::reconciler::{reconcile, BackoffState, Reconciler, ReconcilerError};

// Config types
pub use crate::config::{ControllerConfig, SharedControllerConfig};
