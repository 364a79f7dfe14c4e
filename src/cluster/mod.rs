//! # Cluster Access
//!
//! The narrow set of cluster reads and writes the node refresh engine needs.
//!
//! - `ClusterClient`: the trait the state machine, planner and health checker call
//! - `k8s`: implementation on top of the Kubernetes API
//! - `memory`: in-memory cluster for local simulation and tests
//!
//! Every operation reports "not found" and "conflict" distinctly from other
//! failures so callers can treat idempotent writes as done.

pub mod k8s;
pub mod memory;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use k8s::KubeClusterClient;
pub use memory::{InMemoryCluster, Operation};

/// Errors returned by cluster operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// Object does not exist
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    /// Optimistic concurrency conflict or object already exists
    #[error("conflict on {kind} {name}: {message}")]
    Conflict {
        kind: &'static str,
        name: String,
        message: String,
    },
    /// Eviction refused because it would violate a disruption budget
    #[error("eviction of {pod} refused by disruption budget: {message}")]
    DisruptionBudget { pod: String, message: String },
    /// Call did not complete within the caller-supplied timeout
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },
    /// Any other API failure
    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
}

impl ClusterError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }

    /// Errors worth retrying with backoff
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !self.is_not_found()
    }
}

/// Result type alias for cluster operations
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Observed state of a node
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeStatus {
    pub name: String,
    /// Ready condition is `True`
    pub ready: bool,
    /// Health of the Ready condition is known at all
    pub ready_known: bool,
    /// `spec.unschedulable`
    pub unschedulable: bool,
    /// Allocatable pod capacity registered by the kubelet
    pub allocatable_pods: u32,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Request to provision a replacement node
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Lifecycle phase of a pod as reported by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl PodPhase {
    #[must_use]
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Pod finished and holds no workload
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// A pod scheduled on a node, reduced to what draining needs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub phase: PodPhase,
    /// Ready condition; `None` when the pod reports no Ready condition
    pub ready: Option<bool>,
    /// Disruption budget covering the pod (`namespace/name`), if any
    pub budget: Option<String>,
    /// Owned by a DaemonSet; drain leaves it in place
    pub daemonset: bool,
    /// Static pod mirrored by the kubelet; cannot be evicted
    pub mirror: bool,
    /// Deletion timestamp set
    pub terminating: bool,
}

impl PodInfo {
    /// Identifier used in `drainedPods` and eviction calls
    #[must_use]
    pub fn id(&self) -> String {
        pod_id(&self.namespace, &self.name)
    }

    /// Drain is responsible for moving this pod
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        !self.daemonset && !self.mirror
    }

    /// Pod still occupies the node as a workload
    #[must_use]
    pub fn is_running_workload(&self) -> bool {
        self.is_evictable() && !self.phase.is_finished()
    }
}

/// Snapshot of a disruption budget
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisruptionBudget {
    /// `namespace/name`
    pub scope: String,
    /// Disruptions the budget admits right now
    pub disruptions_allowed: u32,
    pub current_healthy: u32,
    pub desired_healthy: u32,
}

/// Build a pod identifier
#[must_use]
pub fn pod_id(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Split a `namespace/name` identifier
#[must_use]
pub fn split_id(id: &str) -> (&str, &str) {
    id.split_once('/').unwrap_or(("default", id))
}

/// Bound a cluster call by `timeout`, mapping expiry to `ClusterError::Timeout`
pub async fn with_timeout<T, F>(timeout: Duration, operation: &'static str, call: F) -> ClusterResult<T>
where
    F: Future<Output = ClusterResult<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or(Err(ClusterError::Timeout {
            operation,
            seconds: timeout.as_secs(),
        }))
}

/// Cluster operations consumed by the refresh engine
///
/// Implementations must be safe to call concurrently for different nodes.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a node; `NotFound` when it does not exist
    async fn get_node(&self, node: &str) -> ClusterResult<NodeStatus>;

    /// List nodes matching a label selector (`key=value` pairs, all must match)
    async fn list_nodes(&self, selector: &BTreeMap<String, String>)
        -> ClusterResult<Vec<NodeStatus>>;

    /// List pods bound to a node, with their disruption scope resolved
    async fn list_pods(&self, node: &str) -> ClusterResult<Vec<PodInfo>>;

    /// Fetch a disruption budget by scope (`namespace/name`)
    async fn get_disruption_budget(&self, scope: &str) -> ClusterResult<DisruptionBudget>;

    /// Mark a node unschedulable; succeeds if already cordoned
    async fn cordon(&self, node: &str) -> ClusterResult<()>;

    /// Evict a pod (`namespace/name`) through the eviction API
    async fn evict(&self, pod: &str) -> ClusterResult<()>;

    /// Delete a node object
    async fn delete_node(&self, node: &str) -> ClusterResult<()>;

    /// Submit a node provisioning request; `Conflict` when it already exists
    async fn create_node(&self, spec: &NodeSpec) -> ClusterResult<String>;

    /// Current status of a node (used for readiness polling)
    async fn get_node_status(&self, node: &str) -> ClusterResult<NodeStatus>;

    /// Remove an annotation from a node; succeeds if absent
    async fn remove_node_annotation(&self, node: &str, key: &str) -> ClusterResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_id_round_trip() {
        assert_eq!(pod_id("kube-system", "dns-0"), "kube-system/dns-0");
        assert_eq!(split_id("kube-system/dns-0"), ("kube-system", "dns-0"));
        assert_eq!(split_id("orphan"), ("default", "orphan"));
    }

    #[test]
    fn test_daemonset_and_mirror_pods_are_not_evictable() {
        let pod = PodInfo {
            daemonset: true,
            phase: PodPhase::Running,
            ..PodInfo::default()
        };
        assert!(!pod.is_evictable());
        assert!(!pod.is_running_workload());

        let pod = PodInfo {
            mirror: true,
            ..PodInfo::default()
        };
        assert!(!pod.is_evictable());
    }

    #[test]
    fn test_finished_pods_are_not_running_workloads() {
        let pod = PodInfo {
            phase: PodPhase::Succeeded,
            ..PodInfo::default()
        };
        assert!(pod.is_evictable());
        assert!(!pod.is_running_workload());
    }

    #[test]
    fn test_not_found_is_not_transient() {
        let err = ClusterError::NotFound {
            kind: "Node",
            name: "n1".to_string(),
        };
        assert!(!err.is_transient());
        let err = ClusterError::Timeout {
            operation: "cordon",
            seconds: 30,
        };
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_elapsed_call() {
        let result: ClusterResult<()> = with_timeout(Duration::from_secs(1), "cordon", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            result,
            Err(ClusterError::Timeout {
                operation: "cordon",
                seconds: 1,
            })
        );
    }
}
