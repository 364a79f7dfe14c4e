//! # NodeRefresh Spec
//!
//! Main CRD specification types and default values.

use crate::constants::{
    DEFAULT_DRAIN_TIMEOUT_SECS, DEFAULT_INTERVAL_DAYS, DEFAULT_MAX_PODS_TO_MOVE,
    DEFAULT_MIN_HEALTHY_PODS, DEFAULT_READINESS_TIMEOUT_SECS,
};
use crate::controller::request::RefreshLimits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// NodeRefresh Custom Resource Definition
///
/// Selects a set of nodes and replaces each of them with a freshly
/// provisioned node once it has been running for `intervalDays`.
///
/// # Example
///
/// ```yaml
/// apiVersion: operations.example.com/v1alpha1
/// kind: NodeRefresh
/// metadata:
///   name: workers
/// spec:
///   targetNodes:
///     selector:
///       node-pool: workers
///     maxConcurrentNodes: 1
///   podManagement:
///     maxPodsToMove: 3
///     minHealthyPods: 2
///     drainTimeout: 600
///   schedule:
///     enabled: true
///     intervalDays: 3
///   healthChecks:
///     readinessTimeout: 300
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "NodeRefresh",
    group = "operations.example.com",
    version = "v1alpha1",
    status = "crate::crd::NodeRefreshStatus",
    shortname = "nr",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Message", "type":"string", "jsonPath":".status.message"}, {"name":"Next Refresh", "type":"string", "jsonPath":".status.nextRefreshTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeRefreshSpec {
    /// Nodes to refresh
    pub target_nodes: TargetNodes,
    /// How pods are moved off a refreshed node
    #[serde(default)]
    pub pod_management: PodManagement,
    /// Refresh cadence
    #[serde(default)]
    pub schedule: ScheduleSpec,
    /// Replacement readiness checks
    #[serde(default)]
    pub health_checks: HealthChecks,
    /// Suspend refreshes
    /// When true no new refresh is started for the selected nodes; refreshes
    /// already in progress run to completion
    #[serde(default = "default_false")]
    pub suspend: bool,
}

/// Node selection
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetNodes {
    /// Label selector (`key: value` pairs, all must match)
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    /// Nodes refreshed at the same time
    #[serde(default = "default_max_concurrent_nodes")]
    #[schemars(range(min = 1, max = 10))]
    pub max_concurrent_nodes: u32,
}

/// Pod eviction limits
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodManagement {
    /// Pods evicted together at most
    #[serde(default = "default_max_pods_to_move")]
    #[schemars(range(min = 1))]
    pub max_pods_to_move: u32,
    /// Healthy pods each disruption budget keeps while a node drains
    #[serde(default = "default_min_healthy_pods")]
    #[schemars(range(min = 1))]
    pub min_healthy_pods: u32,
    /// Seconds a drain may stay blocked by disruption budgets before the
    /// refresh fails
    #[serde(default = "default_drain_timeout")]
    #[schemars(range(min = 60))]
    pub drain_timeout: u64,
}

impl Default for PodManagement {
    fn default() -> Self {
        Self {
            max_pods_to_move: default_max_pods_to_move(),
            min_healthy_pods: default_min_healthy_pods(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

/// Replacement readiness checks
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthChecks {
    /// Seconds a replacement may take to become Ready before the refresh fails
    #[serde(default = "default_readiness_timeout")]
    #[schemars(range(min = 10))]
    pub readiness_timeout: u64,
}

impl Default for HealthChecks {
    fn default() -> Self {
        Self {
            readiness_timeout: default_readiness_timeout(),
        }
    }
}

/// Refresh schedule
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    /// Refresh nodes automatically once they reach `intervalDays` of age
    /// When false only manual refreshes (node annotation) are started
    #[serde(default = "default_false")]
    pub enabled: bool,
    /// Age in days at which a node is due for refresh
    #[serde(default = "default_interval_days")]
    #[schemars(range(min = 1))]
    pub interval_days: u32,
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self {
            enabled: default_false(),
            interval_days: default_interval_days(),
        }
    }
}

impl NodeRefreshSpec {
    /// `maxConcurrentNodes` clamped to its valid range
    #[must_use]
    pub fn max_concurrent_nodes(&self) -> usize {
        usize::try_from(self.target_nodes.max_concurrent_nodes.clamp(1, 10)).unwrap_or(1)
    }

    /// Node age at which a refresh is due
    #[must_use]
    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.schedule.interval_days.max(1)))
    }

    /// Limits carried by every refresh this policy starts, raised to the
    /// schema minimums
    #[must_use]
    pub fn refresh_limits(&self) -> RefreshLimits {
        RefreshLimits {
            max_pods_to_move: Some(self.pod_management.max_pods_to_move.max(1)),
            min_healthy_pods: Some(self.pod_management.min_healthy_pods.max(1)),
            drain_timeout_secs: Some(self.pod_management.drain_timeout.max(60)),
            readiness_timeout_secs: Some(self.health_checks.readiness_timeout.max(10)),
        }
    }
}

/// Default value for boolean fields that default to false
#[must_use]
pub fn default_false() -> bool {
    false
}

#[must_use]
pub fn default_max_concurrent_nodes() -> u32 {
    1
}

#[must_use]
pub fn default_interval_days() -> u32 {
    DEFAULT_INTERVAL_DAYS
}

#[must_use]
pub fn default_max_pods_to_move() -> u32 {
    DEFAULT_MAX_PODS_TO_MOVE
}

#[must_use]
pub fn default_min_healthy_pods() -> u32 {
    DEFAULT_MIN_HEALTHY_PODS
}

#[must_use]
pub fn default_drain_timeout() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}

#[must_use]
pub fn default_readiness_timeout() -> u64 {
    DEFAULT_READINESS_TIMEOUT_SECS
}
