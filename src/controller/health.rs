//! # Health Checker
//!
//! Read-only checks gating eviction and replacement. Missing or unknown
//! health data is always treated as "not yet healthy".

use crate::cluster::{with_timeout, ClusterClient, DisruptionBudget, NodeStatus, PodInfo, PodPhase};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Disruption scope a pod belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DisruptionScope {
    /// Pods covered by a disruption budget (`namespace/name`)
    Budget(String),
    /// Pods in a namespace with no covering budget
    Unbudgeted(String),
}

impl DisruptionScope {
    #[must_use]
    pub fn for_pod(pod: &PodInfo) -> Self {
        match &pod.budget {
            Some(budget) => DisruptionScope::Budget(budget.clone()),
            None => DisruptionScope::Unbudgeted(pod.namespace.clone()),
        }
    }

    /// Stable key used to order batches
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            DisruptionScope::Budget(scope) => scope.clone(),
            DisruptionScope::Unbudgeted(namespace) => format!("{namespace}/*"),
        }
    }
}

impl fmt::Display for DisruptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisruptionScope::Budget(scope) => write!(f, "budget {scope}"),
            DisruptionScope::Unbudgeted(namespace) => write!(f, "unbudgeted pods in {namespace}"),
        }
    }
}

/// Disruptions a budget admits, keeping at least `min_healthy` pods healthy
#[must_use]
pub fn headroom(budget: &DisruptionBudget, min_healthy: Option<u32>) -> u32 {
    match min_healthy {
        Some(floor) => budget
            .disruptions_allowed
            .min(budget.current_healthy.saturating_sub(floor)),
        None => budget.disruptions_allowed,
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    cluster: Arc<dyn ClusterClient>,
    call_timeout: Duration,
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl HealthChecker {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterClient>, call_timeout: Duration) -> Self {
        Self {
            cluster,
            call_timeout,
        }
    }

    /// A pod may be evicted once it is Running and reports Ready
    #[must_use]
    pub fn is_healthy_to_evict(&self, pod: &PodInfo) -> bool {
        pod.phase == PodPhase::Running && pod.ready == Some(true)
    }

    /// Whether the scope has headroom for at least one more disruption
    ///
    /// Unbudgeted scopes always admit. A budget that cannot be read admits
    /// nothing.
    pub async fn can_admit_disruption(&self, scope: &DisruptionScope) -> bool {
        self.admits(scope, None).await
    }

    /// [`Self::can_admit_disruption`] with a healthy-pod floor on top of the
    /// budget's own allowance
    pub async fn admits(&self, scope: &DisruptionScope, min_healthy: Option<u32>) -> bool {
        let DisruptionScope::Budget(name) = scope else {
            return true;
        };
        match with_timeout(
            self.call_timeout,
            "get_disruption_budget",
            self.cluster.get_disruption_budget(name),
        )
        .await
        {
            Ok(budget) => headroom(&budget, min_healthy) > 0,
            Err(e) => {
                debug!(scope = %name, error = %e, "disruption budget unreadable, not admitting");
                false
            }
        }
    }

    /// Replacement is Ready, schedulable and has registered pod capacity
    #[must_use]
    pub fn is_replacement_ready(&self, node: &NodeStatus) -> bool {
        node.ready && node.ready_known && !node.unschedulable && node.allocatable_pods > 0
    }
}
