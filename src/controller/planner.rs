//! # Eviction Planner
//!
//! Computes the batches in which the pods of a draining node may be evicted
//! without exceeding any disruption budget. A plan is computed fresh for
//! every drain evaluation since budget state changes outside the controller.
//!
//! Ordering is deterministic: batches follow the scope key, and pods within
//! a batch are in ascending id order.

use crate::cluster::{with_timeout, ClusterClient, ClusterResult};
use crate::controller::health::{headroom, DisruptionScope, HealthChecker};
use crate::controller::request::RefreshLimits;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Pods that may be evicted together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionBatch {
    pub scope: DisruptionScope,
    pub pods: Vec<String>,
}

/// Pods whose scope admits no disruption right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedScope {
    pub scope: DisruptionScope,
    pub pods: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub batches: Vec<EvictionBatch>,
    pub blocked: Vec<BlockedScope>,
    /// Pods not yet healthy to evict
    pub held: Vec<String>,
}

impl EvictionPlan {
    /// Nothing left to evict on the node
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty() && self.blocked.is_empty() && self.held.is_empty()
    }

    /// Pods still to be evicted, planned or not
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.batches.iter().map(|b| b.pods.len()).sum::<usize>()
            + self.blocked.iter().map(|b| b.pods.len()).sum::<usize>()
            + self.held.len()
    }
}

#[derive(Clone)]
pub struct EvictionPlanner {
    cluster: Arc<dyn ClusterClient>,
    health: HealthChecker,
    max_unbudgeted_batch: usize,
    call_timeout: Duration,
}

impl fmt::Debug for EvictionPlanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictionPlanner")
            .field("max_unbudgeted_batch", &self.max_unbudgeted_batch)
            .finish_non_exhaustive()
    }
}

impl EvictionPlanner {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        health: HealthChecker,
        max_unbudgeted_batch: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            health,
            max_unbudgeted_batch: max_unbudgeted_batch.max(1),
            call_timeout,
        }
    }

    /// Plan the eviction of every pod on `node` not in `already_drained`
    ///
    /// DaemonSet and mirror pods, finished pods and pods already terminating
    /// are left out. `limits` caps every batch at `maxPodsToMove` and keeps
    /// `minHealthyPods` healthy per budget. Fails only when the pods on the
    /// node cannot be listed.
    pub async fn plan(
        &self,
        node: &str,
        already_drained: &BTreeSet<String>,
        limits: &RefreshLimits,
    ) -> ClusterResult<EvictionPlan> {
        let pods = with_timeout(self.call_timeout, "list_pods", self.cluster.list_pods(node)).await?;

        let mut plan = EvictionPlan::default();
        let mut scopes: BTreeMap<String, (DisruptionScope, Vec<String>)> = BTreeMap::new();
        for pod in pods {
            if !pod.is_evictable() || pod.phase.is_finished() || pod.terminating {
                continue;
            }
            let id = pod.id();
            if already_drained.contains(&id) {
                continue;
            }
            if !self.health.is_healthy_to_evict(&pod) {
                plan.held.push(id);
                continue;
            }
            let scope = DisruptionScope::for_pod(&pod);
            scopes
                .entry(scope.key())
                .or_insert_with(|| (scope, Vec::new()))
                .1
                .push(id);
        }
        plan.held.sort();

        let max_batch = limits
            .max_pods_to_move
            .and_then(|n| usize::try_from(n.max(1)).ok());
        for (scope, mut pods) in scopes.into_values() {
            pods.sort();
            let batch_size = match &scope {
                DisruptionScope::Unbudgeted(_) => max_batch.unwrap_or(self.max_unbudgeted_batch),
                DisruptionScope::Budget(name) => self
                    .allowed_disruptions(name, limits.min_healthy_pods)
                    .await
                    .min(max_batch.unwrap_or(usize::MAX)),
            };
            if batch_size == 0 {
                plan.blocked.push(BlockedScope { scope, pods });
                continue;
            }
            plan.batches.extend(pods.chunks(batch_size).map(|chunk| EvictionBatch {
                scope: scope.clone(),
                pods: chunk.to_vec(),
            }));
        }

        debug!(
            node = %node,
            batches = plan.batches.len(),
            blocked = plan.blocked.len(),
            held = plan.held.len(),
            "eviction plan computed"
        );
        Ok(plan)
    }

    /// Allowed disruptions of a budget; an unreadable budget allows none
    async fn allowed_disruptions(&self, scope: &str, min_healthy: Option<u32>) -> usize {
        match with_timeout(
            self.call_timeout,
            "get_disruption_budget",
            self.cluster.get_disruption_budget(scope),
        )
        .await
        {
            Ok(budget) => usize::try_from(headroom(&budget, min_healthy)).unwrap_or(usize::MAX),
            Err(e) => {
                debug!(scope = %scope, error = %e, "disruption budget unreadable");
                0
            }
        }
    }
}
