//! # In-Memory Cluster
//!
//! A `ClusterClient` over plain maps, used for local simulation and tests.
//!
//! Evictions honour disruption budgets the way the API server does: an
//! eviction against a budget with no allowed disruptions is refused, and a
//! successful eviction consumes one allowed disruption. Failures and delays
//! can be injected per operation.

use super::{
    ClusterClient, ClusterError, ClusterResult, DisruptionBudget, NodeSpec, NodeStatus, PodInfo,
    PodPhase,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Pod capacity reported by nodes created through `create_node`
const SIMULATED_POD_CAPACITY: u32 = 110;

/// Cluster operations, used to target injected failures and count calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetNode,
    ListNodes,
    ListPods,
    GetDisruptionBudget,
    Cordon,
    Evict,
    DeleteNode,
    CreateNode,
    GetNodeStatus,
    RemoveNodeAnnotation,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, NodeStatus>,
    /// pod id -> (node, pod)
    pods: BTreeMap<String, (String, PodInfo)>,
    budgets: BTreeMap<String, DisruptionBudget>,
    evictions: Vec<String>,
    failures: HashMap<Operation, VecDeque<ClusterError>>,
    persistent_failures: HashMap<Operation, ClusterError>,
    delays: HashMap<Operation, Duration>,
    calls: HashMap<Operation, usize>,
    /// Delayed calls currently sleeping, and the most seen at once
    delayed_in_progress: usize,
    peak_delayed: usize,
    /// Nodes created through `create_node` are Ready immediately
    provision_ready: bool,
}

/// Simulated cluster
#[derive(Debug)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// A schedulable node reporting Ready with capacity
#[must_use]
pub fn ready_node(name: &str) -> NodeStatus {
    NodeStatus {
        name: name.to_string(),
        ready: true,
        ready_known: true,
        unschedulable: false,
        allocatable_pods: SIMULATED_POD_CAPACITY,
        ..NodeStatus::default()
    }
}

/// A running, ready workload pod
#[must_use]
pub fn running_pod(namespace: &str, name: &str) -> PodInfo {
    PodInfo {
        namespace: namespace.to_string(),
        name: name.to_string(),
        phase: PodPhase::Running,
        ready: Some(true),
        ..PodInfo::default()
    }
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                provision_ready: true,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_node(&self, node: NodeStatus) {
        self.state().nodes.insert(node.name.clone(), node);
    }

    pub fn add_pod(&self, node: &str, pod: PodInfo) {
        self.state()
            .pods
            .insert(pod.id(), (node.to_string(), pod));
    }

    pub fn remove_pod(&self, pod: &str) {
        self.state().pods.remove(pod);
    }

    pub fn set_budget(&self, budget: DisruptionBudget) {
        self.state().budgets.insert(budget.scope.clone(), budget);
    }

    /// Whether nodes created by `create_node` start out Ready
    pub fn set_provision_ready(&self, ready: bool) {
        self.state().provision_ready = ready;
    }

    /// Set the Ready condition; a node turning Ready reports pod capacity
    pub fn set_node_ready(&self, node: &str, ready: bool) {
        if let Some(n) = self.state().nodes.get_mut(node) {
            n.ready = ready;
            n.ready_known = true;
            if ready && n.allocatable_pods == 0 {
                n.allocatable_pods = SIMULATED_POD_CAPACITY;
            }
        }
    }

    pub fn set_node_annotation(&self, node: &str, key: &str, value: &str) {
        if let Some(n) = self.state().nodes.get_mut(node) {
            n.annotations.insert(key.to_string(), value.to_string());
        }
    }

    /// Fail the next `times` calls of `operation` with `error`
    pub fn fail_next(&self, operation: Operation, times: usize, error: ClusterError) {
        let mut state = self.state();
        let queue = state.failures.entry(operation).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Fail every call of `operation` until `clear_failures`
    pub fn fail_always(&self, operation: Operation, error: ClusterError) {
        self.state().persistent_failures.insert(operation, error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failures.clear();
        state.persistent_failures.clear();
    }

    /// Delay every call of `operation`, to exercise call timeouts
    pub fn set_delay(&self, operation: Operation, delay: Duration) {
        self.state().delays.insert(operation, delay);
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<NodeStatus> {
        self.state().nodes.get(name).cloned()
    }

    #[must_use]
    pub fn pods_on(&self, node: &str) -> Vec<PodInfo> {
        self.state()
            .pods
            .values()
            .filter(|(n, _)| n == node)
            .map(|(_, p)| p.clone())
            .collect()
    }

    #[must_use]
    pub fn budget(&self, scope: &str) -> Option<DisruptionBudget> {
        self.state().budgets.get(scope).cloned()
    }

    /// Pod ids evicted so far, in eviction order
    #[must_use]
    pub fn evictions(&self) -> Vec<String> {
        self.state().evictions.clone()
    }

    #[must_use]
    pub fn calls(&self, operation: Operation) -> usize {
        self.state().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Most delayed calls that were in progress at the same time
    #[must_use]
    pub fn peak_concurrent_delayed_calls(&self) -> usize {
        self.state().peak_delayed
    }

    /// Count the call, apply any injected delay, then any injected failure
    async fn enter(&self, operation: Operation) -> ClusterResult<()> {
        let delay = {
            let mut state = self.state();
            *state.calls.entry(operation).or_insert(0) += 1;
            let delay = state.delays.get(&operation).copied();
            if delay.is_some() {
                state.delayed_in_progress += 1;
                state.peak_delayed = state.peak_delayed.max(state.delayed_in_progress);
            }
            delay
        };
        if let Some(delay) = delay {
            let _in_progress = DelayedCall(self);
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if let Some(error) = state
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        match state.persistent_failures.get(&operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Leaves the in-progress count when a delayed call ends or is cancelled
struct DelayedCall<'a>(&'a InMemoryCluster);

impl Drop for DelayedCall<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state();
        state.delayed_in_progress = state.delayed_in_progress.saturating_sub(1);
    }
}

fn node_not_found(name: &str) -> ClusterError {
    ClusterError::NotFound {
        kind: "Node",
        name: name.to_string(),
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get_node(&self, node: &str) -> ClusterResult<NodeStatus> {
        self.enter(Operation::GetNode).await?;
        self.node(node).ok_or_else(|| node_not_found(node))
    }

    async fn list_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<NodeStatus>> {
        self.enter(Operation::ListNodes).await?;
        Ok(self
            .state()
            .nodes
            .values()
            .filter(|n| selector.iter().all(|(k, v)| n.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn list_pods(&self, node: &str) -> ClusterResult<Vec<PodInfo>> {
        self.enter(Operation::ListPods).await?;
        Ok(self.pods_on(node))
    }

    async fn get_disruption_budget(&self, scope: &str) -> ClusterResult<DisruptionBudget> {
        self.enter(Operation::GetDisruptionBudget).await?;
        self.budget(scope).ok_or_else(|| ClusterError::NotFound {
            kind: "PodDisruptionBudget",
            name: scope.to_string(),
        })
    }

    async fn cordon(&self, node: &str) -> ClusterResult<()> {
        self.enter(Operation::Cordon).await?;
        let mut state = self.state();
        let n = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| node_not_found(node))?;
        n.unschedulable = true;
        Ok(())
    }

    async fn evict(&self, pod: &str) -> ClusterResult<()> {
        self.enter(Operation::Evict).await?;
        let mut state = self.state();
        let budget_scope = match state.pods.get(pod) {
            Some((_, info)) => info.budget.clone(),
            None => {
                return Err(ClusterError::NotFound {
                    kind: "Pod",
                    name: pod.to_string(),
                })
            }
        };
        if let Some(scope) = budget_scope {
            if let Some(budget) = state.budgets.get_mut(&scope) {
                if budget.disruptions_allowed == 0 {
                    return Err(ClusterError::DisruptionBudget {
                        pod: pod.to_string(),
                        message: format!("cannot evict pod as it would violate {scope}"),
                    });
                }
                budget.disruptions_allowed -= 1;
                budget.current_healthy = budget.current_healthy.saturating_sub(1);
            }
        }
        state.pods.remove(pod);
        state.evictions.push(pod.to_string());
        Ok(())
    }

    async fn delete_node(&self, node: &str) -> ClusterResult<()> {
        self.enter(Operation::DeleteNode).await?;
        let mut state = self.state();
        state
            .nodes
            .remove(node)
            .ok_or_else(|| node_not_found(node))?;
        state.pods.retain(|_, (n, _)| n != node);
        Ok(())
    }

    async fn create_node(&self, spec: &NodeSpec) -> ClusterResult<String> {
        self.enter(Operation::CreateNode).await?;
        let mut state = self.state();
        if state.nodes.contains_key(&spec.name) {
            return Err(ClusterError::Conflict {
                kind: "Node",
                name: spec.name.clone(),
                message: "already exists".to_string(),
            });
        }
        let ready = state.provision_ready;
        state.nodes.insert(
            spec.name.clone(),
            NodeStatus {
                name: spec.name.clone(),
                ready,
                ready_known: ready,
                allocatable_pods: if ready { SIMULATED_POD_CAPACITY } else { 0 },
                labels: spec.labels.clone(),
                created_at: Some(chrono::Utc::now()),
                ..NodeStatus::default()
            },
        );
        Ok(spec.name.clone())
    }

    async fn get_node_status(&self, node: &str) -> ClusterResult<NodeStatus> {
        self.enter(Operation::GetNodeStatus).await?;
        self.node(node).ok_or_else(|| node_not_found(node))
    }

    async fn remove_node_annotation(&self, node: &str, key: &str) -> ClusterResult<()> {
        self.enter(Operation::RemoveNodeAnnotation).await?;
        let mut state = self.state();
        let n = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| node_not_found(node))?;
        n.annotations.remove(key);
        Ok(())
    }
}
