//! Common test utilities for refresh engine integration tests
//!
//! Builds an in-memory cluster, an in-memory status store and a state
//! machine over both, with a retry policy that has no jitter so attempt
//! accounting is deterministic.
#![allow(dead_code, reason = "not every test binary uses every helper")]

use node_refresh_controller::cluster::memory::{ready_node, running_pod};
use node_refresh_controller::cluster::{
    ClusterClient, DisruptionBudget, InMemoryCluster, NodeStatus, PodInfo,
};
use node_refresh_controller::config::ControllerConfig;
use node_refresh_controller::controller::request::{NodeRefreshRequest, RefreshPhase};
use node_refresh_controller::controller::state_machine::{Advance, Next, NodeRefreshStateMachine};
use node_refresh_controller::store::{MemoryStatusStore, StatusStore};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const TARGET: &str = "worker-1";
pub const REPLACEMENT: &str = "worker-1-refresh";
pub const WEB_BUDGET: &str = "default/web";

/// Upper bound on evaluations before a scenario is considered stuck
pub const MAX_STEPS: usize = 50;

/// Configuration with three attempts per phase and no jitter
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        retry_base_ms: 10,
        retry_max_secs: 1,
        retry_max_attempts: 3,
        retry_jitter: 0.0,
        provisioning_poll_secs: 1,
        cluster_call_timeout_secs: 5,
        resync_interval_secs: 1,
        reconciliation_error_requeue_secs: 1,
        max_concurrent_reconciliations: 2,
        ..ControllerConfig::default()
    }
}

pub struct Harness {
    pub cluster: Arc<InMemoryCluster>,
    pub store: Arc<MemoryStatusStore>,
    pub config: ControllerConfig,
}

impl Harness {
    /// Cluster with a single Ready target node in the `workers` pool
    pub fn new() -> Self {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_node(worker(TARGET));
        Self {
            cluster,
            store: Arc::new(MemoryStatusStore::new()),
            config: test_config(),
        }
    }

    pub fn cluster_client(&self) -> Arc<dyn ClusterClient> {
        Arc::clone(&self.cluster) as Arc<dyn ClusterClient>
    }

    pub fn status_store(&self) -> Arc<dyn StatusStore> {
        Arc::clone(&self.store) as Arc<dyn StatusStore>
    }

    /// A fresh state machine, as built by a newly started controller
    pub fn machine(&self) -> NodeRefreshStateMachine {
        NodeRefreshStateMachine::new(self.cluster_client(), self.status_store(), &self.config)
    }

    /// Pods `web-0..web-{count}` on the target, covered by one budget
    pub fn add_budgeted_pods(&self, count: usize, allowed: u32) {
        for i in 0..count {
            self.cluster
                .add_pod(TARGET, budgeted_pod(&format!("web-{i}")));
        }
        self.set_web_budget(allowed);
    }

    pub fn set_web_budget(&self, allowed: u32) {
        self.cluster.set_budget(DisruptionBudget {
            scope: WEB_BUDGET.to_string(),
            disruptions_allowed: allowed,
            current_healthy: 3,
            desired_healthy: 2,
        });
    }
}

pub fn worker(name: &str) -> NodeStatus {
    NodeStatus {
        labels: BTreeMap::from([
            ("node-pool".to_string(), "workers".to_string()),
            ("kubernetes.io/hostname".to_string(), name.to_string()),
        ]),
        ..ready_node(name)
    }
}

pub fn budgeted_pod(name: &str) -> PodInfo {
    PodInfo {
        budget: Some(WEB_BUDGET.to_string()),
        ..running_pod("default", name)
    }
}

/// Advance once and persist the result, as the reconciliation loop does
pub async fn step(
    machine: &NodeRefreshStateMachine,
    store: &MemoryStatusStore,
    request: NodeRefreshRequest,
) -> Advance {
    let advance = machine.advance(request).await;
    store
        .save(&advance.request)
        .await
        .expect("in-memory save should succeed");
    advance
}

/// Advance until `phase` is reached or the request is terminal
pub async fn drive_to(
    machine: &NodeRefreshStateMachine,
    store: &MemoryStatusStore,
    mut request: NodeRefreshRequest,
    phase: RefreshPhase,
) -> NodeRefreshRequest {
    for _ in 0..MAX_STEPS {
        if request.phase == phase || request.is_terminal() {
            return request;
        }
        request = step(machine, store, request).await.request;
    }
    panic!("request stuck in {:?} before reaching {phase:?}", request.phase);
}

/// Advance until terminal, returning the request and every phase visited
pub async fn drive_to_end(
    machine: &NodeRefreshStateMachine,
    store: &MemoryStatusStore,
    mut request: NodeRefreshRequest,
) -> (NodeRefreshRequest, Vec<RefreshPhase>) {
    let mut phases = vec![request.phase];
    for _ in 0..MAX_STEPS {
        let Advance { request: next, next: outcome } = step(machine, store, request).await;
        request = next;
        if phases.last() != Some(&request.phase) {
            phases.push(request.phase);
        }
        if outcome == Next::Terminal {
            return (request, phases);
        }
    }
    panic!("request did not finish, last phase {:?}", request.phase);
}

