//! # Node Refresh State Machine
//!
//! Drives a single `NodeRefreshRequest` through
//! Pending → Provisioning → Cordoning → Draining → Verifying → Deleting → Completed,
//! or to Failed.
//!
//! Each call to [`NodeRefreshStateMachine::advance`] evaluates exactly one
//! transition attempt and returns when the cluster has answered; it never
//! waits for convergence. "Not ready yet" is reported as a requeue delay.
//!
//! Failure accounting per phase:
//!
//! - API failures consume an attempt and back off; at the attempt ceiling the
//!   request fails.
//! - Call timeouts record `lastError` only: nothing is assumed done and no
//!   attempt is consumed.
//! - A drain blocked by a disruption budget requeues without consuming an
//!   attempt; its own contention counter grows the wait.
//! - Missing input (empty target, target node gone) fails immediately, and so
//!   does a replacement name held by a node that replaces something else.
//! - A request's `drainTimeout` and `readinessTimeout` cap how long it may
//!   wait in Draining and Provisioning, measured from entering the phase.

use crate::cluster::{with_timeout, ClusterClient, ClusterError, NodeSpec, NodeStatus};
use crate::config::ControllerConfig;
use crate::constants::{
    MAX_NODE_NAME_LEN, REPLACEMENT_HASH_LEN, REPLACEMENT_SUFFIX, REPLACES_LABEL,
};
use crate::controller::health::HealthChecker;
use crate::controller::planner::EvictionPlanner;
use crate::controller::request::{NodeRefreshRequest, RefreshPhase};
use crate::controller::retry::RetryPolicy;
use crate::observability::metrics;
use crate::store::StatusStore;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

fn foreign_node(name: &str, target: &str) -> ClusterError {
    ClusterError::Conflict {
        kind: "Node",
        name: name.to_string(),
        message: format!("node exists but does not replace {target}"),
    }
}

/// Labels never copied from the target onto its replacement
const NODE_SPECIFIC_LABELS: &[&str] = &["kubernetes.io/hostname", REPLACES_LABEL];

/// What the caller should do after an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Evaluate again after the delay
    Requeue(Duration),
    /// Request reached Completed or Failed
    Terminal,
}

/// Outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    pub request: NodeRefreshRequest,
    pub next: Next,
}

impl Advance {
    fn requeue(request: NodeRefreshRequest, after: Duration) -> Self {
        Self {
            request,
            next: Next::Requeue(after),
        }
    }

    fn terminal(request: NodeRefreshRequest) -> Self {
        Self {
            request,
            next: Next::Terminal,
        }
    }
}

/// Name of the replacement provisioned for `target`
///
/// Deterministic, so resubmitting the provisioning request is idempotent.
/// `<target>-refresh` when that fits a node name; otherwise the target is
/// shortened and a hash of the full target name keeps replacements of
/// different targets apart. Never equal to `target`.
#[must_use]
pub fn replacement_name(target: &str) -> String {
    let name = format!("{target}{REPLACEMENT_SUFFIX}");
    if name.len() <= MAX_NODE_NAME_LEN {
        return name;
    }
    let name = hashed_replacement_name(target, 0);
    if name == target {
        hashed_replacement_name(target, 1)
    } else {
        name
    }
}

fn hashed_replacement_name(target: &str, salt: u8) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    hasher.update([salt]);
    let digest = format!("{:x}", hasher.finalize());
    let hash = &digest[..REPLACEMENT_HASH_LEN];

    let budget = MAX_NODE_NAME_LEN - REPLACEMENT_SUFFIX.len() - REPLACEMENT_HASH_LEN - 1;
    let mut end = target.len().min(budget);
    while !target.is_char_boundary(end) {
        end -= 1;
    }
    let base = target[..end].trim_end_matches(['-', '.']);
    format!("{base}-{hash}{REPLACEMENT_SUFFIX}")
}

/// Node was provisioned as the replacement of `target`
fn replaces(node: &NodeStatus, target: &str) -> bool {
    node.labels.get(REPLACES_LABEL).map(String::as_str) == Some(target)
}

fn replacement_labels(target: &str, labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = labels
        .iter()
        .filter(|(k, _)| !NODE_SPECIFIC_LABELS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(REPLACES_LABEL.to_string(), target.to_string());
    labels
}

pub struct NodeRefreshStateMachine {
    cluster: Arc<dyn ClusterClient>,
    store: Arc<dyn StatusStore>,
    health: HealthChecker,
    planner: EvictionPlanner,
    retry: RetryPolicy,
    provisioning_poll: Duration,
    call_timeout: Duration,
}

impl fmt::Debug for NodeRefreshStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRefreshStateMachine")
            .field("retry", &self.retry)
            .field("provisioning_poll", &self.provisioning_poll)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl NodeRefreshStateMachine {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        store: Arc<dyn StatusStore>,
        config: &ControllerConfig,
    ) -> Self {
        let call_timeout = config.cluster_call_timeout();
        let health = HealthChecker::new(Arc::clone(&cluster), call_timeout);
        let planner = EvictionPlanner::new(
            Arc::clone(&cluster),
            health.clone(),
            config.max_unbudgeted_evictions,
            call_timeout,
        );
        Self {
            cluster,
            store,
            health,
            planner,
            retry: config.retry_policy(),
            provisioning_poll: config.provisioning_poll_interval(),
            call_timeout,
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Evaluate one transition attempt for `request`
    pub async fn advance(&self, request: NodeRefreshRequest) -> Advance {
        let started = Instant::now();
        let from = request.phase;
        metrics::increment_advances(from.as_str());

        let outcome = match from {
            RefreshPhase::Pending => self.provision(request).await,
            RefreshPhase::Provisioning => self.await_replacement(request).await,
            RefreshPhase::Cordoning => self.cordon(request).await,
            RefreshPhase::Draining => self.drain(request).await,
            RefreshPhase::Verifying => self.verify(request).await,
            RefreshPhase::Deleting => self.delete(request).await,
            RefreshPhase::Completed | RefreshPhase::Failed => Advance::terminal(request),
        };

        let to = outcome.request.phase;
        if to != from {
            metrics::increment_phase_transitions(from.as_str(), to.as_str());
            match to {
                RefreshPhase::Completed => metrics::increment_completed(),
                RefreshPhase::Failed => metrics::increment_failed(),
                _ => {}
            }
            info!(
                node = %outcome.request.target_node_id,
                from = %from,
                to = %to,
                last_error = outcome.request.last_error.as_deref().unwrap_or(""),
                "refresh phase changed"
            );
        }
        metrics::observe_advance_duration(started.elapsed().as_secs_f64());
        outcome
    }

    /// Pending: validate the request and submit the replacement
    async fn provision(&self, mut request: NodeRefreshRequest) -> Advance {
        let now = Utc::now();
        if request.target_node_id.trim().is_empty() {
            request.fail("request has no target node", now);
            return Advance::terminal(request);
        }

        let target = match with_timeout(
            self.call_timeout,
            "get_node",
            self.cluster.get_node(&request.target_node_id),
        )
        .await
        {
            Ok(node) => node,
            Err(ClusterError::NotFound { .. }) => {
                let message = format!("target node {} not found", request.target_node_id);
                request.fail(message, now);
                return Advance::terminal(request);
            }
            Err(e) => return self.retry(request, &e),
        };

        let spec = NodeSpec {
            name: replacement_name(&request.target_node_id),
            labels: replacement_labels(&request.target_node_id, &target.labels),
        };
        match self.submit_replacement(&request.target_node_id, &spec).await {
            Ok(()) => {
                info!(node = %request.target_node_id, replacement = %spec.name, "replacement requested");
                request.enter(RefreshPhase::Provisioning, now);
                Advance::requeue(request, Duration::ZERO)
            }
            Err(e @ ClusterError::Conflict { .. }) => {
                request.fail(e.to_string(), now);
                Advance::terminal(request)
            }
            Err(e) => self.retry(request, &e),
        }
    }

    /// Create the replacement
    ///
    /// An existing node counts as submitted only when it replaces `target`;
    /// any other holder of the name is returned as `Conflict`.
    async fn submit_replacement(&self, target: &str, spec: &NodeSpec) -> Result<(), ClusterError> {
        match with_timeout(self.call_timeout, "create_node", self.cluster.create_node(spec)).await {
            Ok(_) => Ok(()),
            Err(ClusterError::Conflict { .. }) => {
                let existing = with_timeout(
                    self.call_timeout,
                    "get_node",
                    self.cluster.get_node(&spec.name),
                )
                .await?;
                if replaces(&existing, target) {
                    debug!(node = %target, replacement = %spec.name, "replacement already submitted");
                    Ok(())
                } else {
                    Err(foreign_node(&spec.name, target))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Provisioning: poll the replacement until it is Ready with capacity
    async fn await_replacement(&self, mut request: NodeRefreshRequest) -> Advance {
        let name = replacement_name(&request.target_node_id);
        match with_timeout(
            self.call_timeout,
            "get_node_status",
            self.cluster.get_node_status(&name),
        )
        .await
        {
            Ok(status) if !replaces(&status, &request.target_node_id) => {
                let error = foreign_node(&name, &request.target_node_id);
                request.fail(error.to_string(), Utc::now());
                Advance::terminal(request)
            }
            Ok(status) if self.health.is_replacement_ready(&status) => {
                request.replacement_node_id = name;
                request.enter(RefreshPhase::Cordoning, Utc::now());
                Advance::requeue(request, Duration::ZERO)
            }
            Ok(_) => {
                let now = Utc::now();
                if let Some(limit) = request.limits.readiness_timeout() {
                    if request.time_in_phase(now) >= limit {
                        let message = format!(
                            "replacement {name} not ready within {}s",
                            limit.as_secs()
                        );
                        request.fail(message, now);
                        return Advance::terminal(request);
                    }
                }
                debug!(node = %request.target_node_id, replacement = %name, "replacement not ready yet");
                Advance::requeue(request, self.provisioning_poll)
            }
            Err(ClusterError::NotFound { .. }) => {
                // replacement object vanished; resubmit, creation is idempotent
                let spec = NodeSpec {
                    name,
                    labels: BTreeMap::from([(
                        REPLACES_LABEL.to_string(),
                        request.target_node_id.clone(),
                    )]),
                };
                match self.submit_replacement(&request.target_node_id, &spec).await {
                    Ok(()) => Advance::requeue(request, self.provisioning_poll),
                    Err(e @ ClusterError::Conflict { .. }) => {
                        request.fail(e.to_string(), Utc::now());
                        Advance::terminal(request)
                    }
                    Err(e) => self.retry(request, &e),
                }
            }
            Err(e) => self.retry(request, &e),
        }
    }

    /// Cordoning: mark the target unschedulable
    async fn cordon(&self, mut request: NodeRefreshRequest) -> Advance {
        match with_timeout(
            self.call_timeout,
            "cordon",
            self.cluster.cordon(&request.target_node_id),
        )
        .await
        {
            Ok(()) => {
                request.enter(RefreshPhase::Draining, Utc::now());
                Advance::requeue(request, Duration::ZERO)
            }
            Err(e @ ClusterError::NotFound { .. }) => {
                request.fail(e.to_string(), Utc::now());
                Advance::terminal(request)
            }
            Err(e) => self.retry(request, &e),
        }
    }

    /// Draining: evict planned batches, persisting each eviction
    async fn drain(&self, mut request: NodeRefreshRequest) -> Advance {
        let plan = match self
            .planner
            .plan(
                &request.target_node_id,
                &request.drained_pods,
                &request.limits,
            )
            .await
        {
            Ok(plan) => plan,
            Err(e) => return self.retry(request, &e),
        };

        if plan.is_empty() {
            request.enter(RefreshPhase::Verifying, Utc::now());
            return Advance::requeue(request, Duration::ZERO);
        }

        let mut blocked = plan.blocked.first().map(|b| b.scope.to_string());
        'batches: for batch in &plan.batches {
            if !self
                .health
                .admits(&batch.scope, request.limits.min_healthy_pods)
                .await
            {
                blocked = Some(batch.scope.to_string());
                break;
            }
            for pod in &batch.pods {
                match with_timeout(self.call_timeout, "evict", self.cluster.evict(pod)).await {
                    Ok(()) | Err(ClusterError::NotFound { .. }) => {
                        request.drained_pods.insert(pod.clone());
                        request.contention = 0;
                        request.updated_at = Utc::now();
                        metrics::increment_evictions();
                        debug!(node = %request.target_node_id, pod = %pod, "pod evicted");
                        if let Err(e) = self.store.save(&request).await {
                            warn!(node = %request.target_node_id, error = %e, "failed to persist drain progress");
                            let delay = self.retry.next_delay(request.attempt);
                            request.record_error(e.to_string(), Utc::now());
                            return Advance::requeue(request, delay);
                        }
                    }
                    Err(ClusterError::DisruptionBudget { .. }) => {
                        blocked = Some(batch.scope.to_string());
                        break 'batches;
                    }
                    Err(e) => return self.retry(request, &e),
                }
            }
        }

        if let Some(scope) = blocked {
            metrics::increment_drain_blocked();
            let now = Utc::now();
            if let Some(limit) = request.limits.drain_timeout() {
                if request.time_in_phase(now) >= limit {
                    let message = format!(
                        "drain still blocked by {scope} after {}s",
                        limit.as_secs()
                    );
                    request.fail(message, now);
                    return Advance::terminal(request);
                }
            }
            let delay = self.retry.next_delay(request.contention);
            info!(
                node = %request.target_node_id,
                scope = %scope,
                contention = request.contention,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "drain blocked by disruption budget"
            );
            request.record_contention(format!("drain blocked by {scope}"), now);
            return Advance::requeue(request, delay);
        }

        if !plan.held.is_empty() {
            let message = format!(
                "{} pod(s) not healthy to evict: {}",
                plan.held.len(),
                plan.held.join(", ")
            );
            return self.retry_with_message(request, message);
        }

        // everything planned was evicted; the next evaluation re-plans
        Advance::requeue(request, Duration::ZERO)
    }

    /// Verifying: target empty of workloads and replacement healthy
    async fn verify(&self, mut request: NodeRefreshRequest) -> Advance {
        if !request.has_replacement() {
            request.fail("no replacement node recorded", Utc::now());
            return Advance::terminal(request);
        }

        let pods = match with_timeout(
            self.call_timeout,
            "list_pods",
            self.cluster.list_pods(&request.target_node_id),
        )
        .await
        {
            Ok(pods) => pods,
            Err(e) => return self.retry(request, &e),
        };
        let running: Vec<String> = pods
            .iter()
            .filter(|p| p.is_running_workload())
            .map(crate::cluster::PodInfo::id)
            .collect();

        let replacement_ready = match with_timeout(
            self.call_timeout,
            "get_node_status",
            self.cluster.get_node_status(&request.replacement_node_id),
        )
        .await
        {
            Ok(status) => self.health.is_replacement_ready(&status),
            Err(ClusterError::NotFound { .. }) => false,
            Err(e) => return self.retry(request, &e),
        };

        if running.is_empty() && replacement_ready {
            request.enter(RefreshPhase::Deleting, Utc::now());
            return Advance::requeue(request, Duration::ZERO);
        }

        let message = if running.is_empty() {
            format!(
                "replacement {} is not ready and schedulable",
                request.replacement_node_id
            )
        } else {
            format!(
                "{} pod(s) still running on target: {}",
                running.len(),
                running.join(", ")
            )
        };
        self.retry_with_message(request, message)
    }

    /// Deleting: remove the drained target
    async fn delete(&self, mut request: NodeRefreshRequest) -> Advance {
        if !request.has_replacement() {
            request.fail("no replacement node recorded", Utc::now());
            return Advance::terminal(request);
        }
        match with_timeout(
            self.call_timeout,
            "delete_node",
            self.cluster.delete_node(&request.target_node_id),
        )
        .await
        {
            Ok(()) | Err(ClusterError::NotFound { .. }) => {
                request.enter(RefreshPhase::Completed, Utc::now());
                Advance::terminal(request)
            }
            Err(e) => self.retry(request, &e),
        }
    }

    /// Handle a failed cluster call according to its class
    fn retry(&self, mut request: NodeRefreshRequest, error: &ClusterError) -> Advance {
        if let ClusterError::Timeout { .. } = error {
            let delay = self.retry.next_delay(request.attempt);
            warn!(node = %request.target_node_id, phase = %request.phase, error = %error, "cluster call timed out");
            request.record_error(error.to_string(), Utc::now());
            return Advance::requeue(request, delay);
        }
        self.retry_with_message(request, error.to_string())
    }

    /// Consume an attempt; fail once the ceiling is reached
    fn retry_with_message(&self, mut request: NodeRefreshRequest, message: String) -> Advance {
        let delay = self.retry.next_delay(request.attempt);
        let now = Utc::now();
        request.record_attempt(message, now);
        if self.retry.is_exhausted(request.attempt) {
            let reason = format!(
                "{} gave up after {} attempts: {}",
                request.phase,
                request.attempt,
                request.last_error.as_deref().unwrap_or("unknown error")
            );
            request.fail(reason, now);
            return Advance::terminal(request);
        }
        warn!(
            node = %request.target_node_id,
            phase = %request.phase,
            attempt = request.attempt,
            error = request.last_error.as_deref().unwrap_or(""),
            "refresh step failed, retrying"
        );
        Advance::requeue(request, delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replacement_name_is_deterministic_and_bounded() {
        assert_eq!(replacement_name("worker-1"), "worker-1-refresh");
        let long = "a".repeat(80);
        let name = replacement_name(&long);
        assert_eq!(name, replacement_name(&long));
        assert_eq!(name.len(), MAX_NODE_NAME_LEN);
        assert!(name.ends_with(REPLACEMENT_SUFFIX));

        let dashed = format!("{}-{}", "b".repeat(45), "c".repeat(20));
        assert!(!replacement_name(&dashed).contains("--"));
    }

    #[test]
    fn test_shortened_names_keep_targets_apart() {
        let prefix = "x".repeat(60);
        let a = replacement_name(&format!("{prefix}-a"));
        let b = replacement_name(&format!("{prefix}-b"));
        assert_ne!(a, b);
        assert!(a.len() <= MAX_NODE_NAME_LEN && b.len() <= MAX_NODE_NAME_LEN);
    }

    #[test]
    fn test_replacement_name_never_equals_target() {
        // a third-generation name of a long cloud node name
        let target = format!("{}{REPLACEMENT_SUFFIX}", "y".repeat(55));
        assert_eq!(target.len(), MAX_NODE_NAME_LEN);
        assert_ne!(replacement_name(&target), target);

        // a target shaped exactly like its own hashed replacement
        let hashed = hashed_replacement_name(&target, 0);
        assert_ne!(replacement_name(&hashed), hashed);

        let base = "z".repeat(MAX_NODE_NAME_LEN - REPLACEMENT_SUFFIX.len());
        assert_ne!(replacement_name(&base), base);
    }

    #[test]
    fn test_replacement_labels_drop_hostname() {
        let labels = BTreeMap::from([
            ("kubernetes.io/hostname".to_string(), "n1".to_string()),
            ("node-pool".to_string(), "workers".to_string()),
        ]);
        let copied = replacement_labels("n1", &labels);
        assert_eq!(copied.get("node-pool").map(String::as_str), Some("workers"));
        assert_eq!(copied.get(REPLACES_LABEL).map(String::as_str), Some("n1"));
        assert!(!copied.contains_key("kubernetes.io/hostname"));
    }
}
