//! # Policy Evaluation
//!
//! Decides which selected nodes a `NodeRefresh` starts refreshing and
//! summarises progress for its status.
//!
//! Evaluation is split in two: [`evaluate`] reads nodes, active requests and
//! history, and [`plan`] is the pure decision over that snapshot.
//!
//! - Suspended policies start nothing.
//! - Nodes annotated with the refresh-now annotation get a manual trigger
//!   regardless of schedule or concurrency.
//! - With the schedule enabled, due nodes (see [`ScheduleTable`]) get a
//!   schedule trigger while fewer than `maxConcurrentNodes` selected nodes
//!   are refreshing.

use crate::cluster::{with_timeout, ClusterClient, NodeStatus};
use crate::config::ControllerConfig;
use crate::constants::REFRESH_NOW_ANNOTATION;
use crate::controller::reconciler::types::ReconcilerError;
use crate::controller::request::{NodeRefreshRequest, RefreshLimits, RefreshPhase};
use crate::controller::schedule::ScheduleTable;
use crate::controller::trigger::{TriggerEvent, TriggerSource};
use crate::crd::{FailedNode, NodeRefreshSpec, NodeRefreshStatus, PolicyPhase};
use crate::store::StatusStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;

/// Inputs of one evaluation that do not come from the cluster
#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub now: DateTime<Utc>,
    pub failed_retry: chrono::Duration,
    pub resync: Duration,
    pub call_timeout: Duration,
}

impl PolicySettings {
    #[must_use]
    pub fn from_config(config: &ControllerConfig, now: DateTime<Utc>) -> Self {
        Self {
            now,
            failed_retry: chrono::Duration::from_std(config.failed_retry_interval())
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            resync: config.resync_interval(),
            call_timeout: config.cluster_call_timeout(),
        }
    }
}

/// Outcome of evaluating a `NodeRefresh`
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyEvaluation {
    /// Nodes carrying the refresh-now annotation
    pub manual: Vec<String>,
    /// Due nodes started by the schedule
    pub scheduled: Vec<String>,
    pub phase: PolicyPhase,
    /// Status without conditions or generation
    pub status: NodeRefreshStatus,
    pub requeue_after: Duration,
    /// Limits handed to every refresh started by this evaluation
    pub limits: RefreshLimits,
}

impl PolicyEvaluation {
    /// Trigger events to send to the reconciliation loop
    #[must_use]
    pub fn triggers(&self) -> Vec<TriggerEvent> {
        self.manual
            .iter()
            .map(|node| TriggerEvent::new(node.as_str(), TriggerSource::Manual))
            .chain(
                self.scheduled
                    .iter()
                    .map(|node| TriggerEvent::new(node.as_str(), TriggerSource::Schedule)),
            )
            .map(|event| event.with_limits(self.limits))
            .collect()
    }
}

/// Read the snapshot a `NodeRefresh` is evaluated against and plan over it
///
/// # Errors
///
/// Fails when nodes cannot be listed or the status store cannot be read.
pub async fn evaluate(
    spec: &NodeRefreshSpec,
    cluster: &dyn ClusterClient,
    store: &dyn StatusStore,
    settings: &PolicySettings,
) -> Result<PolicyEvaluation, ReconcilerError> {
    let nodes = with_timeout(
        settings.call_timeout,
        "list_nodes",
        cluster.list_nodes(&spec.target_nodes.selector),
    )
    .await?;
    let active = store.list_active().await?;
    let history = store.history().await?;
    Ok(plan(spec, &nodes, &active, &history, settings))
}

/// Decide triggers and status for a snapshot
#[must_use]
pub fn plan(
    spec: &NodeRefreshSpec,
    nodes: &[NodeStatus],
    active: &[NodeRefreshRequest],
    history: &[NodeRefreshRequest],
    settings: &PolicySettings,
) -> PolicyEvaluation {
    let now = settings.now;
    let selected: BTreeSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    let active_nodes: BTreeSet<String> =
        active.iter().map(|r| r.target_node_id.clone()).collect();
    let refreshing: BTreeSet<String> = active
        .iter()
        .filter(|r| !r.is_terminal() && selected.contains(r.target_node_id.as_str()))
        .map(|r| r.target_node_id.clone())
        .collect();

    let table = ScheduleTable::build(
        nodes,
        &active_nodes,
        history,
        now,
        spec.interval(),
        settings.failed_retry,
    );
    let due = table.due(now);
    let schedule_on = spec.schedule.enabled && !spec.suspend;

    let mut manual = Vec::new();
    let mut scheduled = Vec::new();
    if !spec.suspend {
        manual = nodes
            .iter()
            .filter(|n| n.annotations.contains_key(REFRESH_NOW_ANNOTATION))
            .map(|n| n.name.clone())
            .collect();
        manual.sort();
    }
    if schedule_on {
        let starting = manual.iter().filter(|n| !active_nodes.contains(*n)).count();
        let slots = spec
            .max_concurrent_nodes()
            .saturating_sub(refreshing.len() + starting);
        scheduled = due
            .iter()
            .filter(|n| !manual.iter().any(|m| m == *n))
            .take(slots)
            .map(|n| (*n).to_string())
            .collect();
    }

    let mut current: BTreeSet<String> = refreshing;
    current.extend(manual.iter().cloned());
    current.extend(scheduled.iter().cloned());

    let phase = if spec.suspend {
        PolicyPhase::Suspended
    } else if current.is_empty() {
        PolicyPhase::Idle
    } else {
        PolicyPhase::Running
    };

    // due nodes left waiting for a free slot
    let waiting = due
        .iter()
        .filter(|n| !current.contains(**n))
        .count();
    let next_refresh = if !schedule_on {
        None
    } else if waiting > 0 {
        Some(now)
    } else {
        table.next_due(now)
    };

    let message = match phase {
        PolicyPhase::Suspended => {
            "Suspended; refreshes already in progress run to completion".to_string()
        }
        _ => format!(
            "{} of {} selected nodes refreshing, {} waiting",
            current.len(),
            nodes.len(),
            waiting
        ),
    };

    let processed_nodes = dedup(
        history
            .iter()
            .filter(|r| r.phase == RefreshPhase::Completed)
            .filter(|r| {
                selected.contains(r.target_node_id.as_str())
                    || selected.contains(r.replacement_node_id.as_str())
            })
            .map(|r| r.target_node_id.clone()),
    );
    let failed_nodes = history
        .iter()
        .filter(|r| r.phase == RefreshPhase::Failed && selected.contains(r.target_node_id.as_str()))
        .map(|r| FailedNode {
            node_name: r.target_node_id.clone(),
            reason: r
                .last_error
                .clone()
                .unwrap_or_else(|| "refresh failed".to_string()),
            timestamp: r.updated_at.to_rfc3339(),
        })
        .collect();

    let requeue_after = match next_refresh {
        Some(at) if at > now => (at - now)
            .to_std()
            .unwrap_or(settings.resync)
            .min(settings.resync),
        _ => settings.resync,
    }
    .max(Duration::from_secs(1));

    PolicyEvaluation {
        manual,
        scheduled,
        phase,
        status: NodeRefreshStatus {
            phase: Some(phase.as_str().to_string()),
            message: Some(message),
            current_nodes: current.into_iter().collect(),
            processed_nodes,
            failed_nodes,
            next_refresh_time: next_refresh.map(|t| t.to_rfc3339()),
            last_reconcile_time: Some(now.to_rfc3339()),
            observed_generation: None,
            conditions: Vec::new(),
        },
        requeue_after,
        limits: spec.refresh_limits(),
    }
}

fn dedup(names: impl Iterator<Item = String>) -> Vec<String> {
    names.collect::<BTreeSet<_>>().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::ready_node;
    use crate::crd::{HealthChecks, PodManagement, ScheduleSpec, TargetNodes};
    use std::collections::BTreeMap;

    fn spec(max_concurrent: u32) -> NodeRefreshSpec {
        NodeRefreshSpec {
            target_nodes: TargetNodes {
                selector: BTreeMap::new(),
                max_concurrent_nodes: max_concurrent,
            },
            pod_management: PodManagement::default(),
            schedule: ScheduleSpec {
                enabled: true,
                ..ScheduleSpec::default()
            },
            health_checks: HealthChecks::default(),
            suspend: false,
        }
    }

    fn settings(now: DateTime<Utc>) -> PolicySettings {
        PolicySettings {
            now,
            failed_retry: chrono::Duration::hours(1),
            resync: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn aged(name: &str, days: i64, now: DateTime<Utc>) -> NodeStatus {
        NodeStatus {
            created_at: Some(now - chrono::Duration::days(days)),
            ..ready_node(name)
        }
    }

    #[test]
    fn test_schedule_respects_max_concurrent_nodes() {
        let now = Utc::now();
        let nodes = vec![aged("a", 5, now), aged("b", 5, now), aged("c", 5, now)];
        let plan = plan(&spec(2), &nodes, &[], &[], &settings(now));

        assert_eq!(plan.scheduled, vec!["a", "b"]);
        assert!(plan.manual.is_empty());
        assert_eq!(plan.status.phase.as_deref(), Some("Running"));
        assert_eq!(plan.status.current_nodes, vec!["a", "b"]);
        // c is due but waiting for a slot
        assert_eq!(plan.status.next_refresh_time, Some(now.to_rfc3339()));
        assert_eq!(plan.requeue_after, Duration::from_secs(30));
    }

    #[test]
    fn test_active_refresh_occupies_slot() {
        let now = Utc::now();
        let nodes = vec![aged("a", 5, now), aged("b", 5, now)];
        let active = vec![NodeRefreshRequest::new("a", now)];
        let plan = plan(&spec(1), &nodes, &active, &[], &settings(now));

        assert!(plan.scheduled.is_empty());
        assert_eq!(plan.status.current_nodes, vec!["a"]);
        assert_eq!(plan.status.phase.as_deref(), Some("Running"));
    }

    #[test]
    fn test_manual_annotation_bypasses_schedule() {
        let now = Utc::now();
        let mut young = aged("young", 0, now);
        young
            .annotations
            .insert(REFRESH_NOW_ANNOTATION.to_string(), "true".to_string());
        let mut policy = spec(1);
        policy.schedule.enabled = false;

        let plan = plan(&policy, &[young, aged("old", 10, now)], &[], &[], &settings(now));
        assert_eq!(plan.manual, vec!["young"]);
        assert!(plan.scheduled.is_empty());
        assert_eq!(plan.status.next_refresh_time, None);

        let triggers = plan.triggers();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].source, TriggerSource::Manual);
    }

    #[test]
    fn test_triggers_carry_policy_limits() {
        let now = Utc::now();
        let mut policy = spec(1);
        policy.pod_management.max_pods_to_move = 5;
        policy.pod_management.drain_timeout = 900;
        policy.health_checks.readiness_timeout = 120;

        let plan = plan(&policy, &[aged("old", 5, now)], &[], &[], &settings(now));
        let triggers = plan.triggers();
        assert_eq!(triggers.len(), 1);
        assert_eq!(
            triggers[0].limits,
            RefreshLimits {
                max_pods_to_move: Some(5),
                min_healthy_pods: Some(2),
                drain_timeout_secs: Some(900),
                readiness_timeout_secs: Some(120),
            }
        );
    }

    #[test]
    fn test_schedule_is_off_by_default() {
        let now = Utc::now();
        let mut policy = spec(1);
        policy.schedule = ScheduleSpec::default();

        let plan = plan(&policy, &[aged("old", 30, now)], &[], &[], &settings(now));
        assert!(plan.triggers().is_empty());
        assert_eq!(plan.status.next_refresh_time, None);
    }

    #[test]
    fn test_suspended_policy_starts_nothing() {
        let now = Utc::now();
        let mut annotated = aged("a", 5, now);
        annotated
            .annotations
            .insert(REFRESH_NOW_ANNOTATION.to_string(), "true".to_string());
        let mut policy = spec(3);
        policy.suspend = true;

        let plan = plan(&policy, &[annotated], &[], &[], &settings(now));
        assert!(plan.triggers().is_empty());
        assert_eq!(plan.phase, PolicyPhase::Suspended);
        assert_eq!(plan.status.phase.as_deref(), Some("Suspended"));
    }

    #[test]
    fn test_idle_requeues_at_next_due_time() {
        let now = Utc::now();
        let nodes = vec![NodeStatus {
            created_at: Some(now - chrono::Duration::days(3) + chrono::Duration::seconds(10)),
            ..ready_node("soon")
        }];
        let plan = plan(&spec(1), &nodes, &[], &[], &settings(now));

        assert!(plan.triggers().is_empty());
        assert_eq!(plan.status.phase.as_deref(), Some("Idle"));
        assert_eq!(plan.requeue_after, Duration::from_secs(10));
    }

    #[test]
    fn test_history_feeds_processed_and_failed_nodes() {
        let now = Utc::now();
        let mut completed = NodeRefreshRequest::new("gone", now);
        completed.phase = RefreshPhase::Completed;
        completed.replacement_node_id = "gone-refresh".to_string();
        let mut failed = NodeRefreshRequest::new("stuck", now);
        failed.phase = RefreshPhase::Failed;
        failed.last_error = Some("drain blocked".to_string());
        failed.updated_at = now;

        let nodes = vec![aged("gone-refresh", 0, now), aged("stuck", 0, now)];
        let plan = plan(&spec(1), &nodes, &[], &[completed, failed], &settings(now));

        assert_eq!(plan.status.processed_nodes, vec!["gone"]);
        assert_eq!(plan.status.failed_nodes.len(), 1);
        assert_eq!(plan.status.failed_nodes[0].node_name, "stuck");
        assert_eq!(plan.status.failed_nodes[0].reason, "drain blocked");
        // failed node waits for the retry interval
        assert!(plan.scheduled.is_empty());
    }

    #[tokio::test]
    async fn test_evaluate_reads_cluster_and_store() {
        use crate::cluster::InMemoryCluster;
        use crate::store::MemoryStatusStore;

        let now = Utc::now();
        let cluster = InMemoryCluster::new();
        cluster.add_node(aged("old", 5, now));
        let store = MemoryStatusStore::new();

        let evaluation = evaluate(&spec(1), &cluster, &store, &settings(now))
            .await
            .unwrap();
        assert_eq!(evaluation.scheduled, vec!["old"]);
    }
}
