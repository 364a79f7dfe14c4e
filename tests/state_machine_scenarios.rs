//! # State Machine Scenarios
//!
//! End-to-end refresh scenarios against the in-memory cluster: the happy
//! path, disruption budget safety, retry ceilings, call timeouts and
//! resuming a drain after a controller restart.

mod common;

use common::{
    budgeted_pod, drive_to, drive_to_end, step, worker, Harness, REPLACEMENT, TARGET,
    WEB_BUDGET,
};
use node_refresh_controller::cluster::memory::running_pod;
use node_refresh_controller::cluster::{ClusterClient, ClusterError, Operation, PodInfo};
use node_refresh_controller::constants::REPLACES_LABEL;
use node_refresh_controller::controller::request::{
    NodeRefreshRequest, RefreshLimits, RefreshPhase,
};
use node_refresh_controller::controller::state_machine::Next;
use node_refresh_controller::store::StatusStore;
use chrono::Utc;
use std::collections::BTreeSet;
use std::time::Duration;

fn api_error(operation: &'static str) -> ClusterError {
    ClusterError::Api {
        operation,
        message: "internal error".to_string(),
    }
}

fn web(i: usize) -> String {
    format!("default/web-{i}")
}

#[tokio::test]
async fn test_refresh_completes_and_replaces_node() {
    let harness = Harness::new();
    harness.cluster.add_pod(TARGET, running_pod("default", "api-0"));
    harness.cluster.add_pod(TARGET, running_pod("default", "api-1"));
    harness.cluster.add_pod(
        TARGET,
        PodInfo {
            daemonset: true,
            ..running_pod("kube-system", "node-exporter")
        },
    );
    let machine = harness.machine();

    let (request, phases) = drive_to_end(
        &machine,
        &harness.store,
        NodeRefreshRequest::new(TARGET, Utc::now()),
    )
    .await;

    assert_eq!(request.phase, RefreshPhase::Completed);
    assert_eq!(request.replacement_node_id, REPLACEMENT);
    assert!(request.last_error.is_none());
    assert_eq!(
        phases,
        vec![
            RefreshPhase::Pending,
            RefreshPhase::Provisioning,
            RefreshPhase::Cordoning,
            RefreshPhase::Draining,
            RefreshPhase::Verifying,
            RefreshPhase::Deleting,
            RefreshPhase::Completed,
        ]
    );

    assert!(harness.cluster.node(TARGET).is_none(), "target must be deleted");
    let replacement = harness.cluster.node(REPLACEMENT).expect("replacement exists");
    assert_eq!(
        replacement.labels.get("node-pool").map(String::as_str),
        Some("workers")
    );
    assert_eq!(
        replacement.labels.get(REPLACES_LABEL).map(String::as_str),
        Some(TARGET)
    );
    assert!(!replacement.labels.contains_key("kubernetes.io/hostname"));

    let mut evicted = harness.cluster.evictions();
    evicted.sort();
    assert_eq!(evicted, vec!["default/api-0", "default/api-1"]);
}

#[tokio::test]
async fn test_phases_only_move_forward_and_delete_requires_ready_replacement() {
    let harness = Harness::new();
    harness.add_budgeted_pods(2, 1);
    harness.cluster.add_pod(TARGET, running_pod("batch", "job-0"));
    let machine = harness.machine();

    let mut request = NodeRefreshRequest::new(TARGET, Utc::now());
    let mut steps = 0;
    while !request.is_terminal() {
        steps += 1;
        assert!(steps < common::MAX_STEPS, "refresh did not finish");

        let previous = request.phase;
        request = step(&machine, &harness.store, request).await.request;
        assert!(
            previous.can_transition_to(request.phase),
            "illegal transition {previous} -> {}",
            request.phase
        );

        if request.phase == RefreshPhase::Deleting {
            assert!(request.has_replacement());
            let replacement = harness
                .cluster
                .node(&request.replacement_node_id)
                .expect("replacement registered");
            assert!(replacement.ready && !replacement.unschedulable);
        }
        harness.set_web_budget(1);
    }
    assert_eq!(request.phase, RefreshPhase::Completed);
}

#[tokio::test]
async fn test_drain_never_exceeds_disruption_budget() {
    let harness = Harness::new();
    harness.add_budgeted_pods(3, 1);
    let machine = harness.machine();

    let mut request = drive_to(
        &machine,
        &harness.store,
        NodeRefreshRequest::new(TARGET, Utc::now()),
        RefreshPhase::Draining,
    )
    .await;

    while request.phase == RefreshPhase::Draining {
        let before = harness.cluster.evictions().len();
        request = step(&machine, &harness.store, request).await.request;
        let evicted = harness.cluster.evictions().len() - before;
        assert!(evicted <= 1, "evicted {evicted} pods with one allowed disruption");
        assert_eq!(request.attempt, 0, "budget waits consume no attempts");
        // the evicted replica has rescheduled and is healthy again
        harness.set_web_budget(1);
    }

    assert_eq!(request.phase, RefreshPhase::Verifying);
    assert_eq!(harness.cluster.evictions(), vec![web(0), web(1), web(2)]);
}

#[tokio::test]
async fn test_blocked_drain_waits_without_consuming_attempts() {
    let harness = Harness::new();
    harness.add_budgeted_pods(2, 0);
    let machine = harness.machine();

    let mut request = drive_to(
        &machine,
        &harness.store,
        NodeRefreshRequest::new(TARGET, Utc::now()),
        RefreshPhase::Draining,
    )
    .await;

    // well past the attempt ceiling of three
    let mut delays = Vec::new();
    for _ in 0..8 {
        let advance = step(&machine, &harness.store, request).await;
        request = advance.request;
        let Next::Requeue(delay) = advance.next else {
            panic!("blocked drain must requeue");
        };
        delays.push(delay.as_millis());
        assert_eq!(request.phase, RefreshPhase::Draining);
        assert_eq!(request.attempt, 0);
    }
    // contention backs off up to the retry cap
    assert_eq!(delays, vec![10, 20, 40, 80, 160, 320, 640, 1000]);
    assert_eq!(request.contention, 8);
    let last_error = request.last_error.clone().unwrap_or_default();
    assert!(last_error.contains(WEB_BUDGET), "unexpected error: {last_error}");
    assert!(harness.cluster.evictions().is_empty());

    harness.set_web_budget(2);
    let request = drive_to(&machine, &harness.store, request, RefreshPhase::Verifying).await;
    assert_eq!(request.phase, RefreshPhase::Verifying);
    assert_eq!(harness.cluster.evictions(), vec![web(0), web(1)]);
}

#[tokio::test]
async fn test_drain_blocked_past_timeout_fails() {
    let harness = Harness::new();
    harness.add_budgeted_pods(2, 0);
    let machine = harness.machine();
    let limits = RefreshLimits {
        drain_timeout_secs: Some(600),
        ..RefreshLimits::default()
    };

    let request = drive_to(
        &machine,
        &harness.store,
        NodeRefreshRequest::new(TARGET, Utc::now()).with_limits(limits),
        RefreshPhase::Draining,
    )
    .await;
    let mut request = step(&machine, &harness.store, request).await.request;
    assert_eq!(request.phase, RefreshPhase::Draining);

    request.phase_started_at = Some(Utc::now() - chrono::Duration::seconds(601));
    let advance = step(&machine, &harness.store, request).await;

    assert_eq!(advance.next, Next::Terminal);
    assert_eq!(advance.request.phase, RefreshPhase::Failed);
    let reason = advance.request.last_error.unwrap_or_default();
    assert!(
        reason.contains("drain still blocked by default/web after 600s"),
        "unexpected reason: {reason}"
    );
    assert!(harness.cluster.evictions().is_empty());
}

#[tokio::test]
async fn test_unhealthy_pods_fail_drain_after_attempt_ceiling() {
    let harness = Harness::new();
    harness.cluster.add_pod(
        TARGET,
        PodInfo {
            ready: Some(false),
            ..running_pod("default", "crashloop-0")
        },
    );
    let machine = harness.machine();

    let (request, _) = drive_to_end(
        &machine,
        &harness.store,
        NodeRefreshRequest::new(TARGET, Utc::now()),
    )
    .await;

    assert_eq!(request.phase, RefreshPhase::Failed);
    assert_eq!(request.attempt, 3);
    let last_error = request.last_error.unwrap_or_default();
    assert!(last_error.contains("Draining gave up after 3 attempts"), "{last_error}");
    assert!(last_error.contains("default/crashloop-0"), "{last_error}");
    assert!(harness.cluster.evictions().is_empty());
    assert!(harness.cluster.node(TARGET).is_some());
}

#[tokio::test]
async fn test_provisioning_failures_are_retried() {
    let harness = Harness::new();
    harness
        .cluster
        .fail_next(Operation::CreateNode, 2, api_error("create_node"));
    let machine = harness.machine();

    let mut request = NodeRefreshRequest::new(TARGET, Utc::now());
    for expected_attempt in 1..=2 {
        let advance = step(&machine, &harness.store, request).await;
        request = advance.request;
        assert_eq!(request.phase, RefreshPhase::Pending);
        assert_eq!(request.attempt, expected_attempt);
        assert!(request.last_error.is_some());
    }

    let advance = step(&machine, &harness.store, request).await;
    assert_eq!(advance.request.phase, RefreshPhase::Provisioning);
    assert_eq!(advance.request.attempt, 0);
    assert!(advance.request.last_error.is_none());

    let (request, _) = drive_to_end(&machine, &harness.store, advance.request).await;
    assert_eq!(request.phase, RefreshPhase::Completed);
    assert_eq!(harness.cluster.calls(Operation::CreateNode), 3);
}

#[tokio::test]
async fn test_delete_failures_past_ceiling_leave_drained_target() {
    let harness = Harness::new();
    harness.cluster.add_pod(TARGET, running_pod("default", "api-0"));
    harness
        .cluster
        .fail_always(Operation::DeleteNode, api_error("delete_node"));
    let machine = harness.machine();

    let (request, phases) = drive_to_end(
        &machine,
        &harness.store,
        NodeRefreshRequest::new(TARGET, Utc::now()),
    )
    .await;

    assert_eq!(request.phase, RefreshPhase::Failed);
    assert_eq!(phases.iter().rev().nth(1), Some(&RefreshPhase::Deleting));
    let last_error = request.last_error.unwrap_or_default();
    assert!(last_error.contains("Deleting gave up after 3 attempts"), "{last_error}");
    assert_eq!(harness.cluster.calls(Operation::DeleteNode), 3);

    let target = harness.cluster.node(TARGET).expect("target is kept");
    assert!(target.unschedulable, "target stays cordoned");
    assert!(harness
        .cluster
        .pods_on(TARGET)
        .iter()
        .all(|p| !p.is_running_workload()));
    let replacement = harness.cluster.node(REPLACEMENT).expect("replacement is kept");
    assert!(replacement.ready);
}

#[tokio::test]
async fn test_drain_resumes_after_restart_without_repeating_evictions() {
    let harness = Harness::new();
    harness.add_budgeted_pods(3, 2);
    let machine = harness.machine();

    let request = drive_to(
        &machine,
        &harness.store,
        NodeRefreshRequest::new(TARGET, Utc::now()),
        RefreshPhase::Draining,
    )
    .await;

    // evicts web-0 and web-1, then the budget is spent; the returned request
    // is dropped as if the controller died before persisting it
    let lost = machine.advance(request).await;
    assert_eq!(lost.request.phase, RefreshPhase::Draining);
    drop(machine);
    assert_eq!(harness.cluster.evictions(), vec![web(0), web(1)]);

    let resumed = harness
        .store
        .load(TARGET)
        .await
        .unwrap()
        .expect("drain progress was persisted");
    assert_eq!(resumed.phase, RefreshPhase::Draining);
    assert_eq!(resumed.drained_pods, BTreeSet::from([web(0), web(1)]));

    // web-0 is still listed while its termination catches up
    harness.cluster.add_pod(TARGET, budgeted_pod("web-0"));
    harness.set_web_budget(1);

    let restarted = harness.machine();
    let advance = step(&restarted, &harness.store, resumed).await;
    assert_eq!(advance.request.phase, RefreshPhase::Draining);
    assert_eq!(harness.cluster.evictions(), vec![web(0), web(1), web(2)]);
    assert_eq!(harness.cluster.calls(Operation::Evict), 3);
    assert_eq!(
        advance.request.drained_pods,
        BTreeSet::from([web(0), web(1), web(2)])
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_record_error_without_consuming_attempts() {
    let harness = Harness::new();
    harness
        .cluster
        .set_delay(Operation::CreateNode, Duration::from_secs(60));
    let machine = harness.machine();

    let mut request = NodeRefreshRequest::new(TARGET, Utc::now());
    for _ in 0..5 {
        let advance = step(&machine, &harness.store, request).await;
        request = advance.request;
        assert!(matches!(advance.next, Next::Requeue(_)));
        assert_eq!(request.phase, RefreshPhase::Pending);
        assert_eq!(request.attempt, 0);
        let last_error = request.last_error.clone().unwrap_or_default();
        assert!(last_error.contains("create_node timed out"), "{last_error}");
    }
    assert!(harness.cluster.node(REPLACEMENT).is_none());

    harness.cluster.set_delay(Operation::CreateNode, Duration::ZERO);
    let advance = step(&machine, &harness.store, request).await;
    assert_eq!(advance.request.phase, RefreshPhase::Provisioning);
    assert_eq!(harness.cluster.calls(Operation::CreateNode), 6);
}

#[tokio::test]
async fn test_vanished_replacement_is_resubmitted() {
    let harness = Harness::new();
    harness.cluster.set_provision_ready(false);
    let machine = harness.machine();

    let request = drive_to(
        &machine,
        &harness.store,
        NodeRefreshRequest::new(TARGET, Utc::now()),
        RefreshPhase::Provisioning,
    )
    .await;

    let advance = step(&machine, &harness.store, request).await;
    assert_eq!(advance.request.phase, RefreshPhase::Provisioning);
    assert_eq!(advance.next, Next::Requeue(Duration::from_secs(1)));

    harness.cluster.delete_node(REPLACEMENT).await.unwrap();
    let advance = step(&machine, &harness.store, advance.request).await;
    assert_eq!(advance.request.phase, RefreshPhase::Provisioning);
    assert_eq!(advance.request.attempt, 0);
    assert_eq!(harness.cluster.calls(Operation::CreateNode), 2);
    assert!(harness.cluster.node(REPLACEMENT).is_some());

    harness.cluster.set_node_ready(REPLACEMENT, true);
    let advance = step(&machine, &harness.store, advance.request).await;
    assert_eq!(advance.request.phase, RefreshPhase::Cordoning);
    assert_eq!(advance.request.replacement_node_id, REPLACEMENT);
}

#[tokio::test]
async fn test_missing_target_fails_immediately() {
    let harness = Harness::new();
    let machine = harness.machine();

    let advance = machine
        .advance(NodeRefreshRequest::new("ghost-node", Utc::now()))
        .await;

    assert_eq!(advance.next, Next::Terminal);
    assert_eq!(advance.request.phase, RefreshPhase::Failed);
    assert_eq!(
        advance.request.last_error.as_deref(),
        Some("target node ghost-node not found")
    );
    assert_eq!(harness.cluster.calls(Operation::CreateNode), 0);
}

#[tokio::test]
async fn test_verifying_without_replacement_fails() {
    let harness = Harness::new();
    let machine = harness.machine();
    let mut request = NodeRefreshRequest::new(TARGET, Utc::now());
    request.phase = RefreshPhase::Verifying;

    let advance = machine.advance(request).await;

    assert_eq!(advance.next, Next::Terminal);
    assert_eq!(advance.request.phase, RefreshPhase::Failed);
    assert!(harness.cluster.node(TARGET).is_some());
}

#[tokio::test]
async fn test_terminal_request_is_left_untouched() {
    let harness = Harness::new();
    let machine = harness.machine();
    let mut request = NodeRefreshRequest::new(TARGET, Utc::now());
    request.phase = RefreshPhase::Completed;

    let advance = machine.advance(request.clone()).await;

    assert_eq!(advance.next, Next::Terminal);
    assert_eq!(advance.request, request);
    assert_eq!(harness.cluster.calls(Operation::GetNode), 0);
}

#[tokio::test]
async fn test_replacement_never_ready_fails_after_timeout() {
    let harness = Harness::new();
    harness.cluster.set_provision_ready(false);
    let machine = harness.machine();
    let limits = RefreshLimits {
        readiness_timeout_secs: Some(60),
        ..RefreshLimits::default()
    };

    let request = drive_to(
        &machine,
        &harness.store,
        NodeRefreshRequest::new(TARGET, Utc::now()).with_limits(limits),
        RefreshPhase::Provisioning,
    )
    .await;
    let mut request = step(&machine, &harness.store, request).await.request;
    assert_eq!(request.phase, RefreshPhase::Provisioning);

    request.phase_started_at = Some(Utc::now() - chrono::Duration::seconds(61));
    let advance = step(&machine, &harness.store, request).await;

    assert_eq!(advance.next, Next::Terminal);
    assert_eq!(advance.request.phase, RefreshPhase::Failed);
    let reason = advance.request.last_error.unwrap_or_default();
    assert!(
        reason.contains(&format!("replacement {REPLACEMENT} not ready within 60s")),
        "unexpected reason: {reason}"
    );
    assert!(!harness.cluster.node(TARGET).unwrap().unschedulable);
}

#[tokio::test]
async fn test_long_names_sharing_a_prefix_get_separate_replacements() {
    let harness = Harness::new();
    let prefix = "x".repeat(60);
    let targets = [format!("{prefix}-a"), format!("{prefix}-b")];
    for target in &targets {
        harness.cluster.add_node(worker(target));
    }
    let machine = harness.machine();

    let mut replacements = BTreeSet::new();
    for target in &targets {
        let (request, _) = drive_to_end(
            &machine,
            &harness.store,
            NodeRefreshRequest::new(target.as_str(), Utc::now()),
        )
        .await;
        assert_eq!(request.phase, RefreshPhase::Completed, "{:?}", request.last_error);
        assert!(request.replacement_node_id.len() <= 63);
        replacements.insert(request.replacement_node_id);
    }

    assert_eq!(replacements.len(), 2);
    for replacement in &replacements {
        let node = harness.cluster.node(replacement).expect("replacement kept");
        assert!(targets.contains(&node.labels[REPLACES_LABEL]));
    }
    for target in &targets {
        assert!(harness.cluster.node(target).is_none());
    }
}

#[tokio::test]
async fn test_target_named_like_a_replacement_is_not_deleted_as_its_own() {
    let harness = Harness::new();
    let target = format!("{}-refresh", "y".repeat(55));
    harness.cluster.add_node(worker(&target));
    let machine = harness.machine();

    let (request, _) = drive_to_end(
        &machine,
        &harness.store,
        NodeRefreshRequest::new(target.as_str(), Utc::now()),
    )
    .await;

    assert_eq!(request.phase, RefreshPhase::Completed, "{:?}", request.last_error);
    assert_ne!(request.replacement_node_id, target);
    assert!(harness.cluster.node(&target).is_none());
    assert!(harness.cluster.node(&request.replacement_node_id).is_some());
}

#[tokio::test]
async fn test_foreign_node_holding_replacement_name_fails_pending() {
    let harness = Harness::new();
    // same name, but it does not replace the target
    harness.cluster.add_node(worker(REPLACEMENT));
    let machine = harness.machine();

    let advance = step(
        &machine,
        &harness.store,
        NodeRefreshRequest::new(TARGET, Utc::now()),
    )
    .await;

    assert_eq!(advance.next, Next::Terminal);
    assert_eq!(advance.request.phase, RefreshPhase::Failed);
    let reason = advance.request.last_error.unwrap_or_default();
    assert!(reason.contains("does not replace worker-1"), "unexpected reason: {reason}");
    assert_eq!(harness.cluster.calls(Operation::CreateNode), 1);
    assert!(!harness.cluster.node(TARGET).unwrap().unschedulable);
    assert!(harness.cluster.node(REPLACEMENT).is_some());
}
