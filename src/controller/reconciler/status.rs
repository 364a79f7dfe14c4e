//! # Status
//!
//! Builds and patches `NodeRefresh` status.
//!
//! Status is only written when something other than the reconcile timestamp
//! changed, so a status patch does not feed back into an endless stream of
//! watch events.

use crate::constants::FIELD_MANAGER;
use crate::crd::{Condition, NodeRefresh, NodeRefreshStatus, PolicyPhase};
use kube::api::{Patch, PatchParams};
use kube::Api;
use tracing::debug;

const READY_CONDITION: &str = "Ready";

/// Ready condition for a phase, keeping the previous transition time when
/// the condition status did not change
#[must_use]
pub fn ready_condition(
    phase: PolicyPhase,
    message: &str,
    previous: Option<&NodeRefreshStatus>,
    now: &str,
) -> Condition {
    let (status, reason) = match phase {
        PolicyPhase::Idle => ("True", "Idle"),
        PolicyPhase::Running => ("True", "Refreshing"),
        PolicyPhase::Suspended => ("False", "Suspended"),
        PolicyPhase::Failed => ("False", "EvaluationFailed"),
    };
    let last_transition_time = previous
        .and_then(|s| s.conditions.iter().find(|c| c.r#type == READY_CONDITION))
        .filter(|c| c.status == status)
        .and_then(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| now.to_string());

    Condition {
        r#type: READY_CONDITION.to_string(),
        status: status.to_string(),
        last_transition_time: Some(last_transition_time),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Attach generation and conditions to an evaluated status
#[must_use]
pub fn finalize_status(
    mut status: NodeRefreshStatus,
    phase: PolicyPhase,
    previous: Option<&NodeRefreshStatus>,
    generation: Option<i64>,
) -> NodeRefreshStatus {
    let now = status
        .last_reconcile_time
        .clone()
        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
    let message = status.message.clone().unwrap_or_default();
    status.observed_generation = generation;
    status.conditions = vec![ready_condition(phase, &message, previous, &now)];
    status
}

/// Status for a policy that could not be evaluated
///
/// Keeps the last known node lists so a transient failure does not blank
/// them out.
#[must_use]
pub fn failed_status(
    previous: Option<&NodeRefreshStatus>,
    error: &str,
    now: &str,
    generation: Option<i64>,
) -> NodeRefreshStatus {
    let mut status = previous.cloned().unwrap_or_default();
    status.phase = Some(PolicyPhase::Failed.as_str().to_string());
    status.message = Some(error.to_string());
    status.last_reconcile_time = Some(now.to_string());
    finalize_status(status, PolicyPhase::Failed, previous, generation)
}

/// Whether `next` differs from `previous` in anything but the reconcile time
#[must_use]
pub fn status_changed(previous: Option<&NodeRefreshStatus>, next: &NodeRefreshStatus) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    let mut previous = previous.clone();
    previous.last_reconcile_time.clone_from(&next.last_reconcile_time);
    previous != *next
}

/// Merge-patch the status subresource
///
/// A policy deleted during reconciliation is not an error.
///
/// # Errors
///
/// Returns the API error for anything other than 404.
pub async fn update_status(
    api: &Api<NodeRefresh>,
    name: &str,
    status: &NodeRefreshStatus,
) -> Result<(), kube::Error> {
    let patch = serde_json::json!({ "status": status });
    match api
        .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {
            debug!(resource.name = name, phase = ?status.phase, "status updated");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!(resource.name = name, "NodeRefresh deleted during reconciliation, skipping status update");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
