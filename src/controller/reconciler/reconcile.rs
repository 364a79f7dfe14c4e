//! # Reconcile
//!
//! Entry point invoked by the watch loop for every `NodeRefresh`.

use crate::cluster::with_timeout;
use crate::constants::REFRESH_NOW_ANNOTATION;
use crate::controller::reconciler::policy::{evaluate, PolicySettings};
use crate::controller::reconciler::status::{
    failed_status, finalize_status, status_changed, update_status,
};
use crate::controller::reconciler::types::{Reconciler, ReconcilerError};
use crate::crd::NodeRefresh;
use crate::observability::metrics;
use chrono::Utc;
use kube::{Api, ResourceExt};
use kube_runtime::controller::Action;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Evaluate a `NodeRefresh`, send its triggers and publish its status
///
/// # Errors
///
/// Evaluation, trigger delivery and status update failures are returned to
/// the error policy, which requeues with backoff.
pub async fn reconcile(
    policy: Arc<NodeRefresh>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let name = policy.name_any();
    let api: Api<NodeRefresh> = Api::all(ctx.client.clone());
    metrics::increment_policy_reconciliations();

    let settings = {
        let config = ctx.config.read().await;
        PolicySettings::from_config(&config, Utc::now())
    };
    let now = settings.now.to_rfc3339();
    let generation = policy.metadata.generation;

    let evaluation = match evaluate(
        &policy.spec,
        ctx.cluster.as_ref(),
        ctx.store.as_ref(),
        &settings,
    )
    .await
    {
        Ok(evaluation) => evaluation,
        Err(e) => {
            let status = failed_status(policy.status.as_ref(), &e.to_string(), &now, generation);
            if status_changed(policy.status.as_ref(), &status) {
                if let Err(patch_error) = update_status(&api, &name, &status).await {
                    warn!(resource.name = %name, error = %patch_error, "failed to record evaluation failure");
                }
            }
            return Err(e);
        }
    };

    for event in evaluation.triggers() {
        info!(
            resource.name = %name,
            node = %event.target_node_id,
            source = %event.source,
            "requesting node refresh"
        );
        ctx.triggers
            .send(event)
            .await
            .map_err(|e| ReconcilerError::TriggerChannelClosed(e.0.target_node_id))?;
    }

    // a failed removal only re-sends the manual trigger next time
    for node in &evaluation.manual {
        if let Err(e) = with_timeout(
            settings.call_timeout,
            "remove_node_annotation",
            ctx.cluster.remove_node_annotation(node, REFRESH_NOW_ANNOTATION),
        )
        .await
        {
            warn!(resource.name = %name, node = %node, error = %e, "failed to clear refresh annotation");
        }
    }

    let status = finalize_status(
        evaluation.status,
        evaluation.phase,
        policy.status.as_ref(),
        generation,
    );
    if status_changed(policy.status.as_ref(), &status) {
        update_status(&api, &name, &status)
            .await
            .map_err(ReconcilerError::Status)?;
    } else {
        debug!(resource.name = %name, "status unchanged");
    }

    ctx.reset_backoff(&name);
    debug!(
        resource.name = %name,
        requeue_after_secs = evaluation.requeue_after.as_secs(),
        "reconciliation complete"
    );
    Ok(Action::requeue(evaluation.requeue_after))
}
