//! # Watch Loop
//!
//! Controller watch loop over `NodeRefresh` resources.
//!
//! Every policy is reconciled on change and on the requeue it asks for.
//! Nodes are watched as well: a node carrying the refresh-now annotation
//! re-triggers every policy so manual refreshes start without waiting for
//! the next requeue.

use crate::config::SharedControllerConfig;
use crate::constants::REFRESH_NOW_ANNOTATION;
use crate::controller::reconciler::{reconcile, Reconciler, ReconcilerError};
use crate::controller::server::ServerState;
use crate::crd::NodeRefresh;
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error};
use crate::runtime::shutdown::wait_for_shutdown;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{watcher, Controller};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Run the controller watch loop until `shutdown` flips to `true`
///
/// In-flight reconciliations finish before the loop returns. The watch
/// restarts after stream errors or when the stream ends.
///
/// # Errors
///
/// Currently always returns `Ok` once shutdown completes.
pub async fn run_watch_loop(
    policies: Api<NodeRefresh>,
    nodes: Api<Node>,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
    controller_config: SharedControllerConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    let backoff_start_ms = controller_config.read().await.watch_backoff_start_ms;
    let backoff_ms = Arc::new(AtomicU64::new(backoff_start_ms));

    loop {
        if *shutdown.borrow() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let watch_span = tracing::span!(
            tracing::Level::INFO,
            "controller.watch",
            operation = "watch_loop"
        );
        let backoff = Arc::clone(&backoff_ms);
        let filter_config = Arc::clone(&controller_config);

        let controller =
            Controller::new(policies.clone(), watcher::Config::default().any_semantic());
        let policy_store = controller.store();
        server_state.set_ready(true);
        info!("Starting controller watch loop...");

        controller
            .watches(nodes.clone(), watcher::Config::default(), move |node: Node| {
                if node.annotations().contains_key(REFRESH_NOW_ANNOTATION) {
                    policy_store
                        .state()
                        .iter()
                        .map(|policy| ObjectRef::from_obj(policy.as_ref()))
                        .collect::<Vec<_>>()
                } else {
                    Vec::new()
                }
            })
            .graceful_shutdown_on(wait_for_shutdown(shutdown.clone()))
            .run(
                reconcile_with_span,
                handle_reconciliation_error,
                Arc::clone(&reconciler),
            )
            .filter_map(move |event| {
                let backoff = Arc::clone(&backoff);
                let config = Arc::clone(&filter_config);
                async move {
                    let keep = match &event {
                        Ok((policy, _)) => {
                            let start = config.read().await.watch_backoff_start_ms;
                            backoff.store(start, Ordering::Relaxed);
                            debug!(resource.name = %policy.name, "watch.event.success");
                            true
                        }
                        Err(e) => {
                            let error_string = format!("{e:?}");
                            let (max_backoff, restart_delay) = {
                                let config = config.read().await;
                                (
                                    config.watch_backoff_max_ms,
                                    Duration::from_secs(config.watch_restart_delay_secs),
                                )
                            };
                            handle_watch_stream_error(
                                &error_string,
                                &backoff,
                                max_backoff,
                                restart_delay,
                            )
                            .await
                        }
                    };
                    keep.then_some(event)
                }
            })
            .for_each(|_| futures::future::ready(()))
            .instrument(watch_span)
            .await;

        if *shutdown.borrow() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let delay_secs = controller_config.read().await.watch_restart_delay_secs;
        server_state.set_ready(false);
        warn!(
            "Controller watch stream ended, restarting in {} seconds...",
            delay_secs
        );
        let mut restart = shutdown.clone();
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(delay_secs)) => {}
            _ = restart.changed() => {}
        }
    }

    server_state.set_ready(false);
    info!("Controller stopped gracefully");
    Ok(())
}

fn reconcile_with_span(
    obj: Arc<NodeRefresh>,
    ctx: Arc<Reconciler>,
) -> impl Future<Output = Result<Action, ReconcilerError>> + Send {
    let span = tracing::span!(
        tracing::Level::INFO,
        "controller.watch.reconcile",
        resource.name = %obj.name_any(),
        resource.generation = obj.metadata.generation.unwrap_or(0),
        resource.observed_generation = obj
            .status
            .as_ref()
            .and_then(|s| s.observed_generation)
            .unwrap_or(0),
    );
    reconcile(obj, ctx).instrument(span)
}
