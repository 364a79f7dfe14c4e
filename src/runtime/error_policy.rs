//! # Error Policy
//!
//! Error handling and backoff logic for the controller watch loop.
//! This module handles `NodeRefresh` reconciliation errors and watch stream
//! errors.

use crate::controller::reconciler::{Reconciler, ReconcilerError};
use crate::crd::NodeRefresh;
use crate::observability::metrics;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Handle reconciliation errors with per-resource Fibonacci backoff
pub fn handle_reconciliation_error(
    obj: Arc<NodeRefresh>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action {
    let name = obj.name_any();
    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.name = name.as_str(),
        error = %error
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {}: {:?}", name, error);
    metrics::increment_policy_reconciliation_errors();

    let (delay, error_count) = ctx.next_error_backoff(&name).unwrap_or_else(|| {
        warn!("Failed to lock backoff states, using the initial backoff");
        (ctx.error_backoff.clone().next_backoff(), 0)
    });

    info!(
        resource.name = name.as_str(),
        error_count,
        retry_in_secs = delay.as_secs(),
        "retrying NodeRefresh with backoff"
    );
    Action::requeue(delay)
}

/// Classification of an error ending a watch stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorKind {
    /// 401: credentials expired or RBAC revoked
    Unauthorized,
    /// 410: resource version too old, normal after restarts
    Expired,
    /// 429: API server throttling or storage reinitializing
    Throttled,
    /// 404: CRD missing or object deleted
    NotFound,
    Other,
}

impl WatchErrorKind {
    #[must_use]
    pub fn classify(error: &str) -> Self {
        // a plain-text 404 surfaces as a serde error mentioning WatchFailed,
        // so not-found is checked before unauthorized
        let not_found = error.contains("ObjectNotFound")
            || error.contains("404")
            || error.contains("not found");
        if (error.contains("401") || error.contains("Unauthorized")) && !not_found {
            Self::Unauthorized
        } else if error.contains("410")
            || error.contains("too old resource version")
            || error.contains("Expired")
            || error.contains("Gone")
        {
            Self::Expired
        } else if error.contains("429")
            || error.contains("storage is (re)initializing")
            || error.contains("TooManyRequests")
        {
            Self::Throttled
        } else if not_found {
            Self::NotFound
        } else {
            Self::Other
        }
    }
}

/// Handle a watch stream error
///
/// Returns `true` to keep the event in the stream and `false` to drop it
/// and let the watch restart.
pub async fn handle_watch_stream_error(
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
    watch_restart_delay: Duration,
) -> bool {
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        error = %error_string
    );
    let _error_guard = error_span.enter();

    match WatchErrorKind::classify(error_string) {
        WatchErrorKind::Unauthorized => {
            error!("Watch authentication failed (401 Unauthorized); check the controller ClusterRole and ServiceAccount");
            error!("   kubectl auth can-i watch noderefreshes --as=system:serviceaccount:<namespace>:node-refresh-controller");
            error!("   kubectl auth can-i create pods/eviction --as=system:serviceaccount:<namespace>:node-refresh-controller");
            warn!(
                "Waiting {}s before retrying watch",
                watch_restart_delay.as_secs()
            );
            tokio::time::sleep(watch_restart_delay).await;
            false
        }
        WatchErrorKind::Expired => {
            warn!(error_type = "410", "watch resource version expired, watch will restart");
            false
        }
        WatchErrorKind::Throttled => {
            let current = backoff.load(Ordering::Relaxed);
            warn!(
                "API server throttling (429), backing off for {}ms before restart",
                current
            );
            tokio::time::sleep(Duration::from_millis(current)).await;
            backoff.store(current.saturating_mul(2).min(max_backoff_ms), Ordering::Relaxed);
            false
        }
        WatchErrorKind::NotFound => {
            warn!(
                "Resource not found (404); the NodeRefresh CRD may be missing. Error: {}",
                error_string
            );
            true
        }
        WatchErrorKind::Other => {
            error!("Controller stream error: {}", error_string);
            tokio::time::sleep(watch_restart_delay).await;
            false
        }
    }
}
