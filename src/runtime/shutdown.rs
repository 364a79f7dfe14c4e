//! # Shutdown
//!
//! Turns SIGINT/SIGTERM into a `watch` channel shared by the watch loop and
//! the reconciliation loop.

use crate::controller::server::ServerState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Spawn the signal handler; the returned receiver flips to `true` once
///
/// Readiness is dropped as soon as the signal arrives.
pub fn spawn_signal_handler(server_state: Arc<ServerState>) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal, initiating graceful shutdown...");
        server_state.set_ready(false);
        if tx.send(true).is_err() {
            warn!("no component listening for shutdown");
        }
    });
    rx
}

/// Resolve once `shutdown` is `true` or its sender is gone
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler, listening for SIGINT only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for SIGINT");
        std::future::pending::<()>().await;
    }
}
