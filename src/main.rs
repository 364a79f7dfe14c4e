//! # Node Refresh Controller
//!
//! A Kubernetes controller that periodically replaces cluster nodes with
//! freshly provisioned ones.
//!
//! ## Overview
//!
//! For every node selected by a `NodeRefresh` resource the controller:
//!
//! 1. **Provisions** a replacement node and waits until it is Ready
//! 2. **Cordons** the old node
//! 3. **Drains** it through the eviction API, never exceeding a PodDisruptionBudget
//! 4. **Verifies** the replacement is still healthy
//! 5. **Deletes** the old node
//!
//! Refresh progress is persisted in ConfigMaps, so a restarted controller
//! resumes each refresh where it stopped.

use anyhow::Result;
use node_refresh_controller::runtime::initialization::{initialize, InitializationResult};
use node_refresh_controller::runtime::shutdown::spawn_signal_handler;
use node_refresh_controller::runtime::watch_loop::run_watch_loop;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let InitializationResult {
        policies,
        nodes,
        reconciler,
        reconciliation_loop,
        triggers,
        server_state,
        controller_config,
        ..
    } = initialize().await?;

    let shutdown = spawn_signal_handler(std::sync::Arc::clone(&server_state));

    let engine = tokio::spawn(reconciliation_loop.run(triggers, shutdown.clone()));

    let result = run_watch_loop(
        policies,
        nodes,
        reconciler,
        server_state,
        controller_config,
        shutdown,
    )
    .await;

    // the loop returns once every worker has finished its current key
    if let Err(e) = engine.await {
        error!("Reconciliation loop panicked: {}", e);
    }

    info!("Controller stopped");
    result
}
