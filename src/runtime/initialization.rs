//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing,
//! metrics, server startup, and wiring of the refresh engine.

use crate::cluster::{ClusterClient, KubeClusterClient};
use crate::config::{create_shared_config, ControllerConfig, SharedControllerConfig};
use crate::constants::TRIGGER_CHANNEL_CAPACITY;
use crate::controller::reconciler::Reconciler;
use crate::controller::reconciliation_loop::ReconciliationLoop;
use crate::controller::server::{self, ServerState};
use crate::controller::state_machine::NodeRefreshStateMachine;
use crate::controller::trigger::TriggerEvent;
use crate::crd::NodeRefresh;
use crate::observability;
use crate::store::{ConfigMapStatusStore, StatusStore};
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    pub client: Client,
    /// API for the cluster-scoped `NodeRefresh` CRD
    pub policies: Api<NodeRefresh>,
    pub nodes: Api<Node>,
    /// Reconciler context for the watch loop
    pub reconciler: Arc<Reconciler>,
    /// Refresh engine, not started yet
    pub reconciliation_loop: ReconciliationLoop,
    /// Receiving end of the trigger channel fed by the reconciler
    pub triggers: mpsc::Receiver<TriggerEvent>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    pub controller_config: SharedControllerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .field("reconciliation_loop", &self.reconciliation_loop)
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Status store bootstrap
/// - Refresh engine and reconciler wiring
///
/// # Errors
///
/// Fails when any of the steps above fails.
pub async fn initialize() -> Result<InitializationResult> {
    // must run before any TLS connection is made
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|existing| {
            anyhow::anyhow!("rustls crypto provider already installed: {existing:?}")
        })?;

    let config = ControllerConfig::from_env();
    init_tracing(&config)?;

    info!("Starting Node Refresh Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());
    let listener = server::bind(config.metrics_port)
        .await
        .context("Failed to bind metrics port")?;
    let server_state_clone = Arc::clone(&server_state);
    tokio::spawn(async move {
        if let Err(e) = server::serve(listener, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    let client = Client::try_default().await?;

    let policies: Api<NodeRefresh> = Api::all(client.clone());
    let existing = policies
        .list(&ListParams::default())
        .await
        .context("NodeRefresh CRD is not queryable; install it with `crdgen | kubectl apply -f -`")?;
    info!(
        "CRD is queryable, found {} existing NodeRefresh resources",
        existing.items.len()
    );

    let configmaps = ConfigMapStatusStore::new(
        client.clone(),
        &config.controller_namespace,
        &config.state_configmap,
        &config.history_configmap,
    );
    configmaps
        .ensure()
        .await
        .context("Failed to create status ConfigMaps")?;
    let store: Arc<dyn StatusStore> = Arc::new(configmaps);
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));

    let machine = Arc::new(NodeRefreshStateMachine::new(
        Arc::clone(&cluster),
        Arc::clone(&store),
        &config,
    ));
    let reconciliation_loop = ReconciliationLoop::new(machine, Arc::clone(&store), &config);

    let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
    let error_backoff = config.policy_backoff();
    let controller_config = create_shared_config(config);
    let reconciler = Arc::new(Reconciler::new(
        client.clone(),
        cluster,
        store,
        trigger_tx,
        Arc::clone(&controller_config),
        error_backoff,
    ));

    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        nodes: Api::all(client.clone()),
        client,
        policies,
        reconciler,
        reconciliation_loop,
        triggers: trigger_rx,
        server_state,
        controller_config,
    })
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `LOG_LEVEL`. `LOG_FORMAT=json` selects
/// JSON output, anything else the human-readable format.
fn init_tracing(config: &ControllerConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "node_refresh_controller={}",
            config.log_level.to_lowercase()
        ))
    });
    let installed = if config.log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
}
