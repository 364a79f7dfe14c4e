//! # Types
//!
//! Context and error types for the `NodeRefresh` reconciler.

use crate::cluster::{ClusterClient, ClusterError};
use crate::config::SharedControllerConfig;
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::trigger::TriggerEvent;
use crate::store::{StatusStore, StoreError};
use kube::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("failed to list target nodes: {0}")]
    Cluster(#[from] ClusterError),

    #[error("failed to read refresh state: {0}")]
    Store(#[from] StoreError),

    #[error("trigger channel closed while requesting refresh of {0}")]
    TriggerChannelClosed(String),

    #[error("failed to update status: {0}")]
    Status(#[source] kube::Error),
}

/// Backoff state for a specific `NodeRefresh`
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    #[must_use]
    pub fn new(backoff: FibonacciBackoff) -> Self {
        Self {
            backoff,
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Shared context handed to every `NodeRefresh` reconciliation
#[derive(Clone)]
pub struct Reconciler {
    pub client: Client,
    pub cluster: Arc<dyn ClusterClient>,
    pub store: Arc<dyn StatusStore>,
    /// Feeds the reconciliation loop
    pub triggers: mpsc::Sender<TriggerEvent>,
    pub config: SharedControllerConfig,
    /// Initial state of every per-resource backoff
    pub error_backoff: FibonacciBackoff,
    // Keyed by resource name; NodeRefresh is cluster-scoped
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("trigger_capacity", &self.triggers.capacity())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        client: Client,
        cluster: Arc<dyn ClusterClient>,
        store: Arc<dyn StatusStore>,
        triggers: mpsc::Sender<TriggerEvent>,
        config: SharedControllerConfig,
        error_backoff: FibonacciBackoff,
    ) -> Self {
        Self {
            client,
            cluster,
            store,
            triggers,
            config,
            error_backoff,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record an error for `name` and return the requeue delay and error count
    pub fn next_error_backoff(&self, name: &str) -> Option<(std::time::Duration, u32)> {
        let mut states = self.backoff_states.lock().ok()?;
        let state = states
            .entry(name.to_string())
            .or_insert_with(|| BackoffState::new(self.error_backoff.clone()));
        state.increment_error();
        Some((state.backoff.next_backoff(), state.error_count))
    }

    /// Forget the error backoff of a resource after a successful reconciliation
    pub fn reset_backoff(&self, name: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(name) {
                state.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_backoff_state_reset_restarts_sequence() {
        let mut state = BackoffState::new(FibonacciBackoff::new(
            Duration::from_secs(10),
            Duration::from_secs(100),
        ));
        state.increment_error();
        state.increment_error();
        state.backoff.next_backoff_seconds();
        state.backoff.next_backoff_seconds();
        assert_eq!(state.backoff.next_backoff_seconds(), 20);

        state.reset();
        assert_eq!(state.error_count, 0);
        assert_eq!(state.backoff.next_backoff_seconds(), 10);
    }
}
