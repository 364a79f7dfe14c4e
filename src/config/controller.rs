//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use crate::controller::backoff::FibonacciBackoff;
use crate::controller::retry::RetryPolicy;
use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// HTTP port for metrics and probes
    pub metrics_port: u16,
    /// Namespace where the controller is deployed (status ConfigMaps live here)
    pub controller_namespace: String,
    /// ConfigMap holding active refresh requests
    pub state_configmap: String,
    /// ConfigMap holding archived refresh requests
    pub history_configmap: String,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
    /// Maximum concurrent node refreshes processed by the worker pool
    pub max_concurrent_reconciliations: usize,
    /// Periodic resync over the status store (seconds)
    pub resync_interval_secs: u64,
    /// Fixed poll interval while waiting for a replacement node (seconds)
    pub provisioning_poll_secs: u64,
    /// Timeout applied to every cluster call (seconds)
    pub cluster_call_timeout_secs: u64,
    /// Retry base delay (milliseconds)
    pub retry_base_ms: u64,
    /// Retry maximum delay (seconds)
    pub retry_max_secs: u64,
    /// Attempts per phase before the request moves to Failed
    pub retry_max_attempts: u32,
    /// Jitter factor in `[0, 0.5]`
    pub retry_jitter: f64,
    /// Eviction batch size for pods without a disruption budget
    pub max_unbudgeted_evictions: usize,
    /// Wait before a failed node becomes due again (seconds)
    pub failed_retry_interval_secs: u64,
    /// Age after which archived refreshes are pruned (seconds)
    pub history_retention_secs: u64,
    /// Archived refreshes kept at most
    pub history_max_entries: usize,
    /// Requeue interval after an unexpected reconciliation error (seconds)
    pub reconciliation_error_requeue_secs: u64,
    /// Cap of the per-policy error backoff (seconds)
    pub policy_backoff_max_secs: u64,
    /// Initial backoff after a throttled watch stream (milliseconds)
    pub watch_backoff_start_ms: u64,
    /// Maximum backoff after a throttled watch stream (milliseconds)
    pub watch_backoff_max_ms: u64,
    /// Delay before restarting a failed or ended watch (seconds)
    pub watch_restart_delay_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            controller_namespace: DEFAULT_CONTROLLER_NAMESPACE.to_string(),
            state_configmap: DEFAULT_STATE_CONFIGMAP.to_string(),
            history_configmap: DEFAULT_HISTORY_CONFIGMAP.to_string(),
            log_level: "INFO".to_string(),
            log_format: "json".to_string(),
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            provisioning_poll_secs: DEFAULT_PROVISIONING_POLL_SECS,
            cluster_call_timeout_secs: DEFAULT_CLUSTER_CALL_TIMEOUT_SECS,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            retry_max_secs: DEFAULT_RETRY_MAX_SECS,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_jitter: DEFAULT_RETRY_JITTER,
            max_unbudgeted_evictions: DEFAULT_MAX_UNBUDGETED_EVICTIONS,
            failed_retry_interval_secs: DEFAULT_FAILED_RETRY_INTERVAL_SECS,
            history_retention_secs: DEFAULT_HISTORY_RETENTION_SECS,
            history_max_entries: DEFAULT_HISTORY_MAX_ENTRIES,
            reconciliation_error_requeue_secs: DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS,
            policy_backoff_max_secs: DEFAULT_POLICY_BACKOFF_MAX_SECS,
            watch_backoff_start_ms: DEFAULT_WATCH_BACKOFF_START_MS,
            watch_backoff_max_ms: DEFAULT_WATCH_BACKOFF_MAX_MS,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            metrics_port: env_var_or_default("METRICS_PORT", defaults.metrics_port),
            controller_namespace: env_var_or_default_str(
                "POD_NAMESPACE",
                &defaults.controller_namespace,
            ),
            state_configmap: env_var_or_default_str("STATE_CONFIGMAP", &defaults.state_configmap),
            history_configmap: env_var_or_default_str(
                "HISTORY_CONFIGMAP",
                &defaults.history_configmap,
            ),
            log_level: env_var_or_default_str("LOG_LEVEL", &defaults.log_level),
            log_format: env_var_or_default_str("LOG_FORMAT", &defaults.log_format),
            max_concurrent_reconciliations: env_var_or_default(
                "MAX_CONCURRENT_RECONCILIATIONS",
                defaults.max_concurrent_reconciliations,
            )
            .max(1),
            resync_interval_secs: env_var_or_default(
                "RESYNC_INTERVAL_SECS",
                defaults.resync_interval_secs,
            ),
            provisioning_poll_secs: env_var_or_default(
                "PROVISIONING_POLL_SECS",
                defaults.provisioning_poll_secs,
            ),
            cluster_call_timeout_secs: env_var_or_default(
                "CLUSTER_CALL_TIMEOUT_SECS",
                defaults.cluster_call_timeout_secs,
            ),
            retry_base_ms: env_var_or_default("RETRY_BASE_MS", defaults.retry_base_ms),
            retry_max_secs: env_var_or_default("RETRY_MAX_SECS", defaults.retry_max_secs),
            retry_max_attempts: env_var_or_default(
                "RETRY_MAX_ATTEMPTS",
                defaults.retry_max_attempts,
            ),
            retry_jitter: env_var_or_default("RETRY_JITTER", defaults.retry_jitter),
            max_unbudgeted_evictions: env_var_or_default(
                "MAX_UNBUDGETED_EVICTIONS",
                defaults.max_unbudgeted_evictions,
            )
            .max(1),
            failed_retry_interval_secs: env_var_or_default(
                "FAILED_RETRY_INTERVAL_SECS",
                defaults.failed_retry_interval_secs,
            ),
            history_retention_secs: env_var_or_default(
                "HISTORY_RETENTION_SECS",
                defaults.history_retention_secs,
            ),
            history_max_entries: env_var_or_default(
                "HISTORY_MAX_ENTRIES",
                defaults.history_max_entries,
            )
            .max(1),
            reconciliation_error_requeue_secs: env_var_or_default(
                "RECONCILIATION_ERROR_REQUEUE_SECS",
                defaults.reconciliation_error_requeue_secs,
            ),
            policy_backoff_max_secs: env_var_or_default(
                "POLICY_BACKOFF_MAX_SECS",
                defaults.policy_backoff_max_secs,
            ),
            watch_backoff_start_ms: env_var_or_default(
                "WATCH_BACKOFF_START_MS",
                defaults.watch_backoff_start_ms,
            ),
            watch_backoff_max_ms: env_var_or_default(
                "WATCH_BACKOFF_MAX_MS",
                defaults.watch_backoff_max_ms,
            ),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                defaults.watch_restart_delay_secs,
            ),
        }
    }

    /// Retry policy shared by every mutating phase
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_secs(self.retry_max_secs),
            self.retry_max_attempts,
        )
        .with_jitter(self.retry_jitter)
    }

    /// Get resync interval duration
    #[must_use]
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Get provisioning poll duration
    #[must_use]
    pub fn provisioning_poll_interval(&self) -> Duration {
        Duration::from_secs(self.provisioning_poll_secs)
    }

    /// Get cluster call timeout duration
    #[must_use]
    pub fn cluster_call_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_call_timeout_secs)
    }

    /// Get failed retry interval duration
    #[must_use]
    pub fn failed_retry_interval(&self) -> Duration {
        Duration::from_secs(self.failed_retry_interval_secs)
    }

    /// Get history retention duration
    ///
    /// Never shorter than the failed-retry interval, so a recent failure
    /// still holds its node back from the schedule.
    #[must_use]
    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs.max(self.failed_retry_interval_secs))
    }

    /// Backoff used after `NodeRefresh` reconciliation errors
    #[must_use]
    pub fn policy_backoff(&self) -> FibonacciBackoff {
        FibonacciBackoff::new(
            self.reconciliation_error_requeue_duration(),
            Duration::from_secs(self.policy_backoff_max_secs),
        )
    }

    /// Get reconciliation error requeue duration
    #[must_use]
    pub fn reconciliation_error_requeue_duration(&self) -> Duration {
        Duration::from_secs(self.reconciliation_error_requeue_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
