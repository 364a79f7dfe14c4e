//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// API group of the `NodeRefresh` custom resource
pub const API_GROUP: &str = "operations.example.com";

/// Field manager used for server-side patches
pub const FIELD_MANAGER: &str = "node-refresh-controller";

/// Label set on replacement nodes pointing at the node they replace
pub const REPLACES_LABEL: &str = "operations.example.com/replaces";

/// Node annotation requesting an immediate refresh (manual trigger)
pub const REFRESH_NOW_ANNOTATION: &str = "operations.example.com/refresh-now";

/// Suffix appended to a target node name to derive its replacement name
pub const REPLACEMENT_SUFFIX: &str = "-refresh";

/// Maximum length of a node name (DNS label)
pub const MAX_NODE_NAME_LEN: usize = 63;

/// Hex digits of the target hash in replacement names that had to be shortened
pub const REPLACEMENT_HASH_LEN: usize = 8;

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default controller namespace (status ConfigMaps live here)
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "node-refresh-operator";

/// Default ConfigMap holding active refresh requests
pub const DEFAULT_STATE_CONFIGMAP: &str = "node-refresh-state";

/// Default ConfigMap holding archived refresh requests
pub const DEFAULT_HISTORY_CONFIGMAP: &str = "node-refresh-history";

/// Default number of nodes refreshed in parallel by the worker pool
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: usize = 4;

/// Default interval of the periodic resync over the status store (seconds)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 30;

/// Default poll interval while a replacement node is being provisioned (seconds)
pub const DEFAULT_PROVISIONING_POLL_SECS: u64 = 15;

/// Default timeout applied to every cluster call (seconds)
pub const DEFAULT_CLUSTER_CALL_TIMEOUT_SECS: u64 = 30;

/// Default retry base delay (milliseconds)
pub const DEFAULT_RETRY_BASE_MS: u64 = 2_000;

/// Default retry maximum delay (seconds)
pub const DEFAULT_RETRY_MAX_SECS: u64 = 300;

/// Default number of attempts per phase before a request fails
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// Default jitter factor applied to retry delays
pub const DEFAULT_RETRY_JITTER: f64 = 0.2;

/// Default eviction batch size for pods not covered by a disruption budget
pub const DEFAULT_MAX_UNBUDGETED_EVICTIONS: usize = 3;

/// Default wait before a node whose refresh failed becomes due again (seconds)
pub const DEFAULT_FAILED_RETRY_INTERVAL_SECS: u64 = 3_600;

/// Default requeue interval for reconciliation errors (seconds)
pub const DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS: u64 = 60;

/// Default cap of the per-policy error backoff (seconds)
pub const DEFAULT_POLICY_BACKOFF_MAX_SECS: u64 = 600;

/// Default initial backoff after a throttled watch stream (milliseconds)
pub const DEFAULT_WATCH_BACKOFF_START_MS: u64 = 500;

/// Default maximum backoff after a throttled watch stream (milliseconds)
pub const DEFAULT_WATCH_BACKOFF_MAX_MS: u64 = 30_000;

/// Default delay before restarting a failed or ended watch (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default refresh interval when a `NodeRefresh` does not set one (days)
pub const DEFAULT_INTERVAL_DAYS: u32 = 3;

/// Default `podManagement.maxPodsToMove`
pub const DEFAULT_MAX_PODS_TO_MOVE: u32 = 3;

/// Default `podManagement.minHealthyPods`
pub const DEFAULT_MIN_HEALTHY_PODS: u32 = 2;

/// Default `podManagement.drainTimeout` (seconds)
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 600;

/// Default `healthChecks.readinessTimeout` (seconds)
pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 300;

/// Default age after which archived refreshes are pruned from history (seconds)
pub const DEFAULT_HISTORY_RETENTION_SECS: u64 = 7 * 24 * 3_600;

/// Default maximum number of archived refreshes kept in history
pub const DEFAULT_HISTORY_MAX_ENTRIES: usize = 200;

/// Capacity of the trigger channel feeding the reconciliation loop
pub const TRIGGER_CHANNEL_CAPACITY: usize = 256;
