//! # Node Refresh Request
//!
//! The persisted record of one node being replaced. Snapshots of this type
//! are what the status store holds, keyed by `target_node_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Phase of a node refresh
///
/// Phases advance in declaration order; `Failed` may be entered from any
/// non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum RefreshPhase {
    #[default]
    Pending,
    Provisioning,
    Cordoning,
    Draining,
    Verifying,
    Deleting,
    Completed,
    Failed,
}

impl RefreshPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshPhase::Pending => "Pending",
            RefreshPhase::Provisioning => "Provisioning",
            RefreshPhase::Cordoning => "Cordoning",
            RefreshPhase::Draining => "Draining",
            RefreshPhase::Verifying => "Verifying",
            RefreshPhase::Deleting => "Deleting",
            RefreshPhase::Completed => "Completed",
            RefreshPhase::Failed => "Failed",
        }
    }

    /// Completed and Failed accept no further transitions
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefreshPhase::Completed | RefreshPhase::Failed)
    }

    /// Whether moving from `self` to `next` respects phase monotonicity
    ///
    /// Allowed: staying in place (retry within phase), moving forward along
    /// the happy path, or jumping to Failed from a non-terminal phase.
    #[must_use]
    pub fn can_transition_to(&self, next: RefreshPhase) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next == RefreshPhase::Failed || next > *self
    }
}

impl fmt::Display for RefreshPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits a `NodeRefresh` places on the refreshes it requests
///
/// Unset fields leave the controller-wide behaviour in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshLimits {
    /// Largest eviction batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pods_to_move: Option<u32>,
    /// Healthy pods a disruption budget must keep while the node drains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_healthy_pods: Option<u32>,
    /// Seconds a drain may stay blocked by disruption budgets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_secs: Option<u64>,
    /// Seconds the replacement may take to become Ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_timeout_secs: Option<u64>,
}

impl RefreshLimits {
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn readiness_timeout(&self) -> Option<Duration> {
        self.readiness_timeout_secs.map(Duration::from_secs)
    }
}

/// One node (or node group) undergoing refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRefreshRequest {
    /// Node to retire
    pub target_node_id: String,
    /// Provisioned replacement; empty until provisioning completes
    #[serde(default)]
    pub replacement_node_id: String,
    /// Current phase
    #[serde(default)]
    pub phase: RefreshPhase,
    /// Retry attempts spent in the current phase
    #[serde(default)]
    pub attempt: u32,
    /// Last recorded failure reason
    #[serde(default)]
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Pods already evicted from the target (`namespace/name`); only grows
    #[serde(default)]
    pub drained_pods: BTreeSet<String>,
    /// When the current phase was entered
    #[serde(default)]
    pub phase_started_at: Option<DateTime<Utc>>,
    /// Consecutive drain evaluations blocked by a disruption budget
    #[serde(default)]
    pub contention: u32,
    #[serde(default, skip_serializing_if = "RefreshLimits::is_unbounded")]
    pub limits: RefreshLimits,
}

impl NodeRefreshRequest {
    /// Create a Pending request for `target_node_id`
    #[must_use]
    pub fn new(target_node_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            target_node_id: target_node_id.into(),
            replacement_node_id: String::new(),
            phase: RefreshPhase::Pending,
            attempt: 0,
            last_error: None,
            started_at,
            updated_at: started_at,
            drained_pods: BTreeSet::new(),
            phase_started_at: Some(started_at),
            contention: 0,
            limits: RefreshLimits::default(),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: RefreshLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    #[must_use]
    pub fn has_replacement(&self) -> bool {
        !self.replacement_node_id.is_empty()
    }

    /// How long the request has been in its current phase
    ///
    /// Records written before phase start times were kept fall back to
    /// `updated_at`.
    #[must_use]
    pub fn time_in_phase(&self, now: DateTime<Utc>) -> Duration {
        let started = self.phase_started_at.unwrap_or(self.updated_at);
        (now - started).to_std().unwrap_or(Duration::ZERO)
    }

    /// Move to `phase`, resetting the attempt counter and error
    pub(crate) fn enter(&mut self, phase: RefreshPhase, now: DateTime<Utc>) {
        debug_assert!(self.phase.can_transition_to(phase));
        self.phase = phase;
        self.attempt = 0;
        self.contention = 0;
        self.last_error = None;
        self.updated_at = now;
        self.phase_started_at = Some(now);
    }

    /// Record a failure that counts against the phase's attempt budget
    pub(crate) fn record_attempt(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.attempt = self.attempt.saturating_add(1);
        self.last_error = Some(error.into());
        self.updated_at = now;
    }

    /// Record an error without consuming an attempt
    pub(crate) fn record_error(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.last_error = Some(error.into());
        self.updated_at = now;
    }

    /// Record a wait on a disruption budget; grows the wait without
    /// consuming an attempt
    pub(crate) fn record_contention(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.contention = self.contention.saturating_add(1);
        self.record_error(error, now);
    }

    /// Move to Failed, keeping the attempt history
    pub(crate) fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.phase = RefreshPhase::Failed;
        self.last_error = Some(error.into());
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_monotonic() {
        let path = [
            RefreshPhase::Pending,
            RefreshPhase::Provisioning,
            RefreshPhase::Cordoning,
            RefreshPhase::Draining,
            RefreshPhase::Verifying,
            RefreshPhase::Deleting,
            RefreshPhase::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
            assert!(!pair[1].can_transition_to(pair[0]));
        }
    }

    #[test]
    fn test_failed_reachable_from_any_active_phase() {
        for phase in [
            RefreshPhase::Pending,
            RefreshPhase::Provisioning,
            RefreshPhase::Cordoning,
            RefreshPhase::Draining,
            RefreshPhase::Verifying,
            RefreshPhase::Deleting,
        ] {
            assert!(phase.can_transition_to(RefreshPhase::Failed));
        }
        assert!(!RefreshPhase::Completed.can_transition_to(RefreshPhase::Failed));
        assert!(!RefreshPhase::Failed.can_transition_to(RefreshPhase::Pending));
    }

    #[test]
    fn test_serialized_field_names() {
        let now = Utc::now();
        let mut request = NodeRefreshRequest::new("n1", now);
        request.drained_pods.insert("default/web-0".to_string());
        let value = serde_json::to_value(&request).unwrap();
        let object = value.as_object().unwrap();
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "attempt",
                "contention",
                "drainedPods",
                "lastError",
                "phase",
                "phaseStartedAt",
                "replacementNodeId",
                "startedAt",
                "targetNodeId",
                "updatedAt",
            ]
        );
        assert_eq!(value["phase"], "Pending");

        let limited = request.with_limits(RefreshLimits {
            drain_timeout_secs: Some(600),
            ..RefreshLimits::default()
        });
        let value = serde_json::to_value(&limited).unwrap();
        assert_eq!(value["limits"], serde_json::json!({ "drainTimeoutSecs": 600 }));
    }

    #[test]
    fn test_records_without_new_fields_still_load() {
        let json = serde_json::json!({
            "targetNodeId": "n1",
            "phase": "Draining",
            "startedAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:10:00Z"
        });
        let request: NodeRefreshRequest = serde_json::from_value(json).unwrap();
        assert!(request.limits.is_unbounded());
        assert_eq!(request.contention, 0);

        let now = "2024-01-01T00:15:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(request.time_in_phase(now), Duration::from_secs(300));
    }

    #[test]
    fn test_contention_is_separate_from_attempts() {
        let now = Utc::now();
        let mut request = NodeRefreshRequest::new("n1", now);
        request.record_contention("drain blocked by default/web", now);
        request.record_contention("drain blocked by default/web", now);
        assert_eq!(request.contention, 2);
        assert_eq!(request.attempt, 0);
        request.enter(RefreshPhase::Provisioning, now);
        assert_eq!(request.contention, 0);
    }

    #[test]
    fn test_enter_resets_attempts() {
        let now = Utc::now();
        let mut request = NodeRefreshRequest::new("n1", now);
        request.record_attempt("boom", now);
        request.record_attempt("boom", now);
        assert_eq!(request.attempt, 2);
        request.enter(RefreshPhase::Provisioning, now);
        assert_eq!(request.attempt, 0);
        assert!(request.last_error.is_none());
    }
}
