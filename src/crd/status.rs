//! # NodeRefresh Status
//!
//! Status types summarising the refreshes started for a `NodeRefresh`.

use serde::{Deserialize, Serialize};

/// Status of the NodeRefresh resource
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeRefreshStatus {
    /// Values: Idle, Running, Suspended, Failed
    #[serde(default)]
    pub phase: Option<String>,
    /// Human-readable description of current state
    #[serde(default)]
    pub message: Option<String>,
    /// Selected nodes with a refresh in progress
    #[serde(default)]
    pub current_nodes: Vec<String>,
    /// Selected nodes whose last refresh completed
    #[serde(default)]
    pub processed_nodes: Vec<String>,
    /// Selected nodes whose last refresh failed
    #[serde(default)]
    pub failed_nodes: Vec<FailedNode>,
    /// Earliest time a selected node becomes due (RFC3339)
    #[serde(default)]
    pub next_refresh_time: Option<String>,
    /// Last reconciliation time (RFC3339)
    #[serde(default)]
    pub last_reconcile_time: Option<String>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A node whose refresh ended in Failed
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailedNode {
    pub node_name: String,
    pub reason: String,
    /// Time of failure (RFC3339)
    pub timestamp: String,
}

/// Condition
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Summary phase of a `NodeRefresh`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyPhase {
    /// Nothing in progress
    Idle,
    /// At least one selected node is being refreshed
    Running,
    /// `spec.suspend` is set
    Suspended,
    /// The policy could not be evaluated
    Failed,
}

impl PolicyPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyPhase::Idle => "Idle",
            PolicyPhase::Running => "Running",
            PolicyPhase::Suspended => "Suspended",
            PolicyPhase::Failed => "Failed",
        }
    }
}
