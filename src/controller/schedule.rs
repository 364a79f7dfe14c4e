//! # Schedule Table
//!
//! Explicit, queryable view of which nodes are due for refresh.
//!
//! A node is due once it has been running for the refresh interval. A node
//! whose last refresh failed waits out the failed-retry interval first.
//! Nodes that are cordoned, not Ready or already being refreshed are never
//! due. The table is plain data rebuilt on each `NodeRefresh` reconciliation;
//! emitting triggers for due nodes is the caller's business.

use crate::cluster::NodeStatus;
use crate::controller::request::{NodeRefreshRequest, RefreshPhase};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Why a node is or is not eligible for a scheduled refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// A refresh is already in progress
    Active,
    /// Node is unschedulable
    Cordoned,
    /// Node does not report Ready
    NotReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub node: String,
    pub due_at: DateTime<Utc>,
    pub eligibility: Eligibility,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleTable {
    entries: BTreeMap<String, ScheduleEntry>,
}

impl ScheduleTable {
    /// Build the table for `nodes`
    ///
    /// `active` holds nodes with a refresh in progress and `history` the
    /// archived outcome per node. Nodes with an unknown creation time are
    /// due at `now`.
    #[must_use]
    pub fn build(
        nodes: &[NodeStatus],
        active: &BTreeSet<String>,
        history: &[NodeRefreshRequest],
        now: DateTime<Utc>,
        interval: Duration,
        failed_retry: Duration,
    ) -> Self {
        let failed_at: BTreeMap<&str, DateTime<Utc>> = history
            .iter()
            .filter(|r| r.phase == RefreshPhase::Failed)
            .map(|r| (r.target_node_id.as_str(), r.updated_at))
            .collect();

        let entries = nodes
            .iter()
            .map(|node| {
                let mut due_at = node.created_at.map_or(now, |created| created + interval);
                if let Some(failed) = failed_at.get(node.name.as_str()) {
                    due_at = due_at.max(*failed + failed_retry);
                }
                let eligibility = if active.contains(&node.name) {
                    Eligibility::Active
                } else if node.unschedulable {
                    Eligibility::Cordoned
                } else if !node.ready {
                    Eligibility::NotReady
                } else {
                    Eligibility::Eligible
                };
                (
                    node.name.clone(),
                    ScheduleEntry {
                        node: node.name.clone(),
                        due_at,
                        eligibility,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Eligible nodes due at `now`, in ascending name order
    #[must_use]
    pub fn due(&self, now: DateTime<Utc>) -> Vec<&str> {
        self.entries
            .values()
            .filter(|e| e.eligibility == Eligibility::Eligible && e.due_at <= now)
            .map(|e| e.node.as_str())
            .collect()
    }

    /// Earliest future due time among eligible nodes
    #[must_use]
    pub fn next_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .values()
            .filter(|e| e.eligibility == Eligibility::Eligible && e.due_at > now)
            .map(|e| e.due_at)
            .min()
    }

    #[must_use]
    pub fn entry(&self, node: &str) -> Option<&ScheduleEntry> {
        self.entries.get(node)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
