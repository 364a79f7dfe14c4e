//! Refresh trigger events consumed by the reconciliation loop.

use crate::controller::request::RefreshLimits;
use chrono::{DateTime, Utc};
use std::fmt;

/// Why a node refresh was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerSource {
    /// Node became due according to its `NodeRefresh` schedule
    Schedule,
    /// Explicit request through the refresh-now node annotation
    Manual,
    /// Periodic resync over the status store
    Resync,
}

impl TriggerSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Schedule => "schedule",
            TriggerSource::Manual => "manual",
            TriggerSource::Resync => "resync",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to refresh a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub target_node_id: String,
    pub requested_at: DateTime<Utc>,
    pub source: TriggerSource,
    /// Limits the created request runs under
    pub limits: RefreshLimits,
}

impl TriggerEvent {
    #[must_use]
    pub fn new(target_node_id: impl Into<String>, source: TriggerSource) -> Self {
        Self {
            target_node_id: target_node_id.into(),
            requested_at: Utc::now(),
            source,
            limits: RefreshLimits::default(),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: RefreshLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Of two pending triggers for the same node, keep the one that carries
    /// more intent: a manual request outranks schedule and resync
    #[must_use]
    pub fn merge(self, other: TriggerEvent) -> TriggerEvent {
        if self.source == TriggerSource::Manual && other.source != TriggerSource::Manual {
            self
        } else {
            other
        }
    }
}
