//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `node_refresh_advances_total` - State machine evaluations, by phase
//! - `node_refresh_phase_transitions_total` - Phase changes, by source and destination phase
//! - `node_refresh_advance_duration_seconds` - Duration of a single state machine evaluation
//! - `node_refresh_evictions_total` - Pods evicted from refreshed nodes
//! - `node_refresh_drain_blocked_total` - Drain evaluations blocked by disruption budgets
//! - `node_refresh_completed_total` - Refreshes that reached Completed
//! - `node_refresh_failed_total` - Refreshes that reached Failed
//! - `node_refresh_in_flight` - Refreshes currently being evaluated by a worker
//! - `node_refresh_loop_errors_total` - Store/cluster errors caught by the reconciliation loop, by stage
//! - `node_refresh_triggers_total` - Trigger events received, by source
//! - `node_refresh_policy_reconciliations_total` - `NodeRefresh` reconciliations
//! - `node_refresh_policy_reconciliation_errors_total` - `NodeRefresh` reconciliation errors

use anyhow::Result;
use prometheus::core::Collector;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static ADVANCES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "node_refresh_advances_total",
            "Total number of state machine evaluations",
        ),
        &["phase"],
    )
    .expect("Failed to create ADVANCES_TOTAL metric - this should never happen")
});

static PHASE_TRANSITIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "node_refresh_phase_transitions_total",
            "Total number of refresh phase transitions",
        ),
        &["from", "to"],
    )
    .expect("Failed to create PHASE_TRANSITIONS_TOTAL metric - this should never happen")
});

static ADVANCE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "node_refresh_advance_duration_seconds",
            "Duration of a single state machine evaluation in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )
    .expect("Failed to create ADVANCE_DURATION metric - this should never happen")
});

static EVICTIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "node_refresh_evictions_total",
        "Total number of pods evicted from refreshed nodes",
    )
    .expect("Failed to create EVICTIONS_TOTAL metric - this should never happen")
});

static DRAIN_BLOCKED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "node_refresh_drain_blocked_total",
        "Total number of drain evaluations blocked by disruption budgets",
    )
    .expect("Failed to create DRAIN_BLOCKED_TOTAL metric - this should never happen")
});

static COMPLETED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "node_refresh_completed_total",
        "Total number of node refreshes completed",
    )
    .expect("Failed to create COMPLETED_TOTAL metric - this should never happen")
});

static FAILED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "node_refresh_failed_total",
        "Total number of node refreshes failed",
    )
    .expect("Failed to create FAILED_TOTAL metric - this should never happen")
});

static IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "node_refresh_in_flight",
        "Current number of node refreshes being evaluated",
    )
    .expect("Failed to create IN_FLIGHT metric - this should never happen")
});

static LOOP_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "node_refresh_loop_errors_total",
            "Total number of errors caught by the reconciliation loop",
        ),
        &["stage"],
    )
    .expect("Failed to create LOOP_ERRORS_TOTAL metric - this should never happen")
});

static TRIGGERS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "node_refresh_triggers_total",
            "Total number of refresh trigger events received",
        ),
        &["source"],
    )
    .expect("Failed to create TRIGGERS_TOTAL metric - this should never happen")
});

static POLICY_RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "node_refresh_policy_reconciliations_total",
        "Total number of NodeRefresh reconciliations",
    )
    .expect("Failed to create POLICY_RECONCILIATIONS_TOTAL metric - this should never happen")
});

static POLICY_RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "node_refresh_policy_reconciliation_errors_total",
        "Total number of NodeRefresh reconciliation errors",
    )
    .expect(
        "Failed to create POLICY_RECONCILIATION_ERRORS_TOTAL metric - this should never happen",
    )
});

/// Register every metric with [`REGISTRY`]; safe to call more than once
pub fn register_metrics() -> Result<()> {
    register(ADVANCES_TOTAL.clone())?;
    register(PHASE_TRANSITIONS_TOTAL.clone())?;
    register(ADVANCE_DURATION.clone())?;
    register(EVICTIONS_TOTAL.clone())?;
    register(DRAIN_BLOCKED_TOTAL.clone())?;
    register(COMPLETED_TOTAL.clone())?;
    register(FAILED_TOTAL.clone())?;
    register(IN_FLIGHT.clone())?;
    register(LOOP_ERRORS_TOTAL.clone())?;
    register(TRIGGERS_TOTAL.clone())?;
    register(POLICY_RECONCILIATIONS_TOTAL.clone())?;
    register(POLICY_RECONCILIATION_ERRORS_TOTAL.clone())?;

    Ok(())
}

fn register<C: Collector + 'static>(collector: C) -> Result<()> {
    match REGISTRY.register(Box::new(collector)) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn increment_advances(phase: &str) {
    ADVANCES_TOTAL.with_label_values(&[phase]).inc();
}

pub fn increment_phase_transitions(from: &str, to: &str) {
    PHASE_TRANSITIONS_TOTAL.with_label_values(&[from, to]).inc();
}

pub fn observe_advance_duration(duration: f64) {
    ADVANCE_DURATION.observe(duration);
}

pub fn increment_evictions() {
    EVICTIONS_TOTAL.inc();
}

pub fn increment_drain_blocked() {
    DRAIN_BLOCKED_TOTAL.inc();
}

pub fn increment_completed() {
    COMPLETED_TOTAL.inc();
}

pub fn increment_failed() {
    FAILED_TOTAL.inc();
}

pub fn inc_in_flight() {
    IN_FLIGHT.inc();
}

pub fn dec_in_flight() {
    IN_FLIGHT.dec();
}

pub fn increment_loop_errors(stage: &str) {
    LOOP_ERRORS_TOTAL.with_label_values(&[stage]).inc();
}

pub fn increment_triggers(source: &str) {
    TRIGGERS_TOTAL.with_label_values(&[source]).inc();
}

pub fn increment_policy_reconciliations() {
    POLICY_RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_policy_reconciliation_errors() {
    POLICY_RECONCILIATION_ERRORS_TOTAL.inc();
}
