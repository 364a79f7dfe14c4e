//! # Controller
//!
//! Core controller modules for the Node Refresh Controller.
//!
//! - `request`: Refresh request record and phase transition table
//! - `state_machine`: One-step advance of a refresh request
//! - `planner`: Disruption-budget-aware eviction planning
//! - `health`: Pod, budget and replacement readiness checks
//! - `retry`: Per-phase exponential retry policy
//! - `trigger`: Trigger events feeding the reconciliation loop
//! - `queue`: Deduplicating per-node work queue
//! - `reconciliation_loop`: Worker pool driving refresh requests
//! - `schedule`: Due-node computation
//! - `backoff`: Fibonacci backoff for `NodeRefresh` reconciliation errors
//! - `reconciler`: `NodeRefresh` reconciliation
//! - `server`: HTTP server for metrics and health checks

pub mod backoff;
pub mod health;
pub mod planner;
pub mod queue;
pub mod reconciler;
pub mod reconciliation_loop;
pub mod request;
pub mod retry;
pub mod schedule;
pub mod server;
pub mod state_machine;
pub mod trigger;
