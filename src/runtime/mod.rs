//! # Runtime
//!
//! Process-level wiring of the controller.
//!
//! - `initialization`: rustls, tracing, metrics, server and component setup
//! - `watch_loop`: `NodeRefresh` controller with restart handling
//! - `error_policy`: Reconciliation backoff and watch error classification
//! - `shutdown`: Signal handling shared by the watch and reconciliation loops

pub mod error_policy;
pub mod initialization;
pub mod shutdown;
pub mod watch_loop;
