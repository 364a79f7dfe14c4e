//! Node Refresh Controller Library
//!
//! Core functionality of the Node Refresh Controller: the refresh state
//! machine and its eviction planning, the reconciliation loop driving it,
//! and the `NodeRefresh` reconciler that schedules refreshes.
//!
//! ## Quick Start
//!
//! ```rust
//! use node_refresh_controller::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod cluster;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
pub mod store;
