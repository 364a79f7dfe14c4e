//! # NodeRefresh Reconciler
//!
//! Turns `NodeRefresh` policies into refresh triggers.
//!
//! ## Module Structure
//!
//! - `types.rs` - Reconciler context, errors and backoff state
//! - `policy.rs` - Due-node selection and status summary
//! - `status.rs` - Status conditions and patching
//! - `reconcile.rs` - Entry point called by the watch loop
//!
//! The reconciler never touches a node refresh itself: it only sends
//! [`TriggerEvent`](crate::controller::trigger::TriggerEvent)s to the
//! reconciliation loop, which owns every request.

pub mod policy;
pub mod reconcile;
pub mod status;
pub mod types;

pub use policy::{evaluate, plan, PolicyEvaluation, PolicySettings};
pub use reconcile::reconcile;
pub use types::{BackoffState, Reconciler, ReconcilerError};
