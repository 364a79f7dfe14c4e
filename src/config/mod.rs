//! # Configuration
//!
//! Controller configuration loaded from the environment and shared across
//! the runtime behind an async `RwLock`.

mod controller;

pub use controller::ControllerConfig;

use std::sync::Arc;
use tokio::sync::RwLock;

/// Controller configuration shared between the watch loop and the workers
pub type SharedControllerConfig = Arc<RwLock<ControllerConfig>>;

/// Wrap a configuration for sharing
#[must_use]
pub fn create_shared_config(config: ControllerConfig) -> SharedControllerConfig {
    Arc::new(RwLock::new(config))
}
