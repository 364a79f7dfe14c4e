//! # Status Store
//!
//! Key-value store of `NodeRefreshRequest` snapshots keyed by target node.
//!
//! Active requests and archived (terminal) requests live in separate
//! namespaces of the store. Archiving moves a request from the active set
//! into history; history keeps the latest outcome per node. History is
//! bounded by [`StatusStore::prune_history`], which drops entries past a
//! retention age and then the oldest beyond an entry cap.

mod configmap;
mod memory;

pub use configmap::ConfigMapStatusStore;
pub use memory::MemoryStatusStore;

use crate::controller::request::NodeRefreshRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors returned by status store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store rejected or failed the operation
    #[error("status store {operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
    /// A stored snapshot could not be encoded or decoded
    #[error("status store entry {key} is not valid: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence of refresh requests
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Active request for a node, if any
    async fn load(&self, node: &str) -> StoreResult<Option<NodeRefreshRequest>>;

    /// Create or replace the active request for `request.target_node_id`
    async fn save(&self, request: &NodeRefreshRequest) -> StoreResult<()>;

    /// All active requests, ordered by node
    async fn list_active(&self) -> StoreResult<Vec<NodeRefreshRequest>>;

    /// Move a request out of the active set into history
    async fn archive(&self, request: &NodeRefreshRequest) -> StoreResult<()>;

    /// Latest archived request per node, ordered by node
    async fn history(&self) -> StoreResult<Vec<NodeRefreshRequest>>;

    /// Drop archived requests last updated before `older_than`, then the
    /// oldest ones beyond `max_entries`; returns the number dropped
    async fn prune_history(
        &self,
        older_than: DateTime<Utc>,
        max_entries: usize,
    ) -> StoreResult<usize>;
}

/// Nodes whose archived request `prune_history` drops
pub(crate) fn expired_history(
    history: &[NodeRefreshRequest],
    older_than: DateTime<Utc>,
    max_entries: usize,
) -> Vec<String> {
    let mut newest_first: Vec<&NodeRefreshRequest> = history.iter().collect();
    newest_first.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.target_node_id.cmp(&b.target_node_id))
    });
    newest_first
        .into_iter()
        .enumerate()
        .filter(|(rank, r)| *rank >= max_entries || r.updated_at < older_than)
        .map(|(_, r)| r.target_node_id.clone())
        .collect()
}

pub(crate) fn encode(request: &NodeRefreshRequest) -> StoreResult<String> {
    serde_json::to_string(request).map_err(|source| StoreError::Codec {
        key: request.target_node_id.clone(),
        source,
    })
}

pub(crate) fn decode(key: &str, value: &str) -> StoreResult<NodeRefreshRequest> {
    serde_json::from_str(value).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn archived(node: &str, age_hours: i64, now: DateTime<Utc>) -> NodeRefreshRequest {
        let mut request = NodeRefreshRequest::new(node, now - Duration::hours(age_hours));
        request.updated_at = now - Duration::hours(age_hours);
        request
    }

    #[test]
    fn test_expired_history_drops_stale_then_oldest() {
        let now = Utc::now();
        let history = vec![
            archived("a", 1, now),
            archived("b", 200, now),
            archived("c", 2, now),
            archived("d", 3, now),
            archived("e", 4, now),
        ];

        let mut expired = expired_history(&history, now - Duration::days(7), 3);
        expired.sort();
        // b is past retention, e is the oldest beyond the cap
        assert_eq!(expired, vec!["b", "e"]);

        assert!(expired_history(&history, now - Duration::days(30), 10).is_empty());
    }
}
