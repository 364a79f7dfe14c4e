//! In-memory status store.
//!
//! Snapshots are kept serialized, so a reload goes through the same JSON
//! encoding as the ConfigMap store and behaves like a process restart.

use super::{decode, encode, expired_history, StatusStore, StoreError, StoreResult};
use crate::controller::request::NodeRefreshRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    active: BTreeMap<String, String>,
    history: BTreeMap<String, String>,
    failing_saves: usize,
    saves: usize,
}

#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    inner: Mutex<Inner>,
}

impl MemoryStatusStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` saves
    pub fn fail_next_saves(&self, times: usize) {
        self.inner().failing_saves = times;
    }

    /// Successful saves so far
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.inner().saves
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn load(&self, node: &str) -> StoreResult<Option<NodeRefreshRequest>> {
        let inner = self.inner();
        inner
            .active
            .get(node)
            .map(|value| decode(node, value))
            .transpose()
    }

    async fn save(&self, request: &NodeRefreshRequest) -> StoreResult<()> {
        let mut inner = self.inner();
        if inner.failing_saves > 0 {
            inner.failing_saves -= 1;
            return Err(StoreError::Backend {
                operation: "save",
                message: "injected failure".to_string(),
            });
        }
        let value = encode(request)?;
        inner.active.insert(request.target_node_id.clone(), value);
        inner.saves += 1;
        Ok(())
    }

    async fn list_active(&self) -> StoreResult<Vec<NodeRefreshRequest>> {
        let inner = self.inner();
        inner.active.iter().map(|(k, v)| decode(k, v)).collect()
    }

    async fn archive(&self, request: &NodeRefreshRequest) -> StoreResult<()> {
        let mut inner = self.inner();
        let value = encode(request)?;
        inner.history.insert(request.target_node_id.clone(), value);
        inner.active.remove(&request.target_node_id);
        Ok(())
    }

    async fn history(&self) -> StoreResult<Vec<NodeRefreshRequest>> {
        let inner = self.inner();
        inner.history.iter().map(|(k, v)| decode(k, v)).collect()
    }

    async fn prune_history(
        &self,
        older_than: DateTime<Utc>,
        max_entries: usize,
    ) -> StoreResult<usize> {
        let mut inner = self.inner();
        let history = inner
            .history
            .iter()
            .map(|(k, v)| decode(k, v))
            .collect::<StoreResult<Vec<_>>>()?;
        let expired = expired_history(&history, older_than, max_entries);
        for node in &expired {
            inner.history.remove(node);
        }
        Ok(expired.len())
    }
}
