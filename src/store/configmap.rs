//! # ConfigMap Status Store
//!
//! Stores each request as one JSON entry of a ConfigMap in the controller
//! namespace: active requests in the state ConfigMap, archived ones in the
//! history ConfigMap. Writes are JSON merge patches touching a single key,
//! so concurrent workers refreshing different nodes never conflict.

use super::{decode, encode, expired_history, StatusStore, StoreError, StoreResult};
use crate::constants::FIELD_MANAGER;
use crate::controller::request::NodeRefreshRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

#[derive(Clone)]
pub struct ConfigMapStatusStore {
    api: Api<ConfigMap>,
    state_name: String,
    history_name: String,
}

impl std::fmt::Debug for ConfigMapStatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigMapStatusStore")
            .field("state_name", &self.state_name)
            .field("history_name", &self.history_name)
            .finish_non_exhaustive()
    }
}

fn backend(operation: &'static str, error: &kube::Error) -> StoreError {
    StoreError::Backend {
        operation,
        message: error.to_string(),
    }
}

impl ConfigMapStatusStore {
    #[must_use]
    pub fn new(client: Client, namespace: &str, state_name: &str, history_name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            state_name: state_name.to_string(),
            history_name: history_name.to_string(),
        }
    }

    /// Create both ConfigMaps if they do not exist yet
    pub async fn ensure(&self) -> StoreResult<()> {
        for name in [&self.state_name, &self.history_name] {
            self.create_if_missing(name).await?;
        }
        Ok(())
    }

    async fn create_if_missing(&self, name: &str) -> StoreResult<()> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        match self.api.create(&PostParams::default(), &cm).await {
            Ok(_) => {
                info!(configmap = %name, "created status ConfigMap");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(backend("create", &e)),
        }
    }

    /// Read all entries of a ConfigMap; a missing ConfigMap reads as empty
    async fn entries(&self, name: &str) -> StoreResult<Vec<NodeRefreshRequest>> {
        let data = match self.api.get_opt(name).await {
            Ok(Some(cm)) => cm.data.unwrap_or_default(),
            Ok(None) => return Ok(Vec::new()),
            Err(e) => return Err(backend("read", &e)),
        };
        data.iter().map(|(k, v)| decode(k, v)).collect()
    }

    /// Merge-patch one key; `None` removes it
    async fn patch_key(
        &self,
        operation: &'static str,
        name: &str,
        key: &str,
        value: Option<String>,
    ) -> StoreResult<()> {
        let patch = json!({ "data": { key: value } });
        let params = PatchParams::apply(FIELD_MANAGER);
        match self.api.patch(name, &params, &Patch::Merge(&patch)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 && value.is_some() => {
                debug!(configmap = %name, "status ConfigMap missing, creating");
                self.create_if_missing(name).await?;
                self.api
                    .patch(name, &params, &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
                    .map_err(|e| backend(operation, &e))
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(backend(operation, &e)),
        }
    }
}

impl ConfigMapStatusStore {
    /// Remove several keys with a single merge patch
    async fn remove_keys(&self, name: &str, keys: &[String]) -> StoreResult<()> {
        let data: Map<String, Value> = keys.iter().map(|k| (k.clone(), Value::Null)).collect();
        let patch = json!({ "data": data });
        let params = PatchParams::apply(FIELD_MANAGER);
        match self.api.patch(name, &params, &Patch::Merge(&patch)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(backend("prune", &e)),
        }
    }
}

#[async_trait]
impl StatusStore for ConfigMapStatusStore {
    async fn load(&self, node: &str) -> StoreResult<Option<NodeRefreshRequest>> {
        let cm = self
            .api
            .get_opt(&self.state_name)
            .await
            .map_err(|e| backend("load", &e))?;
        cm.and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(node))
            .map(|value| decode(node, &value))
            .transpose()
    }

    async fn save(&self, request: &NodeRefreshRequest) -> StoreResult<()> {
        let value = encode(request)?;
        self.patch_key("save", &self.state_name, &request.target_node_id, Some(value))
            .await
    }

    async fn list_active(&self) -> StoreResult<Vec<NodeRefreshRequest>> {
        self.entries(&self.state_name).await
    }

    async fn archive(&self, request: &NodeRefreshRequest) -> StoreResult<()> {
        let value = encode(request)?;
        // history first: a crash in between leaves a terminal active entry,
        // which the loop archives again on resync
        self.patch_key(
            "archive",
            &self.history_name,
            &request.target_node_id,
            Some(value),
        )
        .await?;
        self.patch_key("archive", &self.state_name, &request.target_node_id, None)
            .await
    }

    async fn history(&self) -> StoreResult<Vec<NodeRefreshRequest>> {
        self.entries(&self.history_name).await
    }

    async fn prune_history(
        &self,
        older_than: DateTime<Utc>,
        max_entries: usize,
    ) -> StoreResult<usize> {
        let history = self.entries(&self.history_name).await?;
        let expired = expired_history(&history, older_than, max_entries);
        if expired.is_empty() {
            return Ok(0);
        }
        self.remove_keys(&self.history_name, &expired).await?;
        info!(
            configmap = %self.history_name,
            dropped = expired.len(),
            kept = history.len() - expired.len(),
            "pruned refresh history"
        );
        Ok(expired.len())
    }
}
