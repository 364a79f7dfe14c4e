//! # Kubernetes Cluster Client
//!
//! `ClusterClient` implementation backed by the Kubernetes API.
//!
//! Replacement nodes are provisioned by creating a `Node` object carrying the
//! target's labels. Node providers that register machines from `Node`
//! objects (virtual kubelets, KWOK, bare-metal registration hooks) pick the
//! request up from there; the controller only waits for the node to report
//! Ready.

use super::{
    pod_id, split_id, ClusterClient, ClusterError, ClusterResult, DisruptionBudget, NodeSpec,
    NodeStatus, PodInfo, PodPhase,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Annotation the kubelet sets on mirror pods
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Cluster client talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Resolve the disruption budget covering each pod, one list per namespace
    async fn budgets_by_namespace(
        &self,
        namespaces: impl Iterator<Item = &str>,
    ) -> ClusterResult<HashMap<String, Vec<PodDisruptionBudget>>> {
        let mut budgets = HashMap::new();
        for namespace in namespaces {
            if budgets.contains_key(namespace) {
                continue;
            }
            let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
            let mut list = api
                .list(&ListParams::default())
                .await
                .map_err(|e| map_kube_error("list_disruption_budgets", "PodDisruptionBudget", namespace, e))?
                .items;
            list.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
            budgets.insert(namespace.to_string(), list);
        }
        Ok(budgets)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_node(&self, node: &str) -> ClusterResult<NodeStatus> {
        self.nodes()
            .get(node)
            .await
            .map(|n| node_status(&n))
            .map_err(|e| map_kube_error("get_node", "Node", node, e))
    }

    async fn list_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<NodeStatus>> {
        let label_selector = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let params = if label_selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(&label_selector)
        };
        let nodes = self
            .nodes()
            .list(&params)
            .await
            .map_err(|e| map_kube_error("list_nodes", "Node", &label_selector, e))?;
        Ok(nodes.items.iter().map(node_status).collect())
    }

    async fn list_pods(&self, node: &str) -> ClusterResult<Vec<PodInfo>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default().fields(&format!("spec.nodeName={node}")))
            .await
            .map_err(|e| map_kube_error("list_pods", "Pod", node, e))?
            .items;

        let budgets = self
            .budgets_by_namespace(pods.iter().filter_map(|p| p.metadata.namespace.as_deref()))
            .await?;

        Ok(pods
            .iter()
            .map(|pod| {
                let mut info = pod_info(pod);
                let labels = pod.metadata.labels.clone().unwrap_or_default();
                info.budget = budgets.get(&info.namespace).and_then(|list| {
                    list.iter()
                        .find(|pdb| {
                            pdb.spec
                                .as_ref()
                                .is_some_and(|s| selector_matches(s.selector.as_ref(), &labels))
                        })
                        .and_then(|pdb| pdb.metadata.name.as_deref())
                        .map(|name| pod_id(&info.namespace, name))
                });
                info
            })
            .collect())
    }

    async fn get_disruption_budget(&self, scope: &str) -> ClusterResult<DisruptionBudget> {
        let (namespace, name) = split_id(scope);
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        let pdb = api
            .get(name)
            .await
            .map_err(|e| map_kube_error("get_disruption_budget", "PodDisruptionBudget", scope, e))?;
        let status = pdb.status.unwrap_or_default();
        Ok(DisruptionBudget {
            scope: scope.to_string(),
            disruptions_allowed: non_negative(status.disruptions_allowed),
            current_healthy: non_negative(status.current_healthy),
            desired_healthy: non_negative(status.desired_healthy),
        })
    }

    async fn cordon(&self, node: &str) -> ClusterResult<()> {
        let patch = serde_json::json!({ "spec": { "unschedulable": true } });
        self.nodes()
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error("cordon", "Node", node, e))?;
        debug!(node = %node, "node cordoned");
        Ok(())
    }

    async fn evict(&self, pod: &str) -> ClusterResult<()> {
        let (namespace, name) = split_id(pod);
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.evict(name, &EvictParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 429 => {
                Err(ClusterError::DisruptionBudget {
                    pod: pod.to_string(),
                    message: api_err.message.clone(),
                })
            }
            Err(e) => Err(map_kube_error("evict", "Pod", pod, e)),
        }
    }

    async fn delete_node(&self, node: &str) -> ClusterResult<()> {
        self.nodes()
            .delete(node, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error("delete_node", "Node", node, e))?;
        Ok(())
    }

    async fn create_node(&self, spec: &NodeSpec) -> ClusterResult<String> {
        let node = Node {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                labels: Some(spec.labels.clone()),
                ..ObjectMeta::default()
            },
            ..Node::default()
        };
        let created = self
            .nodes()
            .create(&PostParams::default(), &node)
            .await
            .map_err(|e| map_kube_error("create_node", "Node", &spec.name, e))?;
        Ok(created.metadata.name.unwrap_or_else(|| spec.name.clone()))
    }

    async fn get_node_status(&self, node: &str) -> ClusterResult<NodeStatus> {
        self.nodes()
            .get_status(node)
            .await
            .map(|n| node_status(&n))
            .map_err(|e| map_kube_error("get_node_status", "Node", node, e))
    }

    async fn remove_node_annotation(&self, node: &str, key: &str) -> ClusterResult<()> {
        let patch = serde_json::json!({ "metadata": { "annotations": { key: null } } });
        self.nodes()
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error("remove_node_annotation", "Node", node, e))?;
        Ok(())
    }
}

/// Classify a kube error into the cluster error taxonomy
fn map_kube_error(
    operation: &'static str,
    kind: &'static str,
    name: &str,
    error: kube::Error,
) -> ClusterError {
    match error {
        kube::Error::Api(api_err) if api_err.code == 404 => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(api_err) if api_err.code == 409 => ClusterError::Conflict {
            kind,
            name: name.to_string(),
            message: api_err.message.clone(),
        },
        other => ClusterError::Api {
            operation,
            message: other.to_string(),
        },
    }
}

fn non_negative(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Reduce a `Node` to the fields the engine reads
pub(crate) fn node_status(node: &Node) -> NodeStatus {
    let status = node.status.as_ref();
    let ready_condition = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"));
    let allocatable_pods = status
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get("pods"))
        .and_then(|q| q.0.parse::<u32>().ok())
        .unwrap_or(0);
    let created_at = node
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| serde_json::to_value(t).ok())
        .and_then(|v| v.as_str().map(str::to_string))
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&chrono::Utc));

    NodeStatus {
        name: node.metadata.name.clone().unwrap_or_default(),
        ready: ready_condition.is_some_and(|c| c.status == "True"),
        ready_known: ready_condition.is_some_and(|c| c.status != "Unknown"),
        unschedulable: node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false),
        allocatable_pods,
        labels: node.metadata.labels.clone().unwrap_or_default(),
        annotations: node.metadata.annotations.clone().unwrap_or_default(),
        created_at,
    }
}

/// Reduce a `Pod` to the fields draining reads (budget resolved by the caller)
pub(crate) fn pod_info(pod: &Pod) -> PodInfo {
    let status = pod.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True");
    let daemonset = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));
    let mirror = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));

    PodInfo {
        namespace: pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: PodPhase::parse(status.and_then(|s| s.phase.as_deref())),
        ready,
        budget: None,
        daemonset,
        mirror,
        terminating: pod.metadata.deletion_timestamp.is_some(),
    }
}

/// Evaluate a label selector against a label set
///
/// A missing or empty selector matches every pod, as in `policy/v1`.
pub(crate) fn selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels_match = selector
        .match_labels
        .as_ref()
        .is_none_or(|wanted| wanted.iter().all(|(k, v)| labels.get(k) == Some(v)));
    let expressions_match = selector.match_expressions.as_ref().is_none_or(|exprs| {
        exprs.iter().all(|expr| {
            let value = labels.get(&expr.key);
            let values = expr.values.as_deref().unwrap_or_default();
            match expr.operator.as_str() {
                "In" => value.is_some_and(|v| values.contains(v)),
                "NotIn" => value.is_none_or(|v| !values.contains(v)),
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                _ => false,
            }
        })
    });
    labels_match && expressions_match
}
