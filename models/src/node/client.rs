use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, EvictParams, ListParams, Patch, PatchParams};
use reqwest::StatusCode;
use serde_json::Value;
use snafu::Snafu;
use tokio::time::{sleep, Duration};
use tracing::instrument;

#[cfg(feature = "mockall")]
use mockall::mock;

use crate::constants;
use crate::node::crd::NodeRefresh;
use crate::node::error::Category;

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Upper bound on retries for a single eviction call that keeps returning `5xx`, before the
/// attempt is counted as `Blocked` rather than propagated as a `Fatal` gateway error. A `5xx`
/// here may just mean a misconfigured or momentarily-unavailable PodDisruptionBudget webhook,
/// which is worth a few quick retries but shouldn't hold up the whole drain loop.
const EVICT_SERVER_ERROR_RETRIES: u32 = 3;
/// Delay between per-call eviction retries on a `5xx` response.
const EVICT_SERVER_ERROR_RETRY_DELAY: Duration = Duration::from_millis(500);

/// The outcome of a single pod eviction attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EvictionOutcome {
    /// The Eviction subresource was accepted.
    Evicted,
    /// The Eviction subresource was rejected to satisfy a PodDisruptionBudget.
    Blocked,
    /// The pod no longer exists; treated as a successful eviction.
    Gone,
}

/// Thin adapter over the Kubernetes API. Expressed as a trait so the Drain Engine,
/// Reconciler, and Scheduler Tick can be tested against an in-memory fake rather than a
/// live cluster.
#[async_trait]
pub trait ApiGateway: Send + Sync {
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>>;
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;
    async fn patch_node_schedulable(&self, name: &str, unschedulable: bool) -> Result<()>;
    async fn list_active_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<EvictionOutcome>;
    async fn patch_noderefresh_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A mock `ApiGateway` for use in tests.
    pub ApiGateway {}

    #[async_trait]
    impl ApiGateway for ApiGateway {
        async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>>;
        async fn get_node(&self, name: &str) -> Result<Option<Node>>;
        async fn patch_node_schedulable(&self, name: &str, unschedulable: bool) -> Result<()>;
        async fn list_active_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;
        async fn evict_pod(&self, namespace: &str, name: &str) -> Result<EvictionOutcome>;
        async fn patch_noderefresh_status(
            &self,
            namespace: &str,
            name: &str,
            patch: &Value,
        ) -> Result<()>;
    }
}

#[async_trait]
impl<T> ApiGateway for Arc<T>
where
    T: ApiGateway,
{
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>> {
        (**self).list_nodes(label_selector).await
    }
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        (**self).get_node(name).await
    }
    async fn patch_node_schedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        (**self).patch_node_schedulable(name, unschedulable).await
    }
    async fn list_active_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        (**self).list_active_pods_on_node(node_name).await
    }
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<EvictionOutcome> {
        (**self).evict_pod(namespace, name).await
    }
    async fn patch_noderefresh_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        (**self)
            .patch_noderefresh_status(namespace, name, patch)
            .await
    }
}

/// Concrete implementation backed by a live `kube::Client`.
#[derive(Clone)]
pub struct K8sApiGateway {
    k8s_client: kube::Client,
}

impl K8sApiGateway {
    pub fn new(k8s_client: kube::Client) -> Self {
        K8sApiGateway { k8s_client }
    }
}

#[async_trait]
impl ApiGateway for K8sApiGateway {
    #[instrument(skip(self), err)]
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.k8s_client.clone());
        let list = api
            .list(&ListParams {
                label_selector: Some(label_selector.to_string()),
                ..Default::default()
            })
            .await
            .map_err(classify_to_gateway_error)?;
        Ok(list.items)
    }

    #[instrument(skip(self), err)]
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.k8s_client.clone());
        match api.get(name).await {
            Ok(node) => Ok(Some(node)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(classify_to_gateway_error(e)),
        }
    }

    #[instrument(skip(self), err)]
    async fn patch_node_schedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        let api: Api<Node> = Api::all(self.k8s_client.clone());
        let patch = serde_json::json!({ "spec": { "unschedulable": unschedulable } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(classify_to_gateway_error)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_active_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.k8s_client.clone());
        let pods = api
            .list(&ListParams {
                field_selector: Some(format!("spec.nodeName={}", node_name)),
                ..Default::default()
            })
            .await
            .map_err(classify_to_gateway_error)?;

        Ok(pods
            .items
            .into_iter()
            .filter(|pod| {
                !pod.status
                    .as_ref()
                    .and_then(|s| s.phase.as_ref())
                    .map(|phase| phase == "Succeeded" || phase == "Failed")
                    .unwrap_or(false)
            })
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<EvictionOutcome> {
        let api: Api<Pod> = Api::namespaced(self.k8s_client.clone(), namespace);
        for attempt in 0..EVICT_SERVER_ERROR_RETRIES {
            match api.evict(name, &EvictParams::default()).await {
                Ok(_) => return Ok(EvictionOutcome::Evicted),
                Err(kube::Error::Api(e)) => match StatusCode::from_u16(e.code as u16) {
                    Ok(StatusCode::TOO_MANY_REQUESTS) => return Ok(EvictionOutcome::Blocked),
                    Ok(StatusCode::NOT_FOUND) => return Ok(EvictionOutcome::Gone),
                    Ok(code) if code.is_server_error() => {
                        if attempt + 1 == EVICT_SERVER_ERROR_RETRIES {
                            // Exhausted the per-call retry budget; a persistently-erroring
                            // eviction call is treated the same as a PDB rejection for this
                            // attempt rather than failing the whole drain.
                            return Ok(EvictionOutcome::Blocked);
                        }
                        sleep(EVICT_SERVER_ERROR_RETRY_DELAY).await;
                    }
                    _ => return Err(classify_to_gateway_error(kube::Error::Api(e))),
                },
                Err(e) => return Err(classify_to_gateway_error(e)),
            }
        }
        unreachable!("loop always returns before exhausting its bound")
    }

    #[instrument(skip(self, patch), err)]
    async fn patch_noderefresh_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        let api: Api<NodeRefresh> = Api::namespaced(self.k8s_client.clone(), namespace);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(classify_to_gateway_error)?;
        Ok(())
    }
}

/// Returns whether this operator's own pod should be excluded from a drain, matching it by
/// namespace and the well-known component label.
pub fn is_self_pod(pod: &Pod) -> bool {
    let namespace_matches = pod
        .metadata
        .namespace
        .as_deref()
        .map(|ns| ns == constants::operator_namespace())
        .unwrap_or(false);
    let label_matches = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels: &BTreeMap<String, String>| labels.get(constants::LABEL_COMPONENT))
        .map(|v| v == constants::NODE_REFRESH_OPERATOR_COMPONENT)
        .unwrap_or(false);
    namespace_matches && label_matches
}

/// Returns whether a pod is owned by a `DaemonSet`, whose controller ignores node cordons.
pub fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.controller == Some(true) && r.kind == "DaemonSet")
        })
        .unwrap_or(false)
}

/// Returns whether a pod is a static mirror pod reflected by the kubelet, which the API
/// server cannot delete.
pub fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key("kubernetes.io/config.mirror"))
        .unwrap_or(false)
}

/// Maps a raw transport error into the crate's error taxonomy at the API Gateway boundary so
/// no module above this one ever has to match on `kube::Error` directly.
pub fn classify(err: &kube::Error) -> Category {
    match err {
        kube::Error::Api(e) => match e.code {
            404 => Category::NotFound,
            403 => Category::Fatal,
            429 | 500..=599 => Category::Transient,
            _ => Category::Fatal,
        },
        _ => Category::Transient,
    }
}

fn classify_to_gateway_error(err: kube::Error) -> GatewayError {
    let category = classify(&err);
    GatewayError::Request {
        source: err,
        category,
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum GatewayError {
    #[snafu(display("Kubernetes API request failed ({:?}): '{}'", category, source))]
    Request {
        source: kube::Error,
        category: Category,
    },
}

impl GatewayError {
    pub fn category(&self) -> Category {
        match self {
            GatewayError::Request { category, .. } => *category,
        }
    }
}
