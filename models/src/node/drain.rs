//! Drains a node of all pods, in the manner of `kubectl drain`.
//!
//! Cordoning marks a node unschedulable; draining additionally evicts its existing pods.
//! This implementation uses the Eviction subresource (not raw deletion) so that
//! PodDisruptionBudgets are respected. Unlike `kubectl drain`'s concurrent eviction, pods are
//! evicted one at a time with a short delay between requests, trading throughput for a much
//! gentler request rate against the API server and any PodDisruptionBudget webhooks in front
//! of it.
use snafu::{ensure, ResultExt};
use tokio::time::{sleep, Duration};
use tracing::{event, instrument, Level};

use crate::node::client::{is_daemonset_pod, is_mirror_pod, is_self_pod, ApiGateway, EvictionOutcome};

/// Upper bound on eviction-loop iterations before giving up and reporting `Fatal`.
const MAX_DRAIN_ATTEMPTS: u32 = 10;
/// Delay between individual eviction requests within a single pass.
const INTER_POD_DELAY: Duration = Duration::from_secs(1);
/// Backoff when a pass evicted nothing and something was blocked by a PodDisruptionBudget.
const BACKOFF_ALL_BLOCKED: Duration = Duration::from_secs(30);
/// Backoff when a pass made some progress but also hit blocked pods.
const BACKOFF_PARTIAL_PROGRESS: Duration = Duration::from_secs(10);
/// Backoff when a pass evicted everything it attempted.
const BACKOFF_FULL_PROGRESS: Duration = Duration::from_secs(5);

/// Drains `node_name`: cordons it, then evicts eligible pods until none remain or
/// `MAX_DRAIN_ATTEMPTS` is exhausted.
#[instrument(skip(gateway), err)]
pub async fn drain_node<G: ApiGateway>(gateway: &G, node_name: &str) -> Result<(), error::DrainError> {
    gateway
        .patch_node_schedulable(node_name, true)
        .await
        .context(error::Cordon {
            node_name: node_name.to_string(),
        })?;

    for attempt in 0..MAX_DRAIN_ATTEMPTS {
        let targets = eligible_pods(gateway, node_name).await?;

        if targets.is_empty() {
            event!(Level::INFO, node_name, "No more pods to evict.");
            break;
        }

        event!(
            Level::INFO,
            node_name,
            attempt = attempt + 1,
            remaining = targets.len(),
            "Draining node."
        );

        let mut evicted = 0u32;
        let mut blocked = 0u32;
        for pod in &targets {
            let namespace = pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string());
            let name = pod.metadata.name.clone().unwrap_or_default();
            match gateway.evict_pod(&namespace, &name).await {
                Ok(EvictionOutcome::Evicted) | Ok(EvictionOutcome::Gone) => evicted += 1,
                Ok(EvictionOutcome::Blocked) => blocked += 1,
                Err(e) => {
                    return Err(error::DrainError::Evict {
                        source: e,
                        pod_name: format!("{}/{}", namespace, name),
                    })
                }
            }
            sleep(INTER_POD_DELAY).await;
        }

        let backoff = if evicted == 0 && blocked > 0 {
            BACKOFF_ALL_BLOCKED
        } else if evicted > 0 && blocked > 0 {
            BACKOFF_PARTIAL_PROGRESS
        } else {
            BACKOFF_FULL_PROGRESS
        };
        sleep(backoff).await;
    }

    let remaining = eligible_pods(gateway, node_name).await?;
    ensure!(
        remaining.is_empty(),
        error::PodsRemain {
            node_name: node_name.to_string(),
            pod_names: remaining
                .iter()
                .map(|p| format!(
                    "{}/{}",
                    p.metadata.namespace.as_deref().unwrap_or("default"),
                    p.metadata.name.as_deref().unwrap_or("<unnamed>")
                ))
                .collect::<Vec<_>>(),
        }
    );

    Ok(())
}

/// Lists the active pods on a node and filters out those that drain must not evict: the
/// operator's own pod, DaemonSet-owned pods, and static mirror pods.
async fn eligible_pods<G: ApiGateway>(
    gateway: &G,
    node_name: &str,
) -> Result<Vec<k8s_openapi::api::core::v1::Pod>, error::DrainError> {
    let pods = gateway
        .list_active_pods_on_node(node_name)
        .await
        .context(error::ListPods {
            node_name: node_name.to_string(),
        })?;

    Ok(pods
        .into_iter()
        .filter(|pod| {
            if is_self_pod(pod) {
                event!(Level::DEBUG, "Not draining the operator's own pod.");
                return false;
            }
            if is_daemonset_pod(pod) {
                event!(Level::INFO, pod = ?pod.metadata.name, "Not draining DaemonSet-owned pod.");
                return false;
            }
            if is_mirror_pod(pod) {
                event!(Level::INFO, pod = ?pod.metadata.name, "Not draining static mirror pod.");
                return false;
            }
            true
        })
        .collect())
}

pub mod error {
    use snafu::Snafu;

    use crate::node::client::GatewayError;
    use crate::node::error::Category;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum DrainError {
        #[snafu(display("Unable to cordon node '{}': '{}'", node_name, source))]
        Cordon {
            source: GatewayError,
            node_name: String,
        },

        #[snafu(display("Unable to list pods on node '{}': '{}'", node_name, source))]
        ListPods {
            source: GatewayError,
            node_name: String,
        },

        #[snafu(display("Unable to evict pod '{}': '{}'", pod_name, source))]
        Evict {
            source: GatewayError,
            pod_name: String,
        },

        #[snafu(display(
            "Failed to drain node '{}'. Pods remaining: {:?}",
            node_name,
            pod_names
        ))]
        PodsRemain {
            node_name: String,
            pod_names: Vec<String>,
        },
    }

    impl DrainError {
        /// Classifies this error per the crate-wide `Transient`/`NotFound`/`Fatal` taxonomy.
        /// Exhausting `MaxDrainAttempts` is always `Fatal`: retrying the same drain won't help
        /// without a status change the reconciler can observe.
        pub fn category(&self) -> Category {
            match self {
                DrainError::Cordon { source, .. } => source.category(),
                DrainError::ListPods { source, .. } => source.category(),
                DrainError::Evict { source, .. } => source.category(),
                DrainError::PodsRemain { .. } => Category::Fatal,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;
    use serde_json::Value;

    use crate::node::client::{ApiGateway, EvictionOutcome};
    use crate::node::client::{self as client, GatewayError};

    use super::*;

    /// A hand-written, stateful fake `ApiGateway` for scenario-style tests where a sequence
    /// of calls needs to see evolving cluster state (e.g. a PDB that unblocks later).
    struct FakeGateway {
        cordoned: Mutex<bool>,
        pods: Mutex<Vec<Pod>>,
        eviction_script: Mutex<Vec<EvictionOutcome>>,
    }

    fn pod(name: &str, daemonset: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                owner_references: if daemonset {
                    Some(vec![k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                        controller: Some(true),
                        kind: "DaemonSet".to_string(),
                        ..Default::default()
                    }])
                } else {
                    None
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[async_trait]
    impl ApiGateway for FakeGateway {
        async fn list_nodes(&self, _label_selector: &str) -> client::Result<Vec<k8s_openapi::api::core::v1::Node>> {
            Ok(vec![])
        }
        async fn get_node(&self, _name: &str) -> client::Result<Option<k8s_openapi::api::core::v1::Node>> {
            Ok(None)
        }
        async fn patch_node_schedulable(&self, _name: &str, unschedulable: bool) -> client::Result<()> {
            *self.cordoned.lock().unwrap() = unschedulable;
            Ok(())
        }
        async fn list_active_pods_on_node(&self, _node_name: &str) -> client::Result<Vec<Pod>> {
            Ok(self.pods.lock().unwrap().clone())
        }
        async fn evict_pod(&self, _namespace: &str, name: &str) -> client::Result<EvictionOutcome> {
            let mut script = self.eviction_script.lock().unwrap();
            let outcome = if script.is_empty() {
                EvictionOutcome::Evicted
            } else {
                script.remove(0)
            };
            if matches!(outcome, EvictionOutcome::Evicted | EvictionOutcome::Gone) {
                self.pods.lock().unwrap().retain(|p| p.metadata.name.as_deref() != Some(name));
            }
            Ok(outcome)
        }
        async fn patch_noderefresh_status(&self, _namespace: &str, _name: &str, _patch: &Value) -> client::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drains_daemonset_pod_unaffected() {
        let gateway = FakeGateway {
            cordoned: Mutex::new(false),
            pods: Mutex::new(vec![pod("regular", false), pod("daemon", true)]),
            eviction_script: Mutex::new(vec![]),
        };

        let result = drain_node(&gateway, "node-a").await;
        assert!(result.is_ok());
        assert!(*gateway.cordoned.lock().unwrap());
        // The daemonset pod was never a drain target, so it's still "present" in our fake.
        let remaining = gateway.pods.lock().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].metadata.name.as_deref(), Some("daemon"));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_fails_if_pod_never_evicts() {
        let gateway = FakeGateway {
            cordoned: Mutex::new(false),
            pods: Mutex::new(vec![pod("stuck", false)]),
            eviction_script: Mutex::new(vec![EvictionOutcome::Blocked; (MAX_DRAIN_ATTEMPTS as usize) * 2]),
        };

        let result = drain_node(&gateway, "node-a").await;
        assert!(matches!(result, Err(error::DrainError::PodsRemain { .. })));
    }
}
