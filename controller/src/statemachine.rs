//! The phase-driven reconciler: the state machine that actually selects, drains, and
//! uncordons nodes. Only engages while `status.phase` is `FindingNodes` or `ProcessingNode`;
//! every other phase is the scheduler's business.
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::{event, instrument, Level};

use models::constants::RETRY_DELAY;
use models::node::drain::drain_node;
use models::node::{
    format_selector, is_selectable, matches_labels, ApiGateway, Category, Condition, NodeRefresh,
    NodeRefreshPhase, NodeRefreshSpec, NodeRefreshStatus,
};
use models::status::StatusPatchBuilder;

/// The result of a single reconcile step. The runtime translates this into a scheduling
/// decision; the reconciler itself never sleeps or retries on its own.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// The step made whatever progress it could; no further action is needed until the next
    /// externally-triggered reconcile (a status write, for instance).
    Done,
    /// The step could not make progress yet for a reason that may resolve with time. The
    /// runtime should requeue a reconcile after the given delay.
    RetryAfter(Duration),
    /// The step hit a condition that retrying will not fix. The object has already been
    /// moved to `Failed`.
    Failed(String),
}

/// Runs one reconcile step for `nr`, returning the updated status snapshot, the merge-patch
/// to persist it, and the outcome that should drive the runtime's scheduling decision.
#[instrument(skip(gateway, nr), fields(name = %nr.metadata.name.clone().unwrap_or_default()))]
pub async fn reconcile<G: ApiGateway>(
    gateway: &G,
    nr: &NodeRefresh,
    now: DateTime<Utc>,
) -> (NodeRefreshStatus, Value, ReconcileOutcome) {
    let status = nr.status.clone().unwrap_or_default();

    match status.phase {
        NodeRefreshPhase::FindingNodes => {
            reconcile_finding_nodes(gateway, &nr.spec, status, now).await
        }
        NodeRefreshPhase::ProcessingNode => {
            reconcile_processing_node(gateway, &nr.spec, status, now).await
        }
        _ => {
            // The reconciler is not re-entrant outside these two phases; a stray trigger is
            // a no-op rather than an error.
            let (status, patch) = StatusPatchBuilder::new(status, now).build();
            (status, patch, ReconcileOutcome::Done)
        }
    }
}

async fn reconcile_finding_nodes<G: ApiGateway>(
    gateway: &G,
    spec: &NodeRefreshSpec,
    status: NodeRefreshStatus,
    now: DateTime<Utc>,
) -> (NodeRefreshStatus, Value, ReconcileOutcome) {
    let selector = format_selector(&spec.target_node_labels);
    let matched = match gateway.list_nodes(&selector).await {
        Ok(nodes) => nodes,
        Err(e) => return fail(status, now, format!("Unable to list target nodes: {}", e)),
    };

    if matched.is_empty() {
        let (status, patch) = StatusPatchBuilder::new(status, now)
            .phase(NodeRefreshPhase::Idle)
            .message("No nodes matched target labels")
            .build();
        return (status, patch, ReconcileOutcome::Done);
    }

    let selectable: Vec<_> = matched.iter().filter(|n| is_selectable(n)).collect();
    if selectable.is_empty() {
        event!(Level::INFO, matched = matched.len(), "No selectable nodes among matched targets.");
        let (status, patch) = StatusPatchBuilder::new(status, now)
            .message(format!(
                "{} node(s) matched but none are ready and schedulable",
                matched.len()
            ))
            .build();
        return (status, patch, ReconcileOutcome::RetryAfter(2 * RETRY_DELAY));
    }

    let chosen = selectable
        .choose(&mut rand::thread_rng())
        .expect("selectable is non-empty");
    let node_name = chosen.metadata.name.clone().unwrap_or_default();

    let (status, patch) = StatusPatchBuilder::new(status, now)
        .phase(NodeRefreshPhase::ProcessingNode)
        .current_node(node_name.clone())
        .message(format!("Selected node '{}' for refresh", node_name))
        .build();
    (status, patch, ReconcileOutcome::Done)
}

async fn reconcile_processing_node<G: ApiGateway>(
    gateway: &G,
    spec: &NodeRefreshSpec,
    status: NodeRefreshStatus,
    now: DateTime<Utc>,
) -> (NodeRefreshStatus, Value, ReconcileOutcome) {
    let node_name = status.current_node.clone();

    let node = match gateway.get_node(&node_name).await {
        Ok(Some(node)) => node,
        Ok(None) => {
            let (status, patch) = StatusPatchBuilder::new(status, now)
                .phase(NodeRefreshPhase::FindingNodes)
                .current_node("")
                .message(format!("Target node '{}' no longer exists", node_name))
                .build();
            return (status, patch, ReconcileOutcome::Done);
        }
        Err(e) => {
            return fail(
                status,
                now,
                format!("Unable to fetch node '{}': {}", node_name, e),
            )
        }
    };

    if !matches_labels(&node, &spec.target_node_labels) {
        let (status, patch) = StatusPatchBuilder::new(status, now)
            .phase(NodeRefreshPhase::FindingNodes)
            .current_node("")
            .message(format!(
                "Target node '{}' no longer matches target labels",
                node_name
            ))
            .build();
        return (status, patch, ReconcileOutcome::Done);
    }

    let selector = format_selector(&spec.target_node_labels);
    let matched = match gateway.list_nodes(&selector).await {
        Ok(nodes) => nodes,
        Err(e) => return fail(status, now, format!("Unable to list target nodes: {}", e)),
    };
    if !has_other_selectable(&matched, &node_name) {
        let (status, patch) = StatusPatchBuilder::new(status, now)
            .message("No replacement node available yet; waiting before draining")
            .build();
        return (status, patch, ReconcileOutcome::RetryAfter(3 * RETRY_DELAY));
    }

    if let Err(e) = drain_node(gateway, &node_name).await {
        let message = format!("Drain failed for node '{}': {}", node_name, e);
        return match e.category() {
            Category::Fatal => fail(status, now, message),
            Category::NotFound | Category::Transient => {
                let (status, patch) = StatusPatchBuilder::new(status, now).message(message).build();
                (status, patch, ReconcileOutcome::RetryAfter(RETRY_DELAY))
            }
        };
    }

    let mut builder = StatusPatchBuilder::new(status, now);
    if let Err(e) = gateway.patch_node_schedulable(&node_name, false).await {
        event!(Level::WARN, node_name, error = %e, "Failed to uncordon node after a successful drain.");
        builder = builder.condition(Condition {
            type_: "Warning".to_string(),
            status: "True".to_string(),
            last_transition_time: now.to_rfc3339(),
            reason: "UncordonFailed".to_string(),
            message: format!("Failed to uncordon node '{}': {}", node_name, e),
        });
    }

    let matched_after = match gateway.list_nodes(&selector).await {
        Ok(nodes) => nodes,
        Err(e) => {
            let message = format!(
                "Drained node '{}' but could not re-query targets afterward: {}",
                node_name, e
            );
            let (status, patch) = builder
                .phase(NodeRefreshPhase::Failed)
                .current_node("")
                .message(message.clone())
                .build();
            return (status, patch, ReconcileOutcome::Failed(message));
        }
    };

    let (next_phase, message) = if has_other_selectable(&matched_after, &node_name) {
        (
            NodeRefreshPhase::WaitingCooldown,
            format!(
                "Refreshed node '{}'; cooling down before the next node",
                node_name
            ),
        )
    } else {
        (
            NodeRefreshPhase::Succeeded,
            format!("Refreshed node '{}'; no further candidates remain", node_name),
        )
    };

    let (status, patch) = builder
        .phase(next_phase)
        .current_node("")
        .last_refresh_timestamp_now()
        .message(message)
        .build();
    (status, patch, ReconcileOutcome::Done)
}

/// Whether at least one node other than `exclude_name` in `nodes` is ready and schedulable.
/// This is the replacement-availability precondition: it guards against draining the last
/// remaining candidate and reducing capacity to zero.
fn has_other_selectable(nodes: &[k8s_openapi::api::core::v1::Node], exclude_name: &str) -> bool {
    nodes
        .iter()
        .any(|n| n.metadata.name.as_deref() != Some(exclude_name) && is_selectable(n))
}

fn fail(
    status: NodeRefreshStatus,
    now: DateTime<Utc>,
    message: String,
) -> (NodeRefreshStatus, Value, ReconcileOutcome) {
    let (status, patch) = StatusPatchBuilder::new(status, now)
        .phase(NodeRefreshPhase::Failed)
        .current_node("")
        .message(message.clone())
        .build();
    (status, patch, ReconcileOutcome::Failed(message))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeSpec, NodeStatus, Pod};
    use kube::api::ObjectMeta;
    use maplit::btreemap;
    use models::node::client::{EvictionOutcome, GatewayError};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap()
    }

    fn node(name: &str, ready: bool, unschedulable: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(btreemap! { "role".to_string() => "worker".to_string() }),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn spec() -> NodeRefreshSpec {
        NodeRefreshSpec {
            target_node_labels: btreemap! { "role".to_string() => "worker".to_string() },
            refresh_schedule_days: 3,
            node_cooldown_seconds: 300,
        }
    }

    fn nr(status: NodeRefreshStatus) -> NodeRefresh {
        let mut nr = NodeRefresh::new("test", spec());
        nr.status = Some(status);
        nr
    }

    struct FakeGateway {
        nodes: Mutex<Vec<Node>>,
        uncordon_fails: bool,
        /// Nodes present only for the first `list_nodes` call, then gone from every
        /// subsequent one. Models a replacement candidate that disappears mid-cycle, to
        /// reach the `Succeeded` branch without needing a second reconcile.
        list_calls: Mutex<u32>,
        vanish_after_first_list: Vec<String>,
    }

    #[async_trait]
    impl ApiGateway for FakeGateway {
        async fn list_nodes(&self, _label_selector: &str) -> models::node::client::Result<Vec<Node>> {
            let mut calls = self.list_calls.lock().unwrap();
            *calls += 1;
            let nodes = self.nodes.lock().unwrap().clone();
            if *calls > 1 {
                Ok(nodes
                    .into_iter()
                    .filter(|n| {
                        !self
                            .vanish_after_first_list
                            .iter()
                            .any(|v| n.metadata.name.as_deref() == Some(v.as_str()))
                    })
                    .collect())
            } else {
                Ok(nodes)
            }
        }
        async fn get_node(&self, name: &str) -> models::node::client::Result<Option<Node>> {
            Ok(self
                .nodes
                .lock()
                .unwrap()
                .iter()
                .find(|n| n.metadata.name.as_deref() == Some(name))
                .cloned())
        }
        async fn patch_node_schedulable(
            &self,
            name: &str,
            unschedulable: bool,
        ) -> models::node::client::Result<()> {
            if !unschedulable && self.uncordon_fails {
                return Err(GatewayError::Request {
                    source: kube::Error::Api(kube::error::ErrorResponse {
                        status: "Failure".to_string(),
                        message: "synthetic uncordon failure".to_string(),
                        reason: "InternalError".to_string(),
                        code: 500,
                    }),
                    category: Category::Transient,
                });
            }
            let mut nodes = self.nodes.lock().unwrap();
            if let Some(n) = nodes.iter_mut().find(|n| n.metadata.name.as_deref() == Some(name)) {
                n.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
            }
            Ok(())
        }
        async fn list_active_pods_on_node(&self, _node_name: &str) -> models::node::client::Result<Vec<Pod>> {
            Ok(vec![])
        }
        async fn evict_pod(&self, _namespace: &str, _name: &str) -> models::node::client::Result<EvictionOutcome> {
            Ok(EvictionOutcome::Evicted)
        }
        async fn patch_noderefresh_status(
            &self,
            _namespace: &str,
            _name: &str,
            _patch: &Value,
        ) -> models::node::client::Result<()> {
            Ok(())
        }
    }

    fn fake_gateway(nodes: Vec<Node>) -> FakeGateway {
        FakeGateway {
            nodes: Mutex::new(nodes),
            uncordon_fails: false,
            list_calls: Mutex::new(0),
            vanish_after_first_list: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finding_nodes_with_no_matches_goes_idle() {
        let gateway = fake_gateway(vec![]);
        let nr = nr(NodeRefreshStatus {
            phase: NodeRefreshPhase::FindingNodes,
            ..Default::default()
        });
        let (status, _, outcome) = reconcile(&gateway, &nr, now()).await;
        assert_eq!(status.phase, NodeRefreshPhase::Idle);
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn finding_nodes_with_no_selectable_retries() {
        let gateway = fake_gateway(vec![node("a", false, false)]);
        let nr = nr(NodeRefreshStatus {
            phase: NodeRefreshPhase::FindingNodes,
            ..Default::default()
        });
        let (status, _, outcome) = reconcile(&gateway, &nr, now()).await;
        assert_eq!(status.phase, NodeRefreshPhase::FindingNodes);
        assert!(matches!(outcome, ReconcileOutcome::RetryAfter(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn finding_nodes_selects_a_selectable_node() {
        let gateway = fake_gateway(vec![node("a", true, false)]);
        let nr = nr(NodeRefreshStatus {
            phase: NodeRefreshPhase::FindingNodes,
            ..Default::default()
        });
        let (status, _, outcome) = reconcile(&gateway, &nr, now()).await;
        assert_eq!(status.phase, NodeRefreshPhase::ProcessingNode);
        assert_eq!(status.current_node, "a");
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn processing_node_without_replacement_retries_without_draining() {
        let gateway = fake_gateway(vec![node("a", true, false)]);
        let nr = nr(NodeRefreshStatus {
            phase: NodeRefreshPhase::ProcessingNode,
            current_node: "a".to_string(),
            ..Default::default()
        });
        let (status, _, outcome) = reconcile(&gateway, &nr, now()).await;
        assert_eq!(status.phase, NodeRefreshPhase::ProcessingNode);
        assert!(matches!(outcome, ReconcileOutcome::RetryAfter(_)));
        // The node was never cordoned: no drain was attempted.
        assert_eq!(
            gateway.nodes.lock().unwrap()[0]
                .spec
                .as_ref()
                .unwrap()
                .unschedulable,
            Some(false)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn processing_node_missing_node_returns_to_finding_nodes() {
        let gateway = fake_gateway(vec![]);
        let nr = nr(NodeRefreshStatus {
            phase: NodeRefreshPhase::ProcessingNode,
            current_node: "gone".to_string(),
            ..Default::default()
        });
        let (status, _, outcome) = reconcile(&gateway, &nr, now()).await;
        assert_eq!(status.phase, NodeRefreshPhase::FindingNodes);
        assert_eq!(status.current_node, "");
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn processing_node_drains_and_moves_to_waiting_cooldown_with_replacement() {
        let gateway = fake_gateway(vec![node("a", true, false), node("b", true, false)]);
        let nr = nr(NodeRefreshStatus {
            phase: NodeRefreshPhase::ProcessingNode,
            current_node: "a".to_string(),
            ..Default::default()
        });
        let (status, _, outcome) = reconcile(&gateway, &nr, now()).await;
        assert_eq!(status.phase, NodeRefreshPhase::WaitingCooldown);
        assert_eq!(status.current_node, "");
        assert!(status.last_refresh_timestamp.is_some());
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn processing_node_drains_and_succeeds_when_replacement_vanishes_mid_cycle() {
        // "b" passes the pre-drain replacement-availability precondition but is gone by the
        // post-drain re-query, so the cycle should end in `Succeeded` rather than
        // `WaitingCooldown`.
        let mut gateway = fake_gateway(vec![node("a", true, false), node("b", true, false)]);
        gateway.vanish_after_first_list = vec!["b".to_string()];
        let nr = nr(NodeRefreshStatus {
            phase: NodeRefreshPhase::ProcessingNode,
            current_node: "a".to_string(),
            ..Default::default()
        });
        let (status, _, outcome) = reconcile(&gateway, &nr, now()).await;
        assert_eq!(status.phase, NodeRefreshPhase::Succeeded);
        assert_eq!(status.current_node, "");
        assert!(status.last_refresh_timestamp.is_some());
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn processing_node_uncordon_failure_is_a_warning_not_fatal() {
        let mut gateway = fake_gateway(vec![node("a", true, false), node("b", true, false)]);
        gateway.uncordon_fails = true;
        let nr = nr(NodeRefreshStatus {
            phase: NodeRefreshPhase::ProcessingNode,
            current_node: "a".to_string(),
            ..Default::default()
        });
        let (status, _, outcome) = reconcile(&gateway, &nr, now()).await;
        assert_eq!(status.phase, NodeRefreshPhase::WaitingCooldown);
        assert!(status.last_refresh_timestamp.is_some());
        assert!(status
            .conditions
            .iter()
            .any(|c| c.type_ == "Warning" && c.reason == "UncordonFailed"));
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }
}
