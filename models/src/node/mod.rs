pub mod client;
pub mod crd;
pub mod drain;
pub mod error;

pub use self::client::{ApiGateway, EvictionOutcome, GatewayError, K8sApiGateway};
pub use self::crd::{Condition, NodeRefresh, NodeRefreshPhase, NodeRefreshSpec, NodeRefreshStatus};
pub use self::error::{Category, Error as NodeError};

#[cfg(feature = "mockall")]
pub use self::client::MockApiGateway;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;

pub const K8S_NODE_REFRESH_KIND: &str = "NodeRefresh";
pub const K8S_NODE_REFRESH_PLURAL: &str = "noderefreshes";
pub const K8S_NODE_REFRESH_STATUS: &str = "noderefreshes/status";
pub const K8S_NODE_REFRESH_SHORTNAME: &str = "nr";

/// A node is considered Ready if it reports a `Ready` condition with status `True`.
pub fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// A node is schedulable unless explicitly cordoned.
pub fn is_schedulable(node: &Node) -> bool {
    !node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// A node matches if every key/value pair in `desired` is present in the node's labels. Extra
/// labels on the node are permitted.
pub fn matches_labels(node: &Node, desired: &BTreeMap<String, String>) -> bool {
    let labels = node.metadata.labels.as_ref();
    desired.iter().all(|(k, v)| {
        labels
            .and_then(|l| l.get(k))
            .map(|actual| actual == v)
            .unwrap_or(false)
    })
}

/// Selectable nodes are both Ready and schedulable: the only nodes eligible to be a refresh
/// target or a replacement for one.
pub fn is_selectable(node: &Node) -> bool {
    is_ready(node) && is_schedulable(node)
}

/// Renders a `BTreeMap` of exact-match labels as a Kubernetes equality label selector string,
/// e.g. `"k1=v1,k2=v2"`.
pub fn format_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus};
    use kube::api::ObjectMeta;
    use maplit::btreemap;

    fn fake_node(ready: bool, unschedulable: bool, labels: BTreeMap<String, String>) -> Node {
        Node {
            metadata: ObjectMeta {
                labels: Some(labels),
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

    #[test]
    fn selectable_requires_ready_and_schedulable() {
        let labels = btreemap! { "role".to_string() => "worker".to_string() };
        assert!(is_selectable(&fake_node(true, false, labels.clone())));
        assert!(!is_selectable(&fake_node(false, false, labels.clone())));
        assert!(!is_selectable(&fake_node(true, true, labels)));
    }

    #[test]
    fn matches_labels_allows_extra_labels() {
        let desired = btreemap! { "role".to_string() => "worker".to_string() };
        let actual = btreemap! {
            "role".to_string() => "worker".to_string(),
            "zone".to_string() => "us-east-1a".to_string(),
        };
        assert!(matches_labels(&fake_node(true, false, actual), &desired));
    }

    #[test]
    fn matches_labels_rejects_value_mismatch() {
        let desired = btreemap! { "role".to_string() => "worker".to_string() };
        let actual = btreemap! { "role".to_string() => "control-plane".to_string() };
        assert!(!matches_labels(&fake_node(true, false, actual), &desired));
    }

    #[test]
    fn format_selector_renders_equality_pairs() {
        let labels = btreemap! {
            "a".to_string() => "1".to_string(),
            "b".to_string() => "2".to_string(),
        };
        assert_eq!(format_selector(&labels), "a=1,b=2");
    }
}
