//! The `NodeRefresh` custom resource: a policy that periodically drains and uncordons
//! worker nodes matching a label selector, one at a time, pacing refreshes via cooldown.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use validator::Validate;

use crate::node::error;

/// The coarse state of a `NodeRefresh` object. Persisted in `.status.phase` so that it
/// survives operator restarts and doubles as the dispatch key for the reconciler.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, JsonSchema)]
pub enum NodeRefreshPhase {
    /// Waiting for the next scheduled refresh. Starting, terminal, and recovery state.
    Idle,
    /// Searching for a target node to refresh.
    FindingNodes,
    /// Draining and uncordoning the node named in `.status.currentNode`.
    ProcessingNode,
    /// A node was just refreshed; pacing before the next one is considered.
    WaitingCooldown,
    /// A refresh cycle completed and no further candidate nodes remain.
    Succeeded,
    /// A refresh cycle could not complete and will not be retried until the next scheduled attempt.
    Failed,
}

impl Default for NodeRefreshPhase {
    fn default() -> Self {
        NodeRefreshPhase::Idle
    }
}

/// The `NodeRefreshSpec` declares which nodes are in scope and how often to refresh them.
/// It is provided by the user and is never mutated by the core.
#[derive(Clone, CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, JsonSchema, Validate)]
#[kube(
    derive = "Default",
    derive = "PartialEq",
    group = "stable.example.com",
    kind = "NodeRefresh",
    namespaced,
    plural = "noderefreshes",
    shortname = "nr",
    singular = "noderefresh",
    status = "NodeRefreshStatus",
    version = "v1alpha1",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Current Node", "type":"string", "jsonPath":".status.currentNode"}"#,
    printcolumn = r#"{"name":"Last Refresh", "type":"string", "jsonPath":".status.lastRefreshTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeRefreshSpec {
    /// Exact-match label set identifying candidate nodes.
    #[validate(length(min = 1))]
    pub target_node_labels: BTreeMap<String, String>,
    /// Days between the end of one refresh cycle and the start of the next. Default 3.
    #[serde(default = "default_refresh_schedule_days")]
    #[validate(range(min = 1))]
    pub refresh_schedule_days: u32,
    /// Minimum delay, in seconds, between finishing one node and starting another. Default 300.
    #[serde(default = "default_node_cooldown_seconds")]
    pub node_cooldown_seconds: u32,
}

fn default_refresh_schedule_days() -> u32 {
    3
}

fn default_node_cooldown_seconds() -> u32 {
    300
}

/// `NodeRefreshStatus` surfaces where a refresh cycle stands. Only the core mutates this.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeRefreshStatus {
    #[serde(default)]
    pub phase: NodeRefreshPhase,
    /// Name of the node currently being drained. Non-empty iff `phase == ProcessingNode`.
    #[serde(default)]
    pub current_node: String,
    /// RFC-3339 timestamp of the most recently completed node drain.
    pub last_refresh_timestamp: Option<String>,
    /// Bounded history of status transitions and warnings, oldest-first, capped at `MaxConditions`.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A single status condition, analogous to the `conditions` convention used across core
/// Kubernetes types.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub last_transition_time: String,
    pub reason: String,
    pub message: String,
}

impl NodeRefresh {
    /// Validates the parts of the spec that the CRD's OpenAPI schema cannot express on its own.
    pub fn validate_spec(&self) -> error::Result<()> {
        use validator::Validate as _;
        self.spec
            .validate()
            .context(error::InvalidSpec { name: self.metadata.name.clone().unwrap_or_default() })
    }
}

impl NodeRefreshStatus {
    /// Parses `last_refresh_timestamp`, if present, as an RFC-3339 UTC timestamp.
    pub fn last_refresh_time(&self) -> error::Result<Option<DateTime<Utc>>> {
        self.last_refresh_timestamp
            .as_ref()
            .map(|ts| {
                DateTime::parse_from_rfc3339(ts)
                    .map(|ts| ts.with_timezone(&Utc))
                    .context(error::TimestampFormat)
            })
            .transpose()
    }

    /// Returns the most recent condition of the given type, if any, searching newest-first.
    pub fn latest_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().rev().find(|c| c.type_ == type_)
    }
}
