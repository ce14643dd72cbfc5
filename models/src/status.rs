//! A pure, synchronous builder for `NodeRefresh` status merge-patches.
//!
//! Keeping this separate from the API Gateway call that applies it is what makes the
//! commutativity property of disjoint-field patches testable without a cluster: build two
//! patches, apply them to a status snapshot in either order, and compare.
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::node::crd::{Condition, NodeRefreshPhase, NodeRefreshStatus};

/// Bound on the number of entries retained in `.status.conditions`. Oldest entries are
/// dropped first (FIFO).
pub const MAX_CONDITIONS: usize = 10;

/// Builds a merge-patch against an owned snapshot of `NodeRefreshStatus`, producing both the
/// updated snapshot (for chaining/testing) and the JSON merge-patch document to send to the
/// API Gateway.
pub struct StatusPatchBuilder {
    status: NodeRefreshStatus,
    now: DateTime<Utc>,
}

impl StatusPatchBuilder {
    /// Starts a new builder from the current status snapshot, using `now` for any timestamps
    /// this builder writes. `now` is always supplied by the caller rather than read from the
    /// system clock here, so callers of this builder remain unit-testable.
    pub fn new(status: NodeRefreshStatus, now: DateTime<Utc>) -> Self {
        StatusPatchBuilder { status, now }
    }

    pub fn phase(mut self, phase: NodeRefreshPhase) -> Self {
        self.status.phase = phase;
        self
    }

    pub fn current_node(mut self, node_name: impl Into<String>) -> Self {
        self.status.current_node = node_name.into();
        self
    }

    pub fn last_refresh_timestamp_now(mut self) -> Self {
        self.status.last_refresh_timestamp = Some(self.now.to_rfc3339());
        self
    }

    /// Appends an implicit condition derived from the current phase and a free-text message.
    /// Unlike [`Self::condition`], this always appends: repeated messages for the same phase
    /// (e.g. successive drain-retry updates while `FindingNodes`) must each leave their own
    /// entry in the timeline rather than collapsing to the most recent one.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        let type_ = phase_condition_type(&self.status.phase).to_string();
        self.status.conditions.push(Condition {
            type_: type_.clone(),
            status: "True".to_string(),
            last_transition_time: self.now.to_rfc3339(),
            reason: type_,
            message: message.into(),
        });
        self.truncate();
        self
    }

    /// Appends an explicit condition, replacing any existing entry with the same `type`.
    pub fn condition(mut self, condition: Condition) -> Self {
        if let Some(existing) = self
            .status
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            *existing = condition;
        } else {
            self.status.conditions.push(condition);
        }

        self.truncate();
        self
    }

    /// Bounds `.status.conditions` to the most recent `MAX_CONDITIONS` entries (FIFO).
    fn truncate(&mut self) {
        let len = self.status.conditions.len();
        if len > MAX_CONDITIONS {
            self.status.conditions.drain(0..len - MAX_CONDITIONS);
        }
    }

    /// Consumes the builder, returning the updated status snapshot and the JSON merge-patch
    /// that would bring a remote object's `.status` in line with it.
    pub fn build(self) -> (NodeRefreshStatus, Value) {
        let patch = json!({ "status": self.status });
        (self.status, patch)
    }
}

fn phase_condition_type(phase: &NodeRefreshPhase) -> &'static str {
    match phase {
        NodeRefreshPhase::Idle => "Idle",
        NodeRefreshPhase::FindingNodes => "FindingNodes",
        NodeRefreshPhase::ProcessingNode => "ProcessingNode",
        NodeRefreshPhase::WaitingCooldown => "WaitingCooldown",
        NodeRefreshPhase::Succeeded => "Succeeded",
        NodeRefreshPhase::Failed => "Failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap()
    }

    #[test]
    fn conditions_truncate_to_max() {
        let mut status = NodeRefreshStatus::default();
        for i in 0..(MAX_CONDITIONS + 3) {
            let mut builder = StatusPatchBuilder::new(status, now());
            builder = builder.condition(Condition {
                type_: format!("Type{}", i),
                status: "True".to_string(),
                last_transition_time: now().to_rfc3339(),
                reason: "Reason".to_string(),
                message: "msg".to_string(),
            });
            status = builder.build().0;
        }
        assert_eq!(status.conditions.len(), MAX_CONDITIONS);
        // The oldest three (Type0..Type2) should have been dropped.
        assert!(!status.conditions.iter().any(|c| c.type_ == "Type0"));
        assert!(status.conditions.iter().any(|c| c.type_ == "Type3"));
    }

    #[test]
    fn explicit_condition_replaces_same_type_in_place() {
        let status = NodeRefreshStatus::default();
        let (status, _) = StatusPatchBuilder::new(status, now())
            .condition(Condition {
                type_: "Warning".to_string(),
                status: "True".to_string(),
                last_transition_time: now().to_rfc3339(),
                reason: "UncordonFailed".to_string(),
                message: "first".to_string(),
            })
            .build();
        let (status, _) = StatusPatchBuilder::new(status, now())
            .condition(Condition {
                type_: "Warning".to_string(),
                status: "True".to_string(),
                last_transition_time: now().to_rfc3339(),
                reason: "UncordonFailed".to_string(),
                message: "second".to_string(),
            })
            .build();

        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].message, "second");
    }

    #[test]
    fn implicit_message_appends_rather_than_replacing_same_phase() {
        // Repeated status messages for the same phase (e.g. successive drain-retry updates
        // while `FindingNodes`) must each leave their own entry; only explicit conditions
        // replace by type.
        let status = NodeRefreshStatus {
            phase: NodeRefreshPhase::FindingNodes,
            ..Default::default()
        };
        let (status, _) = StatusPatchBuilder::new(status, now())
            .message("first attempt")
            .build();
        let (status, _) = StatusPatchBuilder::new(status, now())
            .message("second attempt")
            .build();

        assert_eq!(status.conditions.len(), 2);
        assert_eq!(status.conditions[0].message, "first attempt");
        assert_eq!(status.conditions[1].message, "second attempt");
    }

    #[test]
    fn disjoint_field_patches_commute() {
        let base = NodeRefreshStatus::default();

        let (via_phase_then_node, _) = {
            let s = StatusPatchBuilder::new(base.clone(), now())
                .phase(NodeRefreshPhase::ProcessingNode)
                .build()
                .0;
            StatusPatchBuilder::new(s, now())
                .current_node("node-a")
                .build()
        };

        let (via_node_then_phase, _) = {
            let s = StatusPatchBuilder::new(base, now())
                .current_node("node-a")
                .build()
                .0;
            StatusPatchBuilder::new(s, now())
                .phase(NodeRefreshPhase::ProcessingNode)
                .build()
        };

        assert_eq!(via_phase_then_node, via_node_then_phase);
    }
}
