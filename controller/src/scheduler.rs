//! The periodic per-object timer that drives time-based phase transitions.
//!
//! This is deliberately a pure function of `(spec, status, now)`: `now` is always supplied by
//! the caller rather than read from the system clock here, so the decision tree is testable
//! with a plain `#[test]` and no mocked clock.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;

use models::node::{NodeRefreshPhase, NodeRefreshSpec, NodeRefreshStatus};
use models::status::StatusPatchBuilder;

const WAITING_COOLDOWN_CONDITION: &str = "WaitingCooldown";

/// Evaluates whether `status` is due for a time-based transition, returning the updated
/// status snapshot and the merge-patch to persist it if so. Returns `None` when the object
/// should be left alone until the next tick.
pub fn scheduler_tick(
    spec: &NodeRefreshSpec,
    status: &NodeRefreshStatus,
    now: DateTime<Utc>,
) -> Option<(NodeRefreshStatus, Value)> {
    match status.phase {
        // The reconciler owns the object while it's actively working; the scheduler yields.
        NodeRefreshPhase::FindingNodes | NodeRefreshPhase::ProcessingNode => None,
        NodeRefreshPhase::WaitingCooldown => cooldown_tick(spec, status, now),
        NodeRefreshPhase::Idle | NodeRefreshPhase::Succeeded | NodeRefreshPhase::Failed => {
            if refresh_due(spec, status, now) {
                Some(trigger_refresh(status.clone(), now))
            } else {
                None
            }
        }
    }
}

fn cooldown_tick(
    spec: &NodeRefreshSpec,
    status: &NodeRefreshStatus,
    now: DateTime<Utc>,
) -> Option<(NodeRefreshStatus, Value)> {
    let cooldown_elapsed = match status.latest_condition(WAITING_COOLDOWN_CONDITION) {
        Some(condition) => match DateTime::parse_from_rfc3339(&condition.last_transition_time) {
            Ok(transitioned_at) => {
                let transitioned_at = transitioned_at.with_timezone(&Utc);
                transitioned_at + ChronoDuration::seconds(spec.node_cooldown_seconds as i64) <= now
            }
            // A corrupt timestamp is treated the same as a missing one: reset defensively
            // rather than leave the object stuck in `WaitingCooldown` forever.
            Err(_) => true,
        },
        None => true,
    };

    if !cooldown_elapsed {
        return None;
    }

    let (idled_status, idle_patch) = StatusPatchBuilder::new(status.clone(), now)
        .phase(NodeRefreshPhase::Idle)
        .message("Cooldown finished")
        .build();

    if refresh_due(spec, &idled_status, now) {
        Some(trigger_refresh(idled_status, now))
    } else {
        Some((idled_status, idle_patch))
    }
}

/// A refresh is due when there is no record of a previous one, the record is malformed, or
/// the schedule interval has elapsed since the last one.
fn refresh_due(spec: &NodeRefreshSpec, status: &NodeRefreshStatus, now: DateTime<Utc>) -> bool {
    match status.last_refresh_time() {
        Ok(Some(last)) => now >= last + ChronoDuration::days(spec.refresh_schedule_days as i64),
        Ok(None) => true,
        Err(_) => true,
    }
}

fn trigger_refresh(status: NodeRefreshStatus, now: DateTime<Utc>) -> (NodeRefreshStatus, Value) {
    StatusPatchBuilder::new(status, now)
        .phase(NodeRefreshPhase::FindingNodes)
        .current_node("")
        .message("Refresh cycle triggered by schedule")
        .build()
}
