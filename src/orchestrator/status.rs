//! Status projection and condition helpers.

use chrono::{DateTime, Utc};

use crate::crd::{
    AttemptOutcome, AttemptRecord, CommandRecord, StatefulClusterStatus, UpgradeCondition,
    UpgradeState,
};
use crate::store::{Intent, UpgradeRecord};

pub const CONDITION_UPGRADE_IN_PROGRESS: &str = "UpgradeInProgress";
pub const CONDITION_PRECHECK_PASSED: &str = "PrecheckPassed";

/// Upsert a condition by type. The transition time only moves when the
/// condition status changes.
pub fn set_condition(
    status: &mut StatefulClusterStatus,
    condition_type: &str,
    condition_status: &str,
    reason: &str,
    message: Option<String>,
    now: DateTime<Utc>,
) {
    let last_transition_time = status
        .condition(condition_type)
        .filter(|c| c.status == condition_status)
        .map_or(now, |c| c.last_transition_time);

    status.conditions.retain(|c| c.r#type != condition_type);
    status.conditions.push(UpgradeCondition {
        r#type: condition_type.to_string(),
        status: condition_status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time,
    });
}

/// Mirror the record into the fields derived from it.
pub fn project(
    status: &mut StatefulClusterStatus,
    record: &UpgradeRecord,
    generation: i64,
    now: DateTime<Utc>,
) {
    let state = record.state();
    status.phase = Some(state);
    status.upgrade_paused = record.paused;
    status.retry_count = record.retry_count;
    status.can_pause = state.is_pausable() && !record.paused;
    status.can_cancel = state != UpgradeState::InProgress;
    status.can_rollback = status.previous_image.is_some() && !state.is_active();
    status.observed_generation = generation;
    if !record.paused {
        status.pause = None;
    }

    let (condition_status, message) = if state.is_active() {
        ("True", status.progress.clone())
    } else {
        ("False", None)
    };
    set_condition(
        status,
        CONDITION_UPGRADE_IN_PROGRESS,
        condition_status,
        state.as_str(),
        message,
        now,
    );
}

pub fn attempt(
    target_image: &str,
    outcome: AttemptOutcome,
    finished_at: DateTime<Utc>,
    message: Option<String>,
) -> AttemptRecord {
    AttemptRecord {
        target_image: target_image.to_string(),
        outcome,
        finished_at,
        message,
    }
}

pub fn command(intent: &Intent) -> CommandRecord {
    CommandRecord {
        reason: intent.reason.clone(),
        requested_by: intent.requested_by.clone(),
        requested_at: intent.requested_at,
    }
}

/// Image drift on this target must not auto-trigger another attempt.
pub fn is_suppressed(status: &StatefulClusterStatus, desired_image: &str) -> bool {
    status.last_attempt.as_ref().is_some_and(|a| {
        a.target_image == desired_image
            && matches!(a.outcome, AttemptOutcome::Failed | AttemptOutcome::Cancelled)
    })
}

/// Retry is accepted from `Failed`, and from `Idle` after a failed attempt.
pub fn can_retry(state: UpgradeState, status: &StatefulClusterStatus) -> bool {
    match state {
        UpgradeState::Failed => true,
        UpgradeState::Idle => status
            .last_attempt
            .as_ref()
            .is_some_and(|a| a.outcome == AttemptOutcome::Failed),
        _ => false,
    }
}
