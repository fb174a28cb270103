//! Interactive upgrade orchestrator.
//!
//! A level-triggered state machine over the persisted [`UpgradeRecord`]:
//! every call to [`Orchestrator::advance`] reads the cluster, takes at most
//! one transition, commits it and returns a requeue hint.
//!
//! ```text
//! Idle -> PrecheckStarted -> PrecheckCompleted -> WaitingForApproval -> InProgress -> Completed
//!                 \                                      \                  \
//!                  +--> Failed / Cancelled <--------------+------------------+--> Failed
//! Completed | Failed | Cancelled -> Idle
//! ```

pub mod status;


use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::cluster::ClusterRef;
use crate::crd::{AttemptOutcome, StatefulClusterStatus, UpgradeState};
use crate::error::SuoError;
use crate::notify::{Notification, Notifier, reason};
use crate::precheck::{PrecheckPoll, PrecheckReport, PrecheckRequest, PrecheckRunner};
use crate::rollout::{RolloutExecutor, RolloutPoll, RolloutRequest};
use crate::store::{
    Commit, Intent, LAST_BACKUP_ANNOTATION, SignalKind, StateStore, StoredCluster, StoredState,
    UpgradeRecord,
};

use self::status::{
    CONDITION_PRECHECK_PASSED, attempt, can_retry, command, is_suppressed, project, set_condition,
};

/// Requeue delays for the waiting states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Intervals {
    pub precheck_poll: Duration,
    pub approval_poll: Duration,
    pub rollout_poll: Duration,
    pub conflict_retry: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            precheck_poll: Duration::from_secs(120),
            approval_poll: Duration::from_secs(300),
            rollout_poll: Duration::from_secs(120),
            conflict_retry: Duration::from_secs(5),
        }
    }
}

/// Result of one invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub state: UpgradeState,
    pub transitioned: bool,
    /// `Some(Duration::ZERO)` asks for an immediate re-invocation; `None` waits
    /// for the next change.
    pub requeue_after: Option<Duration>,
}

/// Mutable working copy of one invocation's decision.
struct Plan {
    record: UpgradeRecord,
    status: StatefulClusterStatus,
    consumed: Vec<SignalKind>,
    notifications: Vec<Notification>,
    requeue_after: Option<Duration>,
    now: DateTime<Utc>,
}

impl Plan {
    fn new(stored: &StoredCluster, now: DateTime<Utc>) -> Self {
        Self {
            record: stored.record.clone(),
            status: stored.status.clone(),
            consumed: Vec::new(),
            notifications: Vec::new(),
            requeue_after: None,
            now,
        }
    }

    fn enter(&mut self, state: UpgradeState) {
        self.record.state = StoredState::Known(state);
        self.record.state_since = Some(self.now);
    }

    fn consume(&mut self, kind: SignalKind) {
        if !self.consumed.contains(&kind) {
            self.consumed.push(kind);
        }
    }

    fn consume_control(&mut self, stored: &StoredCluster) {
        for kind in stored.signals.active_control() {
            self.consume(kind);
        }
    }

    fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    const fn requeue(&mut self, after: Duration) {
        self.requeue_after = Some(after);
    }
}

/// Drives upgrades for `StatefulCluster` objects.
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    prechecks: Arc<dyn PrecheckRunner>,
    rollout: Arc<dyn RolloutExecutor>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    intervals: Intervals,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        prechecks: Arc<dyn PrecheckRunner>,
        rollout: Arc<dyn RolloutExecutor>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        intervals: Intervals,
    ) -> Self {
        Self {
            store,
            prechecks,
            rollout,
            notifier,
            clock,
            intervals,
        }
    }

    /// Take at most one step for `cluster`.
    pub async fn advance(&self, cluster: &ClusterRef) -> Result<Outcome, SuoError> {
        let Some(stored) = self.store.load(cluster).await? else {
            debug!(cluster = %cluster, "Cluster no longer exists");
            return Ok(Outcome {
                state: UpgradeState::Idle,
                transitioned: false,
                requeue_after: None,
            });
        };

        let mut plan = Plan::new(&stored, self.clock.now());
        self.evaluate(&stored, &mut plan).await;
        self.finish(&stored, plan).await
    }

    async fn evaluate(&self, stored: &StoredCluster, plan: &mut Plan) {
        if let StoredState::Unrecognized(raw) = &stored.record.state {
            warn!(cluster = %stored.cluster, state = raw.as_str(), "Unrecognized upgrade state");
            plan.record = UpgradeRecord {
                report: stored.record.report.clone(),
                retry_count: stored.record.retry_count,
                ..UpgradeRecord::default()
            };
            plan.enter(UpgradeState::Idle);
            let message = format!("Unrecognized upgrade state '{raw}' reset to Idle");
            plan.status.message = Some(message.clone());
            plan.status.progress = None;
            plan.notify(Notification::warning(reason::STATE_RESET, message));
            plan.requeue(Duration::ZERO);
            return;
        }

        let state = stored.record.state();

        if state == UpgradeState::Idle && stored.status.current_image.is_none() {
            let image = stored.spec.image.clone();
            info!(cluster = %stored.cluster, image = image.as_str(), "Recording deployed image baseline");
            plan.status.deployed_at = Some(plan.now);
            plan.notify(Notification::normal(
                reason::BASELINE_RECORDED,
                format!("Recorded {image} as the deployed image"),
            ));
            plan.status.current_image = Some(image);
            return;
        }

        if state.is_active() && plan.record.state_since.is_none() {
            plan.record.state_since = Some(plan.now);
        }

        if let Some(intent) = &stored.signals.cancel {
            if state == UpgradeState::InProgress {
                // Carries the request identity so each new request is answered once.
                let message = format!(
                    "Cancellation requested by {} at {} refused: rollout in progress",
                    requester(intent),
                    intent
                        .requested_at
                        .map_or_else(|| "unknown time".to_string(), |t| t.to_rfc3339())
                );
                if stored.status.message.as_deref() != Some(message.as_str()) {
                    plan.notify(Notification::warning(
                        reason::CANCELLATION_DENIED,
                        message.clone(),
                    ));
                }
                plan.status.message = Some(message);
            } else {
                Self::cancel(stored, plan, intent);
                return;
            }
        }

        if Self::hold_for_pause(stored, plan) {
            return;
        }

        let result = match state {
            UpgradeState::Idle => self.on_idle(stored, plan).await,
            UpgradeState::PrecheckStarted => self.on_precheck_started(stored, plan).await,
            UpgradeState::PrecheckCompleted => {
                self.on_precheck_completed(stored, plan);
                Ok(())
            }
            UpgradeState::WaitingForApproval => self.on_waiting_for_approval(stored, plan).await,
            UpgradeState::InProgress => self.on_in_progress(stored, plan).await,
            UpgradeState::Completed | UpgradeState::Failed | UpgradeState::Cancelled => {
                self.on_terminal(stored, plan).await
            }
        };

        if let Err(e) = result {
            Self::fail(stored, plan, &e.to_string());
        }
    }

    async fn finish(&self, stored: &StoredCluster, plan: Plan) -> Result<Outcome, SuoError> {
        let Plan {
            record,
            mut status,
            consumed,
            notifications,
            requeue_after,
            now,
        } = plan;

        project(&mut status, &record, stored.generation, now);

        let mut commit = Commit::default();
        for (key, value) in record.to_annotations() {
            if stored.annotations.get(&key) != value.as_ref() {
                commit.annotations.insert(key, value);
            }
        }
        for kind in consumed {
            commit.consume(kind);
        }
        if status != stored.status {
            commit.status = Some(status);
        }

        let previous = stored.record.state();
        let next = record.state();
        let transitioned = record.state != stored.record.state;

        if !commit.is_empty() {
            match self
                .store
                .commit(&stored.cluster, stored.resource_version.as_deref(), commit)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    info!(cluster = %stored.cluster, error = %e, "Abandoning step after conflicting update");
                    return Ok(Outcome {
                        state: previous,
                        transitioned: false,
                        requeue_after: Some(self.intervals.conflict_retry),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        if transitioned {
            info!(cluster = %stored.cluster, from = %previous, to = %next, "State transition");
        }
        for notification in &notifications {
            self.notifier.notify(&stored.cluster, notification).await;
        }

        Ok(Outcome {
            state: next,
            transitioned,
            requeue_after,
        })
    }

    fn cancel(stored: &StoredCluster, plan: &mut Plan, intent: &Intent) {
        let state = stored.record.state();
        let target = attempt_target(stored);
        let message = format!(
            "Upgrade to {target} cancelled in {state} by {}: {}",
            requester(intent),
            intent.reason.as_deref().unwrap_or("no reason given")
        );

        plan.consume_control(stored);
        if state.is_active() {
            plan.status.last_attempt = Some(attempt(
                &target,
                AttemptOutcome::Cancelled,
                plan.now,
                Some(message.clone()),
            ));
        }
        plan.record.paused = false;
        plan.status.progress = None;
        plan.status.message = Some(message.clone());
        plan.enter(UpgradeState::Cancelled);
        plan.notify(Notification::normal(reason::UPGRADE_CANCELLED, message));
        plan.requeue(Duration::ZERO);
    }

    /// Apply pause and resume requests. Returns true when the attempt is held.
    fn hold_for_pause(stored: &StoredCluster, plan: &mut Plan) -> bool {
        let state = stored.record.state();
        let signals = &stored.signals;

        if stored.record.paused {
            if let Some(intent) = &signals.resume {
                plan.consume(SignalKind::Resume);
                if signals.pause.is_some() {
                    plan.consume(SignalKind::Pause);
                }
                plan.record.paused = false;
                // Time spent paused does not count against the step timeout.
                plan.record.state_since = Some(plan.now);
                plan.status.pause = None;
                plan.status.progress = None;
                plan.notify(Notification::normal(
                    reason::UPGRADE_RESUMED,
                    format!("Upgrade resumed in {state} by {}", requester(intent)),
                ));
                plan.requeue(Duration::ZERO);
                return true;
            }
            if signals.pause.is_some() {
                plan.consume(SignalKind::Pause);
            }
            plan.status.progress = Some(format!("Paused in {state}"));
            return true;
        }

        if let Some(intent) = &signals.pause {
            plan.consume(SignalKind::Pause);
            if state.is_pausable() {
                plan.record.paused = true;
                plan.status.pause = Some(command(intent));
                plan.status.progress = Some(format!("Paused in {state}"));
                plan.notify(Notification::normal(
                    reason::UPGRADE_PAUSED,
                    format!(
                        "Upgrade paused in {state} by {}: {}",
                        requester(intent),
                        intent.reason.as_deref().unwrap_or("no reason given")
                    ),
                ));
                return true;
            }
            let message = if state == UpgradeState::InProgress {
                "Pause refused: rollout in progress".to_string()
            } else {
                format!("Pause ignored: nothing to pause in {state}")
            };
            plan.notify(Notification::warning(reason::PAUSE_REJECTED, message));
        }

        if signals.resume.is_some() {
            plan.consume(SignalKind::Resume);
        }
        false
    }

    async fn on_idle(&self, stored: &StoredCluster, plan: &mut Plan) -> Result<(), SuoError> {
        let desired = stored.spec.image.as_str();

        if let Some(intent) = &stored.signals.retry {
            plan.consume(SignalKind::Retry);
            if can_retry(UpgradeState::Idle, &stored.status) {
                return self.begin_attempt(stored, plan, Some(intent)).await;
            }
            plan.notify(Notification::warning(
                reason::RETRY_IGNORED,
                "Retry ignored: the last attempt did not fail",
            ));
        }

        if stored.signals.trigger {
            return self.begin_attempt(stored, plan, None).await;
        }

        if stored.status.current_image.as_deref() == Some(desired) {
            return Ok(());
        }

        if is_suppressed(&stored.status, desired) {
            let outcome = stored
                .status
                .last_attempt
                .as_ref()
                .map_or(AttemptOutcome::Failed, |a| a.outcome);
            debug!(cluster = %stored.cluster, image = desired, "Auto-trigger suppressed");
            plan.status.message = Some(format!(
                "Upgrade to {desired} last ended {outcome}; set {} or {} to try again",
                SignalKind::Trigger.key(),
                SignalKind::Retry.key()
            ));
            return Ok(());
        }

        plan.notify(Notification::normal(
            reason::UPGRADE_DETECTED,
            format!(
                "Image change detected: {} -> {desired}",
                stored.status.current_image.as_deref().unwrap_or("unknown")
            ),
        ));
        self.begin_attempt(stored, plan, None).await
    }

    async fn begin_attempt(
        &self,
        stored: &StoredCluster,
        plan: &mut Plan,
        retry: Option<&Intent>,
    ) -> Result<(), SuoError> {
        let target = stored.spec.image.clone();
        plan.consume(SignalKind::Trigger);
        // Approval and hold requests apply to an attempt that already exists.
        for kind in [
            SignalKind::Proceed,
            SignalKind::Force,
            SignalKind::Pause,
            SignalKind::Resume,
        ] {
            if stored.signals.is_set(kind) {
                plan.consume(kind);
            }
        }
        plan.record.target_image = Some(target.clone());

        if let Some(intent) = retry {
            plan.consume(SignalKind::Retry);
            plan.record.retry_count += 1;
            plan.notify(Notification::normal(
                reason::UPGRADE_RETRIED,
                format!(
                    "Retry #{} of upgrade to {target} requested by {}",
                    plan.record.retry_count,
                    requester(intent)
                ),
            ));
        }

        self.prechecks
            .start(&precheck_request(stored, &target))
            .await?;

        plan.record.report = None;
        plan.record.paused = false;
        plan.status.force_override = None;
        plan.status.pause = None;
        plan.status.message = None;
        plan.status.progress = Some("Running prechecks".to_string());
        plan.status
            .conditions
            .retain(|c| c.r#type != CONDITION_PRECHECK_PASSED);
        plan.enter(UpgradeState::PrecheckStarted);
        plan.notify(Notification::normal(
            reason::PRECHECK_STARTED,
            format!(
                "Starting prechecks for upgrade {} -> {target}",
                stored.status.current_image.as_deref().unwrap_or("unknown")
            ),
        ));
        plan.requeue(Duration::ZERO);
        Ok(())
    }

    async fn on_precheck_started(
        &self,
        stored: &StoredCluster,
        plan: &mut Plan,
    ) -> Result<(), SuoError> {
        let limit = stored.spec.timeouts().precheck_minutes;
        if timed_out(plan, limit) {
            return Err(SuoError::Precheck(format!(
                "prechecks did not finish within {limit}m"
            )));
        }

        let target = attempt_target(stored);
        match self
            .prechecks
            .status(&precheck_request(stored, &target))
            .await?
        {
            PrecheckPoll::Running => {
                plan.status.progress = Some("Running prechecks".to_string());
                plan.requeue(self.intervals.precheck_poll);
            }
            PrecheckPoll::Done(report) => {
                plan.record.report = Some(report.to_json()?);
                let summary = report.summary.to_string();
                let (condition, condition_reason, notification) = if report.can_proceed() {
                    (
                        "True",
                        "ChecksPassed",
                        Notification::normal(
                            reason::PRECHECK_COMPLETED,
                            format!("Prechecks passed: {summary}"),
                        ),
                    )
                } else {
                    (
                        "False",
                        "ChecksFailed",
                        Notification::warning(
                            reason::PRECHECK_COMPLETED,
                            format!(
                                "Prechecks failed: {summary} ({})",
                                report.failed_checks().join(", ")
                            ),
                        ),
                    )
                };
                set_condition(
                    &mut plan.status,
                    CONDITION_PRECHECK_PASSED,
                    condition,
                    condition_reason,
                    Some(summary.clone()),
                    plan.now,
                );
                plan.status.progress = Some(format!("Prechecks finished: {summary}"));
                plan.enter(UpgradeState::PrecheckCompleted);
                plan.notify(notification);
                plan.requeue(Duration::ZERO);
            }
        }
        Ok(())
    }

    fn on_precheck_completed(&self, stored: &StoredCluster, plan: &mut Plan) {
        let target = attempt_target(stored);
        let proceed = SignalKind::Proceed.key();
        let message = match report_of(stored) {
            Some(report) if report.can_proceed() => format!(
                "Prechecks passed ({}). Set {proceed}=true to upgrade to {target}",
                report.summary
            ),
            Some(report) => format!(
                "Prechecks failed ({}): {}. Resolve the failures or set {}=true with a reason",
                report.summary,
                report.failed_checks().join(", "),
                SignalKind::Force.key()
            ),
            None => format!("Precheck report unavailable. Set {proceed}=true to upgrade to {target}"),
        };

        plan.status.progress = Some("Waiting for approval".to_string());
        plan.status.message = Some(message.clone());
        plan.enter(UpgradeState::WaitingForApproval);
        plan.notify(Notification::normal(reason::AWAITING_APPROVAL, message));
        plan.requeue(self.intervals.approval_poll);
    }

    async fn on_waiting_for_approval(
        &self,
        stored: &StoredCluster,
        plan: &mut Plan,
    ) -> Result<(), SuoError> {
        let signals = &stored.signals;

        if let Some(intent) = &signals.force {
            plan.consume(SignalKind::Force);
            let Some(force_reason) = intent.reason.clone() else {
                plan.notify(Notification::warning(
                    reason::FORCE_REJECTED,
                    format!(
                        "Force-proceed requires a non-empty {}-reason",
                        SignalKind::Force.key()
                    ),
                ));
                plan.requeue(self.intervals.approval_poll);
                return Ok(());
            };
            plan.consume(SignalKind::Proceed);
            self.start_rollout(stored, plan).await?;
            plan.status.force_override = Some(command(intent));
            plan.notify(Notification::warning(
                reason::FORCE_PROCEED,
                format!(
                    "Prechecks overridden by {}: {force_reason}",
                    requester(intent)
                ),
            ));
            return Ok(());
        }

        if signals.proceed {
            plan.consume(SignalKind::Proceed);
            if let Some(report) = report_of(stored).filter(|r| !r.can_proceed()) {
                let message = format!(
                    "Proceed blocked: {} precheck(s) failed ({})",
                    report.summary.failed,
                    report.failed_checks().join(", ")
                );
                plan.status.message = Some(message.clone());
                plan.notify(Notification::warning(reason::PROCEED_BLOCKED, message));
                plan.requeue(self.intervals.approval_poll);
                return Ok(());
            }
            return self.start_rollout(stored, plan).await;
        }

        plan.requeue(self.intervals.approval_poll);
        Ok(())
    }

    async fn start_rollout(&self, stored: &StoredCluster, plan: &mut Plan) -> Result<(), SuoError> {
        let target = attempt_target(stored);
        self.rollout
            .start(&rollout_request(stored, &target))
            .await?;

        plan.status.progress = Some(format!("Rolling out {target}"));
        plan.status.message = None;
        plan.enter(UpgradeState::InProgress);
        plan.notify(Notification::normal(
            reason::UPGRADE_STARTED,
            format!(
                "Rolling out {target} to {} member group(s)",
                stored.spec.member_groups.len()
            ),
        ));
        plan.requeue(self.intervals.rollout_poll);
        Ok(())
    }

    async fn on_in_progress(&self, stored: &StoredCluster, plan: &mut Plan) -> Result<(), SuoError> {
        let limit = stored.spec.timeouts().rollout_minutes;
        if timed_out(plan, limit) {
            return Err(SuoError::Rollout(format!(
                "rollout did not converge within {limit}m"
            )));
        }

        let target = attempt_target(stored);
        match self
            .rollout
            .status(&rollout_request(stored, &target))
            .await?
        {
            RolloutPoll::InProgress(progress) => {
                plan.status.progress = Some(progress.to_string());
                plan.requeue(self.intervals.rollout_poll);
            }
            RolloutPoll::Converged => {
                let previous = stored.status.current_image.clone();
                let message = format!(
                    "Upgraded {} -> {target}",
                    previous.as_deref().unwrap_or("unknown")
                );
                if previous.as_deref() != Some(target.as_str()) {
                    plan.status.previous_image = previous;
                }
                plan.status.current_image = Some(target.clone());
                plan.status.last_upgrade_time = Some(plan.now);
                plan.status.last_attempt = Some(attempt(
                    &target,
                    AttemptOutcome::Completed,
                    plan.now,
                    None,
                ));
                plan.status.progress = None;
                plan.status.message = Some(message.clone());
                plan.record.retry_count = 0;
                plan.enter(UpgradeState::Completed);
                plan.notify(Notification::normal(reason::UPGRADE_COMPLETED, message));
                plan.requeue(Duration::ZERO);
            }
        }
        Ok(())
    }

    async fn on_terminal(&self, stored: &StoredCluster, plan: &mut Plan) -> Result<(), SuoError> {
        if let Some(intent) = &stored.signals.retry
            && can_retry(stored.record.state(), &stored.status)
        {
            plan.consume_control(stored);
            return self.begin_attempt(stored, plan, Some(intent)).await;
        }

        plan.consume_control(stored);
        plan.record.target_image = None;
        plan.record.paused = false;
        plan.status.progress = None;
        plan.enter(UpgradeState::Idle);
        Ok(())
    }

    fn fail(stored: &StoredCluster, plan: &mut Plan, error: &str) {
        let state = stored.record.state();
        let target = plan
            .record
            .target_image
            .clone()
            .unwrap_or_else(|| stored.spec.image.clone());
        let message = format!("Upgrade to {target} failed in {state}: {error}");

        plan.status.last_attempt = Some(attempt(
            &target,
            AttemptOutcome::Failed,
            plan.now,
            Some(message.clone()),
        ));
        plan.status.message = Some(message.clone());
        plan.status.progress = None;
        plan.record.paused = false;
        plan.enter(UpgradeState::Failed);
        plan.notify(Notification::warning(reason::UPGRADE_FAILED, message));
        plan.requeue(Duration::ZERO);
    }
}

/// Image the current attempt rolls out.
fn attempt_target(stored: &StoredCluster) -> String {
    stored
        .record
        .target_image
        .clone()
        .unwrap_or_else(|| stored.spec.image.clone())
}

fn requester(intent: &Intent) -> &str {
    intent.requested_by.as_deref().unwrap_or("unknown")
}

fn timed_out(plan: &Plan, limit_minutes: u64) -> bool {
    let Some(limit) = i64::try_from(limit_minutes)
        .ok()
        .and_then(chrono::Duration::try_minutes)
    else {
        return false;
    };
    plan.record
        .state_since
        .is_some_and(|since| plan.now.signed_duration_since(since) > limit)
}

/// Parsed precheck report; a corrupt report is logged and treated as absent.
fn report_of(stored: &StoredCluster) -> Option<PrecheckReport> {
    let raw = stored.record.report.as_deref()?;
    match PrecheckReport::from_json(raw) {
        Ok(report) => Some(report),
        Err(e) => {
            warn!(cluster = %stored.cluster, error = %e, "Ignoring corrupt precheck report");
            None
        }
    }
}

fn precheck_request(stored: &StoredCluster, target: &str) -> PrecheckRequest {
    PrecheckRequest {
        cluster: stored.cluster.clone(),
        spec: stored.spec.clone(),
        target_image: target.to_string(),
        current_image: stored.status.current_image.clone(),
        skip_forest_check: stored.signals.skip_forest_check,
        last_backup_time: stored.annotations.get(LAST_BACKUP_ANNOTATION).cloned(),
    }
}

fn rollout_request(stored: &StoredCluster, target: &str) -> RolloutRequest {
    RolloutRequest {
        cluster: stored.cluster.clone(),
        spec: stored.spec.clone(),
        target_image: target.to_string(),
    }
}
