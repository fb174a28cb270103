//! StatefulCluster controller - reconcile dispatch and error policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use tracing::{debug, error, warn};

use crate::cluster::ClusterRef;
use crate::crd::StatefulCluster;
use crate::error::SuoError;
use crate::orchestrator::{Orchestrator, Outcome};
use crate::telemetry::metrics::Metrics;

/// Shared context for the controller.
pub struct Context {
    pub orchestrator: Orchestrator,
    pub metrics: Arc<Metrics>,
}

/// Reconcile a StatefulCluster resource.
///
/// Each call advances the upgrade state machine by at most one step.
pub async fn reconcile(obj: Arc<StatefulCluster>, ctx: Arc<Context>) -> Result<Action, SuoError> {
    let cluster = ClusterRef::from_resource(&obj);
    let started = Instant::now();

    let result = ctx.orchestrator.advance(&cluster).await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(outcome) => {
            ctx.metrics
                .observe_reconcile(&cluster, result_label(&outcome), elapsed);
            ctx.metrics.record_state(&cluster, outcome.state);
            debug!(
                cluster = %cluster,
                state = %outcome.state,
                transitioned = outcome.transitioned,
                requeue_after = ?outcome.requeue_after,
                "Reconciled"
            );
            Ok(requeue_action(outcome.requeue_after))
        }
        Err(e) => {
            ctx.metrics.observe_reconcile(&cluster, "error", elapsed);
            Err(e)
        }
    }
}

fn result_label(outcome: &Outcome) -> &'static str {
    if !outcome.transitioned && outcome.requeue_after.is_some_and(|d| !d.is_zero()) {
        "requeue"
    } else {
        "success"
    }
}

/// Translate the orchestrator's requeue hint into a controller action.
fn requeue_action(after: Option<Duration>) -> Action {
    match after {
        Some(d) if d.is_zero() => Action::requeue(Duration::from_millis(100)),
        Some(d) => Action::requeue(d),
        None => Action::await_change(),
    }
}

/// Error policy for the controller.
pub fn error_policy(obj: Arc<StatefulCluster>, err: &SuoError, _ctx: Arc<Context>) -> Action {
    let cluster = ClusterRef::from_resource(&obj);
    if err.is_transient() {
        warn!(cluster = %cluster, error = %err, "Transient reconcile error, will retry");
    } else {
        error!(cluster = %cluster, error = %err, "Reconcile failed");
    }
    Action::requeue(Duration::from_secs(30))
}
