//! Prometheus metrics for the suo operator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::info;

use crate::cluster::ClusterRef;
use crate::crd::UpgradeState;

/// Labels for reconcile metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub cluster_name: String,
    pub namespace: String,
    pub result: String,
}

/// Labels for cluster-level metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub cluster_name: String,
    pub namespace: String,
}

impl From<&ClusterRef> for ClusterLabels {
    fn from(cluster: &ClusterRef) -> Self {
        Self {
            cluster_name: cluster.name.clone(),
            namespace: cluster.namespace.clone(),
        }
    }
}

/// Labels for per-state metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    pub cluster_name: String,
    pub namespace: String,
    pub state: String,
}

impl StateLabels {
    fn new(cluster: &ClusterRef, state: UpgradeState) -> Self {
        Self {
            cluster_name: cluster.name.clone(),
            namespace: cluster.namespace.clone(),
            state: state.as_str().to_string(),
        }
    }
}

/// (namespace, name)
type ClusterKey = (String, String);

/// All Prometheus metrics for the operator.
pub struct Metrics {
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Family<ClusterLabels, Histogram>,
    pub upgrade_state_info: Family<StateLabels, Gauge>,
    pub state_transition_total: Family<StateLabels, Counter>,
    pub state_duration_seconds: Family<StateLabels, Histogram>,
    pub upgrade_completed_total: Family<ClusterLabels, Counter>,
    pub upgrade_failed_total: Family<ClusterLabels, Counter>,
    pub upgrade_cancelled_total: Family<ClusterLabels, Counter>,
    /// Last observed state per cluster and when this process first saw it.
    states: Mutex<HashMap<ClusterKey, (UpgradeState, Instant)>>,
}

const RECONCILE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// 1s to 2h: approval waits are human-paced.
const STATE_DURATION_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0,
];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "suo_reconcile",
            "Total number of reconcile calls",
            reconcile_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(RECONCILE_BUCKETS.iter().copied())
            });
        registry.register(
            "suo_reconcile_duration_seconds",
            "Duration of reconcile calls in seconds",
            reconcile_duration_seconds.clone(),
        );

        let upgrade_state_info = Family::<StateLabels, Gauge>::default();
        registry.register(
            "suo_upgrade_state_info",
            "Current upgrade state (1=active, 0=inactive)",
            upgrade_state_info.clone(),
        );

        let state_transition_total = Family::<StateLabels, Counter>::default();
        registry.register(
            "suo_state_transition",
            "Total number of transitions into each upgrade state",
            state_transition_total.clone(),
        );

        let state_duration_seconds = Family::<StateLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(STATE_DURATION_BUCKETS.iter().copied())
        });
        registry.register(
            "suo_state_duration_seconds",
            "Time spent in each upgrade state in seconds",
            state_duration_seconds.clone(),
        );

        let upgrade_completed_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "suo_upgrade_completed",
            "Total number of upgrades that reached Completed",
            upgrade_completed_total.clone(),
        );

        let upgrade_failed_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "suo_upgrade_failed",
            "Total number of upgrades that reached Failed",
            upgrade_failed_total.clone(),
        );

        let upgrade_cancelled_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "suo_upgrade_cancelled",
            "Total number of upgrades that reached Cancelled",
            upgrade_cancelled_total.clone(),
        );

        Self {
            reconcile_total,
            reconcile_duration_seconds,
            upgrade_state_info,
            state_transition_total,
            state_duration_seconds,
            upgrade_completed_total,
            upgrade_failed_total,
            upgrade_cancelled_total,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<ClusterKey, (UpgradeState, Instant)>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn observe_reconcile(&self, cluster: &ClusterRef, result: &str, seconds: f64) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                cluster_name: cluster.name.clone(),
                namespace: cluster.namespace.clone(),
                result: result.to_string(),
            })
            .inc();
        self.reconcile_duration_seconds
            .get_or_create(&ClusterLabels::from(cluster))
            .observe(seconds);
    }

    /// Record the state a reconcile left the cluster in.
    ///
    /// The first observation after startup only sets the state gauge; later
    /// changes count as transitions and observe the time spent in the
    /// previous state.
    pub fn record_state(&self, cluster: &ClusterRef, state: UpgradeState) {
        let key = (cluster.namespace.clone(), cluster.name.clone());
        let previous = {
            let mut states = self.states();
            if states.get(&key).is_some_and(|(last, _)| *last == state) {
                return;
            }
            states.insert(key, (state, Instant::now()))
        };

        if let Some((last, since)) = previous {
            self.state_duration_seconds
                .get_or_create(&StateLabels::new(cluster, last))
                .observe(since.elapsed().as_secs_f64());
            self.upgrade_state_info
                .get_or_create(&StateLabels::new(cluster, last))
                .set(0);
            self.state_transition_total
                .get_or_create(&StateLabels::new(cluster, state))
                .inc();

            let terminal = match state {
                UpgradeState::Completed => Some(&self.upgrade_completed_total),
                UpgradeState::Failed => Some(&self.upgrade_failed_total),
                UpgradeState::Cancelled => Some(&self.upgrade_cancelled_total),
                _ => None,
            };
            if let Some(counter) = terminal {
                counter.get_or_create(&ClusterLabels::from(cluster)).inc();
            }
        }

        self.upgrade_state_info
            .get_or_create(&StateLabels::new(cluster, state))
            .set(1);
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(port, "Metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
