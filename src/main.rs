//! suo - Stateful Upgrade Orchestrator.
//!
//! Watches `StatefulCluster` resources and drives image upgrades through
//! prechecks, an explicit operator approval gate and a StatefulSet rollout,
//! with pause, cancel, retry and force-proceed controls carried as annotations.

mod clock;
mod cluster;
mod config;
mod controller;
mod crd;
mod error;
mod notify;
mod orchestrator;
mod precheck;
mod rollout;
mod store;
mod telemetry;

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::Controller;
use kube::runtime::watcher;
use kube::{Api, CustomResourceExt};
use tracing::{error, info};

use clock::SystemClock;
use config::Config;
use controller::Context;
use crd::StatefulCluster;
use notify::{FanoutNotifier, KubeEventNotifier, Notifier, SlackNotifier};
use orchestrator::Orchestrator;
use precheck::BatteryRunner;
use precheck::inspect::KubeInspector;
use rollout::StatefulSetRollout;
use rollout::health::HttpHealthProbe;
use store::KubeStateStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

#[tokio::main]
async fn main() {
    if std::env::args().nth(1).as_deref() == Some("crd") {
        match serde_yaml::to_string(&StatefulCluster::crd()) {
            Ok(yaml) => print!("{yaml}"),
            Err(e) => {
                eprintln!("Failed to render CRD: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    // Initialize logging
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        version = VERSION,
        commit = COMMIT,
        build_date = BUILD_DATE,
        "Starting suo"
    );

    if let Err(e) = run().await {
        error!("Operator failed: {e:#}");
        std::process::exit(1);
    }
}

/// Initialize tracing subscriber with JSON format for production.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .init();

    Ok(())
}

/// Main operator loop.
async fn run() -> Result<()> {
    let config = Config::load()?;
    info!(
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        health_port = config.health_port,
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Initialize Prometheus metrics
    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(telemetry::metrics::Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = telemetry::health::HealthState::new();
    let health_state_clone = health_state.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::health::serve(health_port, health_state_clone).await {
            error!("Health server failed: {e}");
        }
    });

    let registry_clone = registry.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::metrics::serve(metrics_port, registry_clone).await {
            error!("Metrics server failed: {e}");
        }
    });

    let mut sinks: Vec<Arc<dyn Notifier>> = vec![Arc::new(KubeEventNotifier::new(client.clone()))];
    if let Some(url) = config.slack_webhook_url.clone() {
        info!("Slack notifications enabled");
        sinks.push(Arc::new(SlackNotifier::new(url)));
    }

    let clock = Arc::new(SystemClock);
    let probe = Arc::new(HttpHealthProbe::new(config.health_probe_timeout())?);
    let orchestrator = Orchestrator::new(
        Arc::new(KubeStateStore::new(client.clone())),
        Arc::new(BatteryRunner::new(
            Arc::new(KubeInspector::new(client.clone())),
            clock.clone(),
        )),
        Arc::new(StatefulSetRollout::new(client.clone(), probe)),
        Arc::new(FanoutNotifier::new(sinks)),
        clock,
        config.intervals(),
    );

    let (clusters, statefulsets): (Api<StatefulCluster>, Api<StatefulSet>) =
        match config.watch_namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            ),
            None => (Api::all(client.clone()), Api::all(client.clone())),
        };

    let ctx = Arc::new(Context {
        orchestrator,
        metrics,
    });

    // Mark as ready once controller starts
    health_state.set_ready(true);

    info!("Starting StatefulCluster controller");
    Controller::new(clusters, watcher::Config::default())
        .owns(statefulsets, watcher::Config::default())
        .shutdown_on_signal()
        .run(controller::reconcile, controller::error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => tracing::debug!(cluster = %obj, "Reconcile finished"),
                Err(e) => error!("Reconcile failed: {e}"),
            }
        })
        .await;

    Ok(())
}
