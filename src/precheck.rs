//! Precheck runner.
//!
//! Runs a fixed battery of read-only checks against a cluster before an
//! upgrade is offered for approval:
//! - Image Availability: the target reference is well formed and pinned.
//! - Cluster Health: every member group exists and is fully ready.
//! - Data Store Connectivity: the client Service has ready endpoints.
//! - Forest Health: member pods are ready and not crash-looping (skippable).
//! - Resource Headroom: no cluster pods are stuck pending.
//! - Backup Freshness: a recent backup is recorded.
//! - License Validity: the configured license Secret exists.
//! - Network Connectivity: member Services route to all ready members.

pub mod checks;
pub mod inspect;
pub mod report;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::cluster::ClusterRef;
use crate::crd::StatefulClusterSpec;
use crate::error::SuoError;

use self::checks::{CheckOutcome, GroupEndpoints};
use self::inspect::{ClusterInspector, PodFacts};
pub use self::report::{PrecheckReport, PrecheckResult};

/// Everything the battery needs about one attempt.
#[derive(Clone, Debug)]
pub struct PrecheckRequest {
    pub cluster: ClusterRef,
    pub spec: StatefulClusterSpec,
    pub target_image: String,
    pub current_image: Option<String>,
    pub skip_forest_check: bool,
    /// Raw `suo.io/last-backup-time` annotation.
    pub last_backup_time: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrecheckPoll {
    Running,
    Done(PrecheckReport),
}

/// Runs prechecks for an upgrade attempt.
#[async_trait]
pub trait PrecheckRunner: Send + Sync {
    /// Begin prechecks. Safe to call more than once for the same attempt.
    async fn start(&self, request: &PrecheckRequest) -> Result<(), SuoError>;

    async fn status(&self, request: &PrecheckRequest) -> Result<PrecheckPoll, SuoError>;
}

/// [`PrecheckRunner`] that evaluates the battery synchronously once the
/// member StatefulSets have settled.
pub struct BatteryRunner {
    inspector: Arc<dyn ClusterInspector>,
    clock: Arc<dyn Clock>,
}

impl BatteryRunner {
    pub fn new(inspector: Arc<dyn ClusterInspector>, clock: Arc<dyn Clock>) -> Self {
        Self { inspector, clock }
    }

    fn stamp(&self, outcome: CheckOutcome, started: Instant) -> PrecheckResult {
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(check = outcome.name, status = %outcome.status, duration_ms, "Check finished");
        PrecheckResult {
            name: outcome.name.to_string(),
            status: outcome.status,
            message: outcome.message,
            detail: outcome.detail,
            remediation: outcome.remediation,
            timestamp: self.clock.now(),
            duration_ms,
        }
    }

    async fn cluster_pods(
        &self,
        namespace: &str,
        groups: &[crate::cluster::MemberGroup],
    ) -> Result<Vec<PodFacts>, SuoError> {
        let mut pods = Vec::new();
        for group in groups.iter().filter(|g| g.found) {
            pods.extend(self.inspector.pods(namespace, &group.name).await?);
        }
        Ok(pods)
    }

    async fn group_endpoints(
        &self,
        namespace: &str,
        groups: &[crate::cluster::MemberGroup],
    ) -> Result<Vec<GroupEndpoints>, SuoError> {
        let mut endpoints = Vec::new();
        for group in groups.iter().filter(|g| g.found) {
            endpoints.push(GroupEndpoints {
                group: group.name.clone(),
                ready_replicas: group.ready_replicas,
                ready_endpoints: self.inspector.ready_endpoints(namespace, &group.name).await?,
            });
        }
        Ok(endpoints)
    }
}

#[async_trait]
impl PrecheckRunner for BatteryRunner {
    async fn start(&self, request: &PrecheckRequest) -> Result<(), SuoError> {
        if request.spec.member_groups.is_empty() {
            return Err(SuoError::Precheck(format!(
                "{} declares no member groups",
                request.cluster
            )));
        }
        info!(
            cluster = %request.cluster,
            target = request.target_image.as_str(),
            "Starting prechecks"
        );
        Ok(())
    }

    async fn status(&self, request: &PrecheckRequest) -> Result<PrecheckPoll, SuoError> {
        let namespace = request.cluster.namespace.as_str();
        let groups = self
            .inspector
            .member_groups(namespace, &request.spec)
            .await?;

        if let Some(pending) = groups.iter().find(|g| g.found && !g.observed) {
            debug!(
                cluster = %request.cluster,
                group = pending.name.as_str(),
                "StatefulSet not yet observed, prechecks still running"
            );
            return Ok(PrecheckPoll::Running);
        }

        let mut results = Vec::with_capacity(8);

        let started = Instant::now();
        results.push(self.stamp(
            CheckOutcome::image_availability(&request.target_image, request.current_image.as_deref()),
            started,
        ));

        let started = Instant::now();
        results.push(self.stamp(CheckOutcome::cluster_health(&groups), started));

        let started = Instant::now();
        let outcome = match self
            .inspector
            .ready_endpoints(namespace, &request.cluster.name)
            .await
        {
            Ok(ready) => CheckOutcome::data_store_connectivity(&request.cluster.name, ready),
            Err(e) => CheckOutcome::not_evaluated(checks::DATA_STORE_CONNECTIVITY, &e.to_string()),
        };
        results.push(self.stamp(outcome, started));

        let started = Instant::now();
        let pods = self.cluster_pods(namespace, &groups).await;
        let max_restarts = request.spec.precheck_config().max_restarts;
        let outcome = match (&pods, request.skip_forest_check) {
            (_, true) => CheckOutcome::forest_health_skipped(),
            (Ok(pods), false) => CheckOutcome::forest_health(pods, max_restarts),
            (Err(e), false) => CheckOutcome::not_evaluated(checks::FOREST_HEALTH, &e.to_string()),
        };
        results.push(self.stamp(outcome, started));

        let started = Instant::now();
        let outcome = match &pods {
            Ok(pods) => CheckOutcome::resource_headroom(pods),
            Err(e) => CheckOutcome::not_evaluated(checks::RESOURCE_HEADROOM, &e.to_string()),
        };
        results.push(self.stamp(outcome, started));

        let started = Instant::now();
        results.push(self.stamp(
            CheckOutcome::backup_freshness(
                request.last_backup_time.as_deref(),
                self.clock.now(),
                request.spec.precheck_config().backup_max_age_hours,
            ),
            started,
        ));

        let started = Instant::now();
        let outcome = match request.spec.license_secret.as_deref() {
            None => CheckOutcome::license_validity(None, false),
            Some(secret) => match self.inspector.secret_exists(namespace, secret).await {
                Ok(exists) => CheckOutcome::license_validity(Some(secret), exists),
                Err(e) => CheckOutcome::not_evaluated(checks::LICENSE_VALIDITY, &e.to_string()),
            },
        };
        results.push(self.stamp(outcome, started));

        let started = Instant::now();
        let outcome = match self.group_endpoints(namespace, &groups).await {
            Ok(endpoints) => CheckOutcome::network_connectivity(&endpoints),
            Err(e) => CheckOutcome::not_evaluated(checks::NETWORK_CONNECTIVITY, &e.to_string()),
        };
        results.push(self.stamp(outcome, started));

        let report = PrecheckReport::new(request.cluster.to_string(), results, self.clock.now());
        if report.can_proceed() {
            info!(cluster = %request.cluster, summary = %report.summary, "Prechecks finished");
        } else {
            warn!(
                cluster = %request.cluster,
                summary = %report.summary,
                failed = ?report.failed_checks(),
                "Prechecks finished with failures"
            );
        }
        Ok(PrecheckPoll::Done(report))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use super::report::CheckStatus;
    use crate::clock::testing::ManualClock;
    use crate::cluster::MemberGroup;
    use crate::store::testing::spec;

    #[derive(Default)]
    struct FakeInspector {
        groups: Vec<MemberGroup>,
        pods: Vec<PodFacts>,
        endpoints: HashMap<String, usize>,
        secrets: Vec<String>,
        fail_pods: bool,
    }

    #[async_trait]
    impl ClusterInspector for FakeInspector {
        async fn member_groups(
            &self,
            _namespace: &str,
            _spec: &StatefulClusterSpec,
        ) -> Result<Vec<MemberGroup>, SuoError> {
            Ok(self.groups.clone())
        }

        async fn pods(&self, _namespace: &str, group: &str) -> Result<Vec<PodFacts>, SuoError> {
            if self.fail_pods {
                return Err(SuoError::KubernetesApi(
                    "precheck::pods".to_string(),
                    "forbidden".to_string(),
                ));
            }
            Ok(self
                .pods
                .iter()
                .filter(|p| p.name.starts_with(group))
                .cloned()
                .collect())
        }

        async fn ready_endpoints(
            &self,
            _namespace: &str,
            service: &str,
        ) -> Result<Option<usize>, SuoError> {
            Ok(self.endpoints.get(service).copied())
        }

        async fn secret_exists(&self, _namespace: &str, name: &str) -> Result<bool, SuoError> {
            Ok(self.secrets.iter().any(|s| s == name))
        }
    }

    fn ready_group(name: &str, replicas: i32) -> MemberGroup {
        MemberGroup {
            name: name.to_string(),
            desired_replicas: replicas,
            ready_replicas: replicas,
            updated_replicas: replicas,
            image: Some("registry.local/db:11.3.0".to_string()),
            observed: true,
            found: true,
        }
    }

    fn running_pod(name: &str) -> PodFacts {
        PodFacts {
            name: name.to_string(),
            phase: "Running".to_string(),
            ready: true,
            restarts: 0,
        }
    }

    fn healthy_inspector() -> FakeInspector {
        FakeInspector {
            groups: vec![ready_group("data", 3), ready_group("query", 2)],
            pods: vec![
                running_pod("data-0"),
                running_pod("data-1"),
                running_pod("data-2"),
                running_pod("query-0"),
                running_pod("query-1"),
            ],
            endpoints: HashMap::from([
                ("main".to_string(), 5),
                ("data".to_string(), 3),
                ("query".to_string(), 2),
            ]),
            ..Default::default()
        }
    }

    fn request() -> PrecheckRequest {
        PrecheckRequest {
            cluster: ClusterRef::new("db", "main"),
            spec: spec("registry.local/db:11.4.0"),
            target_image: "registry.local/db:11.4.0".to_string(),
            current_image: Some("registry.local/db:11.3.0".to_string()),
            skip_forest_check: false,
            last_backup_time: Some("2026-03-01T06:00:00Z".to_string()),
        }
    }

    fn runner(inspector: FakeInspector) -> BatteryRunner {
        BatteryRunner::new(
            Arc::new(inspector),
            Arc::new(ManualClock::at("2026-03-01T10:00:00Z")),
        )
    }

    async fn report(runner: &BatteryRunner, request: &PrecheckRequest) -> PrecheckReport {
        match runner.status(request).await.unwrap() {
            PrecheckPoll::Done(report) => report,
            PrecheckPoll::Running => panic!("expected a finished report"),
        }
    }

    fn status_of(report: &PrecheckReport, name: &str) -> CheckStatus {
        report
            .results
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.status)
            .unwrap()
    }

    #[tokio::test]
    async fn test_healthy_cluster_passes_all_checks() {
        let runner = runner(healthy_inspector());
        let report = report(&runner, &request()).await;
        assert_eq!(report.summary.total, 8);
        assert_eq!(report.summary.passed, 8, "{:?}", report.results);
        assert!(report.can_proceed());
        assert_eq!(report.cluster_ref, "db/main");
    }

    #[tokio::test]
    async fn test_battery_order() {
        let runner = runner(healthy_inspector());
        let report = report(&runner, &request()).await;
        let names: Vec<&str> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                checks::IMAGE_AVAILABILITY,
                checks::CLUSTER_HEALTH,
                checks::DATA_STORE_CONNECTIVITY,
                checks::FOREST_HEALTH,
                checks::RESOURCE_HEADROOM,
                checks::BACKUP_FRESHNESS,
                checks::LICENSE_VALIDITY,
                checks::NETWORK_CONNECTIVITY,
            ]
        );
    }

    #[tokio::test]
    async fn test_unobserved_statefulset_keeps_running() {
        let mut inspector = healthy_inspector();
        inspector.groups[0].observed = false;
        let runner = runner(inspector);
        assert_eq!(
            runner.status(&request()).await.unwrap(),
            PrecheckPoll::Running
        );
    }

    #[tokio::test]
    async fn test_missing_license_secret_blocks() {
        let runner = runner(healthy_inspector());
        let mut request = request();
        request.spec.license_secret = Some("db-license".to_string());
        let report = report(&runner, &request).await;
        assert_eq!(status_of(&report, checks::LICENSE_VALIDITY), CheckStatus::Fail);
        assert!(!report.can_proceed());
    }

    #[tokio::test]
    async fn test_skip_forest_check_reports_pass() {
        let mut inspector = healthy_inspector();
        inspector.pods[0].restarts = 50;
        let runner = runner(inspector);

        let report_default = report(&runner, &request()).await;
        assert_eq!(
            status_of(&report_default, checks::FOREST_HEALTH),
            CheckStatus::Warn
        );

        let mut skipping = request();
        skipping.skip_forest_check = true;
        let report_skipped = report(&runner, &skipping).await;
        let forest = report_skipped
            .results
            .iter()
            .find(|r| r.name == checks::FOREST_HEALTH)
            .unwrap();
        assert_eq!(forest.status, CheckStatus::Pass);
        assert!(forest.message.contains("skipped per annotation"));
    }

    #[tokio::test]
    async fn test_fact_gathering_failure_is_warning() {
        let mut inspector = healthy_inspector();
        inspector.fail_pods = true;
        let runner = runner(inspector);
        let report = report(&runner, &request()).await;
        assert_eq!(status_of(&report, checks::FOREST_HEALTH), CheckStatus::Warn);
        assert_eq!(
            status_of(&report, checks::RESOURCE_HEADROOM),
            CheckStatus::Warn
        );
        assert!(report.can_proceed());
    }

    #[tokio::test]
    async fn test_stale_backup_warns() {
        let runner = runner(healthy_inspector());
        let mut request = request();
        request.last_backup_time = Some("2026-02-20T00:00:00Z".to_string());
        let report = report(&runner, &request).await;
        assert_eq!(status_of(&report, checks::BACKUP_FRESHNESS), CheckStatus::Warn);
        assert_eq!(report.summary.warnings, 1);
    }

    #[tokio::test]
    async fn test_unready_group_fails() {
        let mut inspector = healthy_inspector();
        inspector.groups[1].ready_replicas = 1;
        let runner = runner(inspector);
        let report = report(&runner, &request()).await;
        assert_eq!(status_of(&report, checks::CLUSTER_HEALTH), CheckStatus::Fail);
        assert_eq!(report.failed_checks(), vec![checks::CLUSTER_HEALTH]);
    }

    #[tokio::test]
    async fn test_start_rejects_empty_member_groups() {
        let runner = runner(healthy_inspector());
        let mut request = request();
        request.spec.member_groups.clear();
        assert!(matches!(
            runner.start(&request).await,
            Err(SuoError::Precheck(_))
        ));
        assert!(runner.start(&self::request()).await.is_ok());
    }
}
