//! Rollout executor: moves every member StatefulSet to the target image and
//! reports convergence.

pub mod health;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::Api;
use kube::api::{Patch, PatchParams};
use serde_json::json;
use tracing::{info, warn};

use crate::cluster::{self, ClusterRef, MemberGroup};
use crate::crd::StatefulClusterSpec;
use crate::error::SuoError;

use self::health::{Health, HealthProbe};

const FIELD_MANAGER: &str = "suo";

#[derive(Clone, Debug)]
pub struct RolloutRequest {
    pub cluster: ClusterRef,
    pub spec: StatefulClusterSpec,
    pub target_image: String,
}

/// Aggregate progress across member groups.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RolloutProgress {
    pub total_groups: usize,
    pub converged_groups: usize,
    pub desired_replicas: i32,
    pub updated_replicas: i32,
    /// Set once every group converged but the health probe has not passed.
    pub health: Option<String>,
}

impl RolloutProgress {
    pub fn from_groups(groups: &[MemberGroup], target_image: &str) -> Self {
        Self {
            total_groups: groups.len(),
            converged_groups: groups
                .iter()
                .filter(|g| g.is_converged_on(target_image))
                .count(),
            desired_replicas: groups.iter().map(|g| g.desired_replicas).sum(),
            updated_replicas: groups
                .iter()
                .filter(|g| g.image.as_deref() == Some(target_image))
                .map(|g| g.updated_replicas.min(g.ready_replicas))
                .sum(),
            health: None,
        }
    }

    pub const fn all_converged(&self) -> bool {
        self.converged_groups == self.total_groups
    }
}

impl fmt::Display for RolloutProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.health {
            Some(reason) => write!(
                f,
                "{}/{} groups converged, awaiting cluster health: {reason}",
                self.converged_groups, self.total_groups
            ),
            None => write!(
                f,
                "{}/{} groups converged, {}/{} replicas updated",
                self.converged_groups,
                self.total_groups,
                self.updated_replicas,
                self.desired_replicas
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolloutPoll {
    InProgress(RolloutProgress),
    Converged,
}

/// Drives the image rollout across member groups.
#[async_trait]
pub trait RolloutExecutor: Send + Sync {
    /// Point every member group at the target image. Idempotent.
    async fn start(&self, request: &RolloutRequest) -> Result<(), SuoError>;

    async fn status(&self, request: &RolloutRequest) -> Result<RolloutPoll, SuoError>;
}

/// [`RolloutExecutor`] that patches StatefulSet pod templates and lets the
/// StatefulSet controller perform the rolling update.
pub struct StatefulSetRollout {
    client: kube::Client,
    probe: Arc<dyn HealthProbe>,
}

impl StatefulSetRollout {
    pub fn new(client: kube::Client, probe: Arc<dyn HealthProbe>) -> Self {
        Self { client, probe }
    }

    fn api(&self, cluster: &ClusterRef) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &cluster.namespace)
    }
}

/// Strategic merge patch replacing one container's image; containers merge by name.
fn image_patch(container: &str, image: &str) -> serde_json::Value {
    json!({
        "spec": {
            "template": {
                "spec": {
                    "containers": [{ "name": container, "image": image }]
                }
            }
        }
    })
}

#[async_trait]
impl RolloutExecutor for StatefulSetRollout {
    async fn start(&self, request: &RolloutRequest) -> Result<(), SuoError> {
        let api = self.api(&request.cluster);
        let patch = image_patch(&request.spec.container_name, &request.target_image);

        for group in &request.spec.member_groups {
            match api
                .patch(
                    &group.name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Strategic(&patch),
                )
                .await
                .map_err(|e| SuoError::kube("rollout::start", e))
            {
                Ok(_) => info!(
                    cluster = %request.cluster,
                    group = group.name.as_str(),
                    image = request.target_image.as_str(),
                    "Member group image updated"
                ),
                Err(SuoError::NotFound(_, _)) => {
                    return Err(SuoError::MemberGroupNotFound(group.name.clone()));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn status(&self, request: &RolloutRequest) -> Result<RolloutPoll, SuoError> {
        let groups = cluster::read_member_groups(&self.api(&request.cluster), &request.spec).await?;
        if let Some(missing) = groups.iter().find(|g| !g.found) {
            return Err(SuoError::MemberGroupNotFound(missing.name.clone()));
        }

        let mut progress = RolloutProgress::from_groups(&groups, &request.target_image);
        if !progress.all_converged() {
            return Ok(RolloutPoll::InProgress(progress));
        }

        match self
            .probe
            .check(&request.cluster, request.spec.health_endpoint.as_deref())
            .await
        {
            Ok(Health::Healthy) => Ok(RolloutPoll::Converged),
            Ok(Health::Unhealthy(reason)) => {
                progress.health = Some(reason);
                Ok(RolloutPoll::InProgress(progress))
            }
            Err(e) => {
                warn!(cluster = %request.cluster, error = %e, "Health probe failed");
                progress.health = Some(e.to_string());
                Ok(RolloutPoll::InProgress(progress))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "registry.local/db:11.4.0";

    fn group(name: &str, image: &str, desired: i32, updated: i32, ready: i32) -> MemberGroup {
        MemberGroup {
            name: name.to_string(),
            desired_replicas: desired,
            ready_replicas: ready,
            updated_replicas: updated,
            image: Some(image.to_string()),
            observed: true,
            found: true,
        }
    }

    #[test]
    fn test_image_patch_targets_named_container() {
        let patch = image_patch("server", TARGET);
        let container = &patch["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["name"], "server");
        assert_eq!(container["image"], TARGET);
    }

    #[test]
    fn test_progress_partial() {
        let groups = [
            group("data", TARGET, 3, 1, 3),
            group("query", "registry.local/db:11.3.0", 2, 2, 2),
        ];
        let progress = RolloutProgress::from_groups(&groups, TARGET);
        assert_eq!(progress.converged_groups, 0);
        assert_eq!(progress.updated_replicas, 1);
        assert_eq!(progress.desired_replicas, 5);
        assert!(!progress.all_converged());
        assert_eq!(progress.to_string(), "0/2 groups converged, 1/5 replicas updated");
    }

    #[test]
    fn test_progress_converged() {
        let groups = [group("data", TARGET, 3, 3, 3), group("query", TARGET, 2, 2, 2)];
        let progress = RolloutProgress::from_groups(&groups, TARGET);
        assert!(progress.all_converged());
        assert_eq!(progress.updated_replicas, 5);
    }

    #[test]
    fn test_updated_but_not_ready_is_not_converged() {
        let groups = [group("data", TARGET, 3, 3, 2)];
        let progress = RolloutProgress::from_groups(&groups, TARGET);
        assert!(!progress.all_converged());
        assert_eq!(progress.updated_replicas, 2);
    }

    #[test]
    fn test_progress_awaiting_health_display() {
        let progress = RolloutProgress {
            total_groups: 2,
            converged_groups: 2,
            desired_replicas: 5,
            updated_replicas: 5,
            health: Some("http://main:8002/health returned 503".to_string()),
        };
        assert!(progress.to_string().contains("awaiting cluster health"));
    }
}
