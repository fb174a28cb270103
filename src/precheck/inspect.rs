//! Read-only cluster inspection used by the precheck battery.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Api;
use kube::api::ListParams;

use crate::cluster::{self, MemberGroup};
use crate::crd::StatefulClusterSpec;
use crate::error::SuoError;

/// Label EndpointSlices carry for their owning Service.
const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Facts about one cluster pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodFacts {
    pub name: String,
    pub phase: String,
    pub ready: bool,
    pub restarts: i32,
}

impl PodFacts {
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
            .is_some_and(|c| c.status == "True");
        let restarts = status
            .and_then(|s| s.container_statuses.as_ref())
            .map_or(0, |cs| cs.iter().map(|c| c.restart_count).sum());

        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            phase: status
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            ready,
            restarts,
        }
    }
}

/// Source of cluster facts for prechecks.
#[async_trait]
pub trait ClusterInspector: Send + Sync {
    async fn member_groups(
        &self,
        namespace: &str,
        spec: &StatefulClusterSpec,
    ) -> Result<Vec<MemberGroup>, SuoError>;

    /// Pods selected by the member group's StatefulSet.
    async fn pods(&self, namespace: &str, group: &str) -> Result<Vec<PodFacts>, SuoError>;

    /// Ready endpoints behind `service`; `None` when no EndpointSlice exists.
    async fn ready_endpoints(&self, namespace: &str, service: &str)
    -> Result<Option<usize>, SuoError>;

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, SuoError>;
}

/// [`ClusterInspector`] backed by the Kubernetes API.
pub struct KubeInspector {
    client: kube::Client,
}

impl KubeInspector {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterInspector for KubeInspector {
    async fn member_groups(
        &self,
        namespace: &str,
        spec: &StatefulClusterSpec,
    ) -> Result<Vec<MemberGroup>, SuoError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        cluster::read_member_groups(&api, spec).await
    }

    async fn pods(&self, namespace: &str, group: &str) -> Result<Vec<PodFacts>, SuoError> {
        let sts_api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let sts = sts_api
            .get(group)
            .await
            .map_err(|e| SuoError::kube("precheck::pods", e))?;

        let selector = sts
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.as_ref())
            .map(|labels| {
                labels
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SuoError::Precheck(format!("StatefulSet {group} has no label selector")))?;

        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = pod_api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| SuoError::kube("precheck::pods", e))?;

        Ok(pods.items.iter().map(PodFacts::from_pod).collect())
    }

    async fn ready_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<usize>, SuoError> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let slices = api
            .list(&ListParams::default().labels(&format!("{SERVICE_NAME_LABEL}={service}")))
            .await
            .map_err(|e| SuoError::kube("precheck::endpoints", e))?;

        if slices.items.is_empty() {
            return Ok(None);
        }

        // A nil ready condition means ready.
        let ready = slices
            .items
            .iter()
            .flat_map(|slice| slice.endpoints.iter())
            .filter(|ep| {
                ep.conditions
                    .as_ref()
                    .and_then(|c| c.ready)
                    .unwrap_or(true)
            })
            .count();
        Ok(Some(ready))
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, SuoError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|e| SuoError::kube("precheck::secret", e))?;
        Ok(secret.is_some())
    }
}
