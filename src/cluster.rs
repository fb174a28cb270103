//! Cluster identity and observed member-group state.

use std::fmt;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{Api, ResourceExt};

use crate::crd::{StatefulCluster, StatefulClusterSpec};
use crate::error::SuoError;

/// Identifies one `StatefulCluster` object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterRef {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
}

impl ClusterRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
        }
    }

    pub fn from_resource(obj: &StatefulCluster) -> Self {
        Self {
            uid: obj.uid(),
            ..Self::new(
                obj.namespace().unwrap_or_else(|| "default".to_string()),
                obj.name_any(),
            )
        }
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Observed state of one member group (one StatefulSet).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberGroup {
    pub name: String,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub updated_replicas: i32,
    /// Image of the upgraded container in the pod template.
    pub image: Option<String>,
    /// The StatefulSet controller has observed the latest spec generation.
    pub observed: bool,
    /// The StatefulSet exists.
    pub found: bool,
}

impl MemberGroup {
    pub fn missing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            desired_replicas: 0,
            ready_replicas: 0,
            updated_replicas: 0,
            image: None,
            observed: false,
            found: false,
        }
    }

    pub fn from_statefulset(name: &str, container: &str, sts: &StatefulSet) -> Self {
        let spec = sts.spec.as_ref();
        let status = sts.status.as_ref();
        let generation = sts.metadata.generation.unwrap_or(0);

        let image = spec
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|pod| pod.containers.iter().find(|c| c.name == container))
            .and_then(|c| c.image.clone());

        Self {
            name: name.to_string(),
            desired_replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
            ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
            updated_replicas: status.and_then(|s| s.updated_replicas).unwrap_or(0),
            image,
            observed: status
                .and_then(|s| s.observed_generation)
                .is_some_and(|observed| observed >= generation),
            found: true,
        }
    }

    pub const fn is_ready(&self) -> bool {
        self.found && self.ready_replicas == self.desired_replicas
    }

    /// Rolled out to `image` and fully ready.
    pub fn is_converged_on(&self, image: &str) -> bool {
        self.found
            && self.observed
            && self.updated_replicas == self.desired_replicas
            && self.ready_replicas == self.desired_replicas
            && self.image.as_deref() == Some(image)
    }
}

/// Read every member group named in `spec`. Missing StatefulSets are
/// reported with `found == false`.
pub async fn read_member_groups(
    api: &Api<StatefulSet>,
    spec: &StatefulClusterSpec,
) -> Result<Vec<MemberGroup>, SuoError> {
    let mut groups = Vec::with_capacity(spec.member_groups.len());
    for group in &spec.member_groups {
        let sts = api
            .get_opt(&group.name)
            .await
            .map_err(|e| SuoError::kube("cluster::read_member_groups", e))?;
        groups.push(match sts {
            Some(sts) => MemberGroup::from_statefulset(&group.name, &spec.container_name, &sts),
            None => MemberGroup::missing(&group.name),
        });
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use kube::api::ObjectMeta;

    use super::*;

    fn statefulset(generation: i64, observed: i64, ready: i32, updated: i32) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(3),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![
                            Container {
                                name: "log-shipper".to_string(),
                                image: Some("fluent-bit:3".to_string()),
                                ..Default::default()
                            },
                            Container {
                                name: "server".to_string(),
                                image: Some("registry.local/db:11.4.0".to_string()),
                                ..Default::default()
                            },
                        ],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                replicas: 3,
                observed_generation: Some(observed),
                ready_replicas: Some(ready),
                updated_replicas: Some(updated),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_cluster_ref_display() {
        assert_eq!(ClusterRef::new("db", "main").to_string(), "db/main");
    }

    #[test]
    fn test_member_group_picks_named_container() {
        let group = MemberGroup::from_statefulset("data", "server", &statefulset(2, 2, 3, 3));
        assert_eq!(group.image.as_deref(), Some("registry.local/db:11.4.0"));
        assert_eq!(group.desired_replicas, 3);
        assert!(group.observed);
        assert!(group.found);
    }

    #[test]
    fn test_member_group_converged() {
        let group = MemberGroup::from_statefulset("data", "server", &statefulset(2, 2, 3, 3));
        assert!(group.is_converged_on("registry.local/db:11.4.0"));
        assert!(!group.is_converged_on("registry.local/db:11.3.0"));
    }

    #[test]
    fn test_member_group_not_observed_is_not_converged() {
        let group = MemberGroup::from_statefulset("data", "server", &statefulset(3, 2, 3, 3));
        assert!(!group.observed);
        assert!(!group.is_converged_on("registry.local/db:11.4.0"));
    }

    #[test]
    fn test_member_group_partial_update() {
        let group = MemberGroup::from_statefulset("data", "server", &statefulset(2, 2, 3, 1));
        assert!(group.is_ready());
        assert!(!group.is_converged_on("registry.local/db:11.4.0"));
    }

    #[test]
    fn test_missing_group() {
        let group = MemberGroup::missing("query");
        assert!(!group.found);
        assert!(!group.is_ready());
    }
}
