//! `StatefulCluster` spec types.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::StatefulClusterStatus;

/// `StatefulCluster` spec defines the desired state of a stateful multi-node cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "suo.io",
    version = "v1alpha1",
    kind = "StatefulCluster",
    namespaced,
    status = "StatefulClusterStatus",
    printcolumn = r#"{"name":"IMAGE","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"CURRENT","type":"string","jsonPath":".status.currentImage"}"#,
    printcolumn = r#"{"name":"STATE","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"PROGRESS","type":"string","jsonPath":".status.progress"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StatefulClusterSpec {
    /// Desired container image for every member group.
    pub image: String,

    /// Name of the container to upgrade inside each member StatefulSet.
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Member groups; each maps to a StatefulSet of the same name.
    #[serde(default)]
    pub member_groups: Vec<MemberGroupSpec>,

    /// HTTP endpoint probed for cluster-wide health after all groups converge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,

    /// Secret that must exist for the license validity precheck.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_secret: Option<String>,

    /// Timeout configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<TimeoutConfig>,

    /// Precheck thresholds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precheck: Option<PrecheckConfig>,
}

/// A group of cluster members backed by one StatefulSet.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberGroupSpec {
    /// StatefulSet name.
    pub name: String,
    /// Desired replica count.
    pub replicas: i32,
}

/// Timeout configuration for asynchronous upgrade steps.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Precheck timeout in minutes (default: 30).
    #[serde(default = "default_precheck_timeout")]
    pub precheck_minutes: u64,

    /// Rollout convergence timeout in minutes (default: 60).
    #[serde(default = "default_rollout_timeout")]
    pub rollout_minutes: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            precheck_minutes: default_precheck_timeout(),
            rollout_minutes: default_rollout_timeout(),
        }
    }
}

/// Thresholds used by the precheck battery.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrecheckConfig {
    /// Maximum age of the last recorded backup in hours (default: 24).
    #[serde(default = "default_backup_max_age")]
    pub backup_max_age_hours: u64,

    /// Container restarts per pod above which a group is flagged (default: 5).
    #[serde(default = "default_max_restarts")]
    pub max_restarts: i32,
}

impl Default for PrecheckConfig {
    fn default() -> Self {
        Self {
            backup_max_age_hours: default_backup_max_age(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl StatefulClusterSpec {
    pub fn timeouts(&self) -> TimeoutConfig {
        self.timeouts.clone().unwrap_or_default()
    }

    pub fn precheck_config(&self) -> PrecheckConfig {
        self.precheck.clone().unwrap_or_default()
    }
}

fn default_container_name() -> String {
    "server".to_string()
}
const fn default_precheck_timeout() -> u64 {
    30
}
const fn default_rollout_timeout() -> u64 {
    60
}
const fn default_backup_max_age() -> u64 {
    24
}
const fn default_max_restarts() -> i32 {
    5
}
