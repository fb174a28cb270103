//! `StatefulCluster` status types.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AttemptOutcome, UpgradeState};

/// Condition on the `StatefulCluster` resource, upserted by `type`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeCondition {
    pub r#type: String,
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

/// Summary of the most recent finished attempt.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// Image the attempt tried to roll out.
    pub target_image: String,
    pub outcome: AttemptOutcome,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Operator request metadata recorded in status (force override, pause).
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
}

/// `StatefulCluster` status: the observed upgrade state, a projection of the
/// orchestrator record plus the durable image baseline.
///
/// NOTE: clearable `Option` fields have no `skip_serializing_if` so that `None`
/// serializes as `null` and JSON Merge Patch (RFC 7396) removes them.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatefulClusterStatus {
    /// Current upgrade state.
    #[serde(default)]
    pub phase: Option<UpgradeState>,

    /// Human-readable progress of the current step.
    #[serde(default)]
    pub progress: Option<String>,

    /// Last notable message (error, refusal, completion).
    #[serde(default)]
    pub message: Option<String>,

    /// Image the cluster last converged on. Absent until the first deployment is recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_image: Option<String>,

    /// Image before the last completed upgrade, the rollback target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_image: Option<String>,

    /// When the image baseline was first recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,

    /// When the last upgrade completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_upgrade_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub upgrade_paused: bool,

    #[serde(default)]
    pub can_pause: bool,

    #[serde(default)]
    pub can_cancel: bool,

    #[serde(default)]
    pub can_rollback: bool,

    /// Outcome of the most recent finished attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<AttemptRecord>,

    /// Force-proceed override used by the current attempt.
    #[serde(default)]
    pub force_override: Option<CommandRecord>,

    /// Pause request holding the current attempt.
    #[serde(default)]
    pub pause: Option<CommandRecord>,

    /// Number of explicit retries since the last completed upgrade.
    #[serde(default)]
    pub retry_count: u32,

    /// Conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<UpgradeCondition>,

    /// Last observed generation of the spec.
    #[serde(default)]
    pub observed_generation: i64,
}

impl StatefulClusterStatus {
    pub fn condition(&self, condition_type: &str) -> Option<&UpgradeCondition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_default() {
        let status = StatefulClusterStatus::default();
        assert!(status.phase.is_none());
        assert!(status.current_image.is_none());
        assert!(status.last_attempt.is_none());
        assert!(!status.upgrade_paused);
        assert!(!status.can_cancel);
        assert_eq!(status.retry_count, 0);
        assert!(status.conditions.is_empty());
    }

    #[test]
    fn test_status_serialization_roundtrip() {
        let status = StatefulClusterStatus {
            phase: Some(UpgradeState::WaitingForApproval),
            current_image: Some("registry.local/db:11.3.0".to_string()),
            last_attempt: Some(AttemptRecord {
                target_image: "registry.local/db:11.4.0".to_string(),
                outcome: AttemptOutcome::Failed,
                finished_at: Utc::now(),
                message: None,
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).unwrap();
        let deserialized: StatefulClusterStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, status);
    }

    #[test]
    fn test_condition_lookup() {
        let now = Utc::now();
        let status = StatefulClusterStatus {
            conditions: vec![UpgradeCondition {
                r#type: "UpgradeInProgress".to_string(),
                status: "True".to_string(),
                reason: "InProgress".to_string(),
                message: None,
                last_transition_time: now,
            }],
            ..Default::default()
        };
        assert_eq!(
            status.condition("UpgradeInProgress").map(|c| c.reason.as_str()),
            Some("InProgress")
        );
        assert!(status.condition("Ready").is_none());
    }

    /// Regression test: fields cleared between attempts MUST serialize as
    /// JSON `null` (not be omitted) so that JSON Merge Patch removes them.
    /// Otherwise a stale force override would leak into the next attempt.
    #[test]
    fn test_clearable_fields_serialize_as_null() {
        let status = StatefulClusterStatus::default();
        let json = serde_json::to_value(&status).unwrap();
        let obj = json.as_object().unwrap();

        for key in ["phase", "progress", "message", "forceOverride", "pause"] {
            assert!(obj.contains_key(key), "{key} must be present");
            assert!(obj[key].is_null(), "{key} must be null");
        }
        assert!(!obj.contains_key("currentImage"));
    }
}
