//! Precheck report types and their JSON form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SuoError;

/// Result of a single check.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Warn => write!(f, "WARN"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrecheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub warnings: usize,
    pub failed: usize,
    pub can_proceed: bool,
}

impl Summary {
    pub fn from_results(results: &[PrecheckResult]) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        let failed = count(CheckStatus::Fail);
        Self {
            total: results.len(),
            passed: count(CheckStatus::Pass),
            warnings: count(CheckStatus::Warn),
            failed,
            can_proceed: failed == 0,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} passed, {} warning(s), {} failed",
            self.passed, self.total, self.warnings, self.failed
        )
    }
}

/// Outcome of one precheck battery, immutable once persisted.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrecheckReport {
    pub results: Vec<PrecheckResult>,
    pub summary: Summary,
    pub timestamp: DateTime<Utc>,
    pub cluster_ref: String,
}

impl PrecheckReport {
    pub fn new(cluster_ref: String, results: Vec<PrecheckResult>, timestamp: DateTime<Utc>) -> Self {
        Self {
            summary: Summary::from_results(&results),
            results,
            timestamp,
            cluster_ref,
        }
    }

    pub const fn can_proceed(&self) -> bool {
        self.summary.can_proceed
    }

    pub fn failed_checks(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.status == CheckStatus::Fail)
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn to_json(&self) -> Result<String, SuoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, SuoError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, status: CheckStatus) -> PrecheckResult {
        PrecheckResult {
            name: name.to_string(),
            status,
            message: format!("{name} {status}"),
            detail: None,
            remediation: None,
            timestamp: Utc::now(),
            duration_ms: 3,
        }
    }

    #[test]
    fn test_summary_counts() {
        let summary = Summary::from_results(&[
            result("a", CheckStatus::Pass),
            result("b", CheckStatus::Warn),
            result("c", CheckStatus::Pass),
        ]);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.warnings, 1);
        assert_eq!(summary.failed, 0);
        assert!(summary.can_proceed);
        assert_eq!(summary.to_string(), "2/3 passed, 1 warning(s), 0 failed");
    }

    #[test]
    fn test_single_fail_blocks_proceed() {
        let report = PrecheckReport::new(
            "db/main".to_string(),
            vec![
                result("Image Availability", CheckStatus::Pass),
                result("License Validity", CheckStatus::Fail),
            ],
            Utc::now(),
        );
        assert!(!report.can_proceed());
        assert_eq!(report.failed_checks(), vec!["License Validity"]);
    }

    #[test]
    fn test_empty_report_can_proceed() {
        let report = PrecheckReport::new("db/main".to_string(), vec![], Utc::now());
        assert!(report.can_proceed());
        assert_eq!(report.summary.total, 0);
    }

    #[test]
    fn test_json_shape() {
        let mut failing = result("Cluster Health", CheckStatus::Fail);
        failing.remediation = Some("wait for pods".to_string());
        let report = PrecheckReport::new("db/main".to_string(), vec![failing], Utc::now());

        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["clusterRef"], "db/main");
        assert_eq!(value["results"][0]["status"], "FAIL");
        assert_eq!(value["results"][0]["durationMs"], 3);
        assert_eq!(value["results"][0]["remediation"], "wait for pods");
        assert!(value["results"][0].get("detail").is_none());
        assert_eq!(value["summary"]["canProceed"], false);
    }

    #[test]
    fn test_json_round_trip_is_lossless() {
        let report = PrecheckReport::new(
            "db/main".to_string(),
            vec![result("Forest Health", CheckStatus::Warn)],
            Utc::now(),
        );
        let parsed = PrecheckReport::from_json(&report.to_json().unwrap()).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_corrupt_json_is_error() {
        let err = PrecheckReport::from_json("{\"results\": [").unwrap_err();
        assert!(matches!(err, SuoError::Serialization(_)));
    }
}
