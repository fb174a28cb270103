//! Orchestrator-owned upgrade record persisted as annotations.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};

use super::ANNOTATION_PREFIX;
use crate::crd::UpgradeState;

const STATE: &str = "upgrade-state";
const STATE_SINCE: &str = "upgrade-state-since";
const TARGET_IMAGE: &str = "upgrade-target-image";
const PRECHECK_RESULTS: &str = "precheck-results";
const PAUSED: &str = "upgrade-paused";
const RETRY_COUNT: &str = "upgrade-retry-count";

pub fn key(suffix: &str) -> String {
    format!("{ANNOTATION_PREFIX}{suffix}")
}

/// Persisted state value. Unknown values are kept verbatim so they can be
/// logged before the record is reset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoredState {
    Known(UpgradeState),
    Unrecognized(String),
}

/// Record of the current upgrade attempt, written only by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeRecord {
    pub state: StoredState,
    /// When `state` was entered.
    pub state_since: Option<DateTime<Utc>>,
    pub target_image: Option<String>,
    /// Raw precheck report JSON.
    pub report: Option<String>,
    pub paused: bool,
    pub retry_count: u32,
}

impl Default for UpgradeRecord {
    fn default() -> Self {
        Self {
            state: StoredState::Known(UpgradeState::Idle),
            state_since: None,
            target_image: None,
            report: None,
            paused: false,
            retry_count: 0,
        }
    }
}

impl UpgradeRecord {
    pub fn parse(annotations: &BTreeMap<String, String>) -> Self {
        let get = |suffix: &str| {
            annotations
                .get(&key(suffix))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let state = match get(STATE) {
            None => StoredState::Known(UpgradeState::Idle),
            Some(raw) => raw
                .parse::<UpgradeState>()
                .map_or_else(StoredState::Unrecognized, StoredState::Known),
        };

        Self {
            state,
            state_since: get(STATE_SINCE)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc)),
            target_image: get(TARGET_IMAGE).map(str::to_string),
            report: get(PRECHECK_RESULTS).map(str::to_string),
            paused: get(PAUSED).is_some_and(|v| v.eq_ignore_ascii_case("true")),
            retry_count: get(RETRY_COUNT).and_then(|v| v.parse().ok()).unwrap_or(0),
        }
    }

    /// The state, with unrecognized values read as `Idle`.
    pub const fn state(&self) -> UpgradeState {
        match self.state {
            StoredState::Known(state) => state,
            StoredState::Unrecognized(_) => UpgradeState::Idle,
        }
    }

    /// Annotation values for every record field; `None` removes the key.
    pub fn to_annotations(&self) -> BTreeMap<String, Option<String>> {
        let state = match &self.state {
            StoredState::Known(state) => state.as_str().to_string(),
            StoredState::Unrecognized(raw) => raw.clone(),
        };
        BTreeMap::from([
            (key(STATE), Some(state)),
            (
                key(STATE_SINCE),
                self.state_since
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ),
            (key(TARGET_IMAGE), self.target_image.clone()),
            (key(PRECHECK_RESULTS), self.report.clone()),
            (key(PAUSED), self.paused.then(|| "true".to_string())),
            (
                key(RETRY_COUNT),
                (self.retry_count > 0).then(|| self.retry_count.to_string()),
            ),
        ])
    }
}
