//! Enum types for upgrade states and attempt outcomes.

use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// State of the interactive upgrade workflow.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum UpgradeState {
    Idle,
    PrecheckStarted,
    PrecheckCompleted,
    WaitingForApproval,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl UpgradeState {
    pub const ALL: [Self; 8] = [
        Self::Idle,
        Self::PrecheckStarted,
        Self::PrecheckCompleted,
        Self::WaitingForApproval,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::PrecheckStarted => "PrecheckStarted",
            Self::PrecheckCompleted => "PrecheckCompleted",
            Self::WaitingForApproval => "WaitingForApproval",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// States in which an attempt exists and has not yet finished.
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::PrecheckStarted | Self::PrecheckCompleted | Self::WaitingForApproval | Self::InProgress
        )
    }

    /// States an operator may hold with a pause request.
    pub const fn is_pausable(self) -> bool {
        matches!(
            self,
            Self::PrecheckStarted | Self::PrecheckCompleted | Self::WaitingForApproval
        )
    }
}

impl std::fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// How an upgrade attempt ended.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum AttemptOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}
