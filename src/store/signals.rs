//! Operator intent signals carried as annotations on the `StatefulCluster`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::ANNOTATION_PREFIX;

/// A signal an operator sets to request an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Trigger,
    Proceed,
    Cancel,
    SkipForestCheck,
    Pause,
    Resume,
    Retry,
    Force,
}

impl SignalKind {
    /// Signals that drive the state machine. `SkipForestCheck` is an option and
    /// is never consumed.
    pub const CONTROL: [Self; 7] = [
        Self::Trigger,
        Self::Proceed,
        Self::Cancel,
        Self::Pause,
        Self::Resume,
        Self::Retry,
        Self::Force,
    ];

    const fn suffix(self) -> &'static str {
        match self {
            Self::Trigger => "trigger-upgrade",
            Self::Proceed => "proceed-with-upgrade",
            Self::Cancel => "cancel-upgrade",
            Self::SkipForestCheck => "skip-forest-check",
            Self::Pause => "pause-upgrade",
            Self::Resume => "resume-upgrade",
            Self::Retry => "retry-upgrade",
            Self::Force => "force-proceed",
        }
    }

    /// Annotation key of the signal itself.
    pub fn key(self) -> String {
        format!("{ANNOTATION_PREFIX}{}", self.suffix())
    }

    pub const fn carries_intent(self) -> bool {
        matches!(
            self,
            Self::Cancel | Self::Pause | Self::Resume | Self::Retry | Self::Force
        )
    }

    /// The signal key plus its metadata keys, all removed when consumed.
    pub fn keys(self) -> Vec<String> {
        let key = self.key();
        if self.carries_intent() {
            vec![
                format!("{key}-reason"),
                format!("{key}-requested-by"),
                format!("{key}-requested-at"),
                key,
            ]
        } else {
            vec![key]
        }
    }

    fn is_set(self, annotations: &BTreeMap<String, String>) -> bool {
        annotations
            .get(&self.key())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
    }

    fn intent(self, annotations: &BTreeMap<String, String>) -> Option<Intent> {
        if !self.is_set(annotations) {
            return None;
        }
        let key = self.key();
        let meta = |suffix: &str| {
            annotations
                .get(&format!("{key}-{suffix}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Some(Intent {
            reason: meta("reason"),
            requested_by: meta("requested-by"),
            requested_at: meta("requested-at")
                .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                .map(|t| t.with_timezone(&Utc)),
        })
    }
}

/// Who asked for an action, and why.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Intent {
    pub reason: Option<String>,
    pub requested_by: Option<String>,
    pub requested_at: Option<DateTime<Utc>>,
}

/// Typed view of the signals present on a cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signals {
    pub trigger: bool,
    pub proceed: bool,
    pub skip_forest_check: bool,
    pub cancel: Option<Intent>,
    pub pause: Option<Intent>,
    pub resume: Option<Intent>,
    pub retry: Option<Intent>,
    pub force: Option<Intent>,
}

impl Signals {
    pub fn parse(annotations: &BTreeMap<String, String>) -> Self {
        Self {
            trigger: SignalKind::Trigger.is_set(annotations),
            proceed: SignalKind::Proceed.is_set(annotations),
            skip_forest_check: SignalKind::SkipForestCheck.is_set(annotations),
            cancel: SignalKind::Cancel.intent(annotations),
            pause: SignalKind::Pause.intent(annotations),
            resume: SignalKind::Resume.intent(annotations),
            retry: SignalKind::Retry.intent(annotations),
            force: SignalKind::Force.intent(annotations),
        }
    }

    pub const fn is_set(&self, kind: SignalKind) -> bool {
        match kind {
            SignalKind::Trigger => self.trigger,
            SignalKind::Proceed => self.proceed,
            SignalKind::SkipForestCheck => self.skip_forest_check,
            SignalKind::Cancel => self.cancel.is_some(),
            SignalKind::Pause => self.pause.is_some(),
            SignalKind::Resume => self.resume.is_some(),
            SignalKind::Retry => self.retry.is_some(),
            SignalKind::Force => self.force.is_some(),
        }
    }

    /// Control signals currently set.
    pub fn active_control(&self) -> Vec<SignalKind> {
        SignalKind::CONTROL
            .into_iter()
            .filter(|kind| self.is_set(*kind))
            .collect()
    }
}
