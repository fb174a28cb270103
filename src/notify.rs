//! Notification fan-out for upgrade lifecycle events.

pub mod events;
pub mod slack;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

pub use events::KubeEventNotifier;
pub use slack::SlackNotifier;

use crate::cluster::ClusterRef;

/// Event reasons emitted by the orchestrator.
pub mod reason {
    pub const BASELINE_RECORDED: &str = "BaselineRecorded";
    pub const UPGRADE_DETECTED: &str = "UpgradeDetected";
    pub const PRECHECK_STARTED: &str = "PrecheckStarted";
    pub const PRECHECK_COMPLETED: &str = "PrecheckCompleted";
    pub const AWAITING_APPROVAL: &str = "AwaitingApproval";
    pub const UPGRADE_STARTED: &str = "UpgradeStarted";
    pub const FORCE_PROCEED: &str = "ForceProceed";
    pub const FORCE_REJECTED: &str = "ForceRejected";
    pub const PROCEED_BLOCKED: &str = "ProceedBlocked";
    pub const UPGRADE_COMPLETED: &str = "UpgradeCompleted";
    pub const UPGRADE_FAILED: &str = "UpgradeFailed";
    pub const UPGRADE_CANCELLED: &str = "UpgradeCancelled";
    pub const CANCELLATION_DENIED: &str = "CancellationDenied";
    pub const UPGRADE_PAUSED: &str = "UpgradePaused";
    pub const UPGRADE_RESUMED: &str = "UpgradeResumed";
    pub const PAUSE_REJECTED: &str = "PauseRejected";
    pub const UPGRADE_RETRIED: &str = "UpgradeRetried";
    pub const RETRY_IGNORED: &str = "RetryIgnored";
    pub const STATE_RESET: &str = "StateReset";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub reason: &'static str,
    pub message: String,
}

impl Notification {
    pub fn normal(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Normal,
            reason,
            message: message.into(),
        }
    }

    pub fn warning(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            reason,
            message: message.into(),
        }
    }
}

/// Fire-and-forget delivery of notifications. Failures are logged, never returned.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, cluster: &ClusterRef, notification: &Notification);
}

/// Logs every notification and forwards it to all sinks concurrently.
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Arc<dyn Notifier>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, cluster: &ClusterRef, notification: &Notification) {
        match notification.severity {
            Severity::Normal => info!(
                cluster = %cluster,
                reason = notification.reason,
                "{}",
                notification.message
            ),
            Severity::Warning => warn!(
                cluster = %cluster,
                reason = notification.reason,
                "{}",
                notification.message
            ),
        }
        join_all(
            self.sinks
                .iter()
                .map(|sink| sink.notify(cluster, notification)),
        )
        .await;
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records notifications for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn reasons(&self) -> Vec<&'static str> {
            self.sent.lock().unwrap().iter().map(|n| n.reason).collect()
        }

        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, _cluster: &ClusterRef, notification: &Notification) {
            self.sent.lock().unwrap().push(notification.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    #[test]
    fn test_notification_constructors() {
        let n = Notification::warning(reason::PROCEED_BLOCKED, "1 check failed");
        assert_eq!(n.severity, Severity::Warning);
        assert_eq!(n.reason, "ProceedBlocked");
        assert_eq!(
            Notification::normal(reason::UPGRADE_STARTED, "go").severity,
            Severity::Normal
        );
    }

    #[tokio::test]
    async fn test_fanout_delivers_to_every_sink() {
        let first = Arc::new(RecordingNotifier::default());
        let second = Arc::new(RecordingNotifier::default());
        let fanout = FanoutNotifier::new(vec![first.clone(), second.clone()]);

        fanout
            .notify(
                &ClusterRef::new("db", "main"),
                &Notification::normal(reason::UPGRADE_COMPLETED, "done"),
            )
            .await;

        assert_eq!(first.reasons(), vec!["UpgradeCompleted"]);
        assert_eq!(second.reasons(), vec!["UpgradeCompleted"]);
    }
}
