//! Kubernetes event sink.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

use super::{Notification, Notifier, Severity};
use crate::cluster::ClusterRef;
use crate::crd::StatefulCluster;

/// Publishes notifications as events on the `StatefulCluster` object.
pub struct KubeEventNotifier {
    recorder: Recorder,
}

impl KubeEventNotifier {
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: "suo".into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

/// Reference to the `StatefulCluster` object events are attached to.
pub fn object_reference(cluster: &ClusterRef) -> ObjectReference {
    ObjectReference {
        api_version: Some(StatefulCluster::api_version(&()).into_owned()),
        kind: Some(StatefulCluster::kind(&()).into_owned()),
        name: Some(cluster.name.clone()),
        namespace: Some(cluster.namespace.clone()),
        uid: cluster.uid.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl Notifier for KubeEventNotifier {
    async fn notify(&self, cluster: &ClusterRef, notification: &Notification) {
        let type_ = match notification.severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        };
        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: notification.reason.into(),
                    note: Some(notification.message.clone()),
                    action: notification.reason.into(),
                    secondary: None,
                },
                &object_reference(cluster),
            )
            .await
            .unwrap_or_else(|e| warn!(cluster = %cluster, "Failed to publish event: {}", e));
    }
}
