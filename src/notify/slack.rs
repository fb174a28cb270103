//! Slack notification support via Incoming Webhooks.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{Notification, Notifier, Severity, reason};
use crate::cluster::ClusterRef;

/// Normal-severity reasons worth a Slack message; warnings are always sent.
const MILESTONES: [&str; 5] = [
    reason::PRECHECK_STARTED,
    reason::AWAITING_APPROVAL,
    reason::UPGRADE_STARTED,
    reason::UPGRADE_COMPLETED,
    reason::UPGRADE_CANCELLED,
];

/// Structured Slack message for Block Kit rendering.
pub struct SlackMessage {
    pub header: String,
    pub fields: Vec<(String, String)>,
    pub context: String,
}

impl SlackMessage {
    pub fn from_notification(cluster: &ClusterRef, notification: &Notification) -> Self {
        let prefix = match notification.severity {
            Severity::Normal => "",
            Severity::Warning => "⚠️ ",
        };
        Self {
            header: format!("{prefix}{}", headline(notification.reason)),
            fields: vec![
                ("Cluster".to_string(), cluster.name.clone()),
                ("Namespace".to_string(), cluster.namespace.clone()),
                ("Reason".to_string(), notification.reason.to_string()),
                ("Details".to_string(), notification.message.clone()),
            ],
            context: format!("Sent by suo via StatefulCluster/{cluster}"),
        }
    }
}

/// "UpgradeCompleted" -> "Upgrade Completed".
fn headline(reason: &str) -> String {
    let mut out = String::with_capacity(reason.len() + 4);
    for (i, c) in reason.chars().enumerate() {
        if i > 0 && c.is_ascii_uppercase() {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

/// Slack webhook client.
pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    /// Create a new Slack notifier with the given webhook URL.
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn wants(notification: &Notification) -> bool {
        notification.severity == Severity::Warning || MILESTONES.contains(&notification.reason)
    }

    /// Send a Block Kit message to Slack. Errors are logged but not propagated.
    pub async fn send(&self, cluster: &ClusterRef, message: &SlackMessage) {
        let payload = build_blocks_payload(message);
        match self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) if !resp.status().is_success() => {
                warn!(
                    cluster = %cluster,
                    status = %resp.status(),
                    "Slack webhook returned non-success status"
                );
            }
            Err(e) => {
                warn!(
                    cluster = %cluster,
                    error = %e,
                    "Failed to send Slack notification"
                );
            }
            Ok(_) => {
                info!(
                    cluster = %cluster,
                    header = message.header.as_str(),
                    "Slack notification sent"
                );
            }
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, cluster: &ClusterRef, notification: &Notification) {
        if Self::wants(notification) {
            self.send(cluster, &SlackMessage::from_notification(cluster, notification))
                .await;
        }
    }
}

/// Build a Slack Block Kit payload from a [`SlackMessage`].
fn build_blocks_payload(message: &SlackMessage) -> Value {
    let mut blocks: Vec<Value> = Vec::new();

    // Header block
    blocks.push(json!({
        "type": "header",
        "text": {
            "type": "plain_text",
            "text": message.header,
            "emoji": true
        }
    }));

    // Section with fields (pairs of label/value as mrkdwn)
    if !message.fields.is_empty() {
        let fields: Vec<Value> = message
            .fields
            .iter()
            .map(|(label, value)| {
                json!({
                    "type": "mrkdwn",
                    "text": format!("*{label}*\n{value}")
                })
            })
            .collect();

        // Slack allows max 10 fields per section
        for chunk in fields.chunks(10) {
            blocks.push(json!({
                "type": "section",
                "fields": chunk
            }));
        }
    }

    blocks.push(json!({"type": "divider"}));

    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": message.context
        }]
    }));

    // Fallback text for clients that don't support blocks
    let fallback = format!("{}\n{}", message.header, message.context);

    json!({
        "text": fallback,
        "blocks": blocks
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headline() {
        assert_eq!(headline("UpgradeCompleted"), "Upgrade Completed");
        assert_eq!(headline("AwaitingApproval"), "Awaiting Approval");
        assert_eq!(headline("Idle"), "Idle");
    }

    #[test]
    fn test_message_from_warning() {
        let msg = SlackMessage::from_notification(
            &ClusterRef::new("db", "main"),
            &Notification::warning(reason::UPGRADE_FAILED, "rollout timed out after 60m"),
        );
        assert_eq!(msg.header, "⚠️ Upgrade Failed");
        assert!(
            msg.fields
                .iter()
                .any(|(k, v)| k == "Details" && v == "rollout timed out after 60m")
        );
        assert_eq!(msg.context, "Sent by suo via StatefulCluster/db/main");
    }

    #[test]
    fn test_filters_routine_events() {
        assert!(SlackNotifier::wants(&Notification::normal(
            reason::AWAITING_APPROVAL,
            "x"
        )));
        assert!(SlackNotifier::wants(&Notification::warning(
            reason::CANCELLATION_DENIED,
            "x"
        )));
        assert!(!SlackNotifier::wants(&Notification::normal(
            reason::BASELINE_RECORDED,
            "x"
        )));
        assert!(!SlackNotifier::wants(&Notification::normal(
            reason::PRECHECK_COMPLETED,
            "x"
        )));
    }

    #[test]
    fn test_build_blocks_payload_structure() {
        let msg = SlackMessage {
            header: "Test Header".to_string(),
            fields: vec![
                ("Cluster".to_string(), "main".to_string()),
                ("Namespace".to_string(), "db".to_string()),
            ],
            context: "Sent by suo".to_string(),
        };

        let payload = build_blocks_payload(&msg);
        let blocks = payload["blocks"].as_array().unwrap();

        // header, section, divider, context = 4 blocks
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0]["type"], "header");
        assert_eq!(blocks[0]["text"]["text"], "Test Header");
        assert_eq!(blocks[1]["type"], "section");
        assert_eq!(blocks[1]["fields"].as_array().unwrap().len(), 2);
        assert_eq!(blocks[2]["type"], "divider");
        assert_eq!(blocks[3]["type"], "context");

        assert!(payload["text"].as_str().unwrap().contains("Test Header"));
    }

    #[test]
    fn test_build_blocks_payload_empty_fields() {
        let msg = SlackMessage {
            header: "No Fields".to_string(),
            fields: vec![],
            context: "ctx".to_string(),
        };

        let payload = build_blocks_payload(&msg);
        let blocks = payload["blocks"].as_array().unwrap();

        // header, divider, context = 3 blocks (no section)
        assert_eq!(blocks.len(), 3);
    }

    #[test]
    fn test_field_mrkdwn_format() {
        let msg = SlackMessage {
            header: "H".to_string(),
            fields: vec![("Cluster".to_string(), "main".to_string())],
            context: "c".to_string(),
        };

        let payload = build_blocks_payload(&msg);
        let field_text = payload["blocks"][1]["fields"][0]["text"].as_str().unwrap();
        assert_eq!(field_text, "*Cluster*\nmain");
    }
}
