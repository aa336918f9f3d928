//! SCM status/auto-merge (§4.M), inbound webhook replay (§4.N), and
//! outbound build-notification webhooks (Slack/Discord/generic) for the
//! Chengis build execution engine.
//!
//! # Example
//!
//! ```ignore
//! use chengis_webhook::{NotificationConfig, send_notification, build_completed_payload};
//! use chengis_types::BuildStatus;
//!
//! let config = NotificationConfig {
//!     url: "https://hooks.slack.com/services/...".to_string(),
//!     webhook_type: WebhookType::Slack,
//!     ..Default::default()
//! };
//!
//! let payload = build_completed_payload("nightly-build", 42, BuildStatus::Success, None);
//! send_notification(&config, &payload).expect("send");
//! ```

pub mod replay;
pub mod scm;

use std::time::Duration;

use anyhow::{Context, Result};
use chengis_types::BuildStatus;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Outbound notification channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookType {
    #[default]
    Generic,
    Slack,
    Discord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub url: String,
    #[serde(default)]
    pub webhook_type: WebhookType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { url: String::new(), webhook_type: WebhookType::default(), secret: None, timeout_secs: default_timeout() }
    }
}

/// Build-completion notification payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: std::collections::BTreeMap<String, serde_json::Value>,
}

pub fn send_notification(config: &NotificationConfig, payload: &NotificationPayload) -> Result<()> {
    let client = reqwest::blocking::Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build().context("failed to create HTTP client")?;

    let body = match config.webhook_type {
        WebhookType::Generic => serde_json::to_string(payload)?,
        WebhookType::Slack => slack_payload(payload)?,
        WebhookType::Discord => discord_payload(payload)?,
    };

    let response = client.post(&config.url).header("Content-Type", "application/json").body(body).send().context("failed to send webhook request")?;

    if !response.status().is_success() {
        return Err(anyhow::anyhow!("webhook request failed with status {}: {}", response.status(), response.text().unwrap_or_default()));
    }
    Ok(())
}

pub async fn send_notification_async(config: &NotificationConfig, payload: &NotificationPayload) -> Result<()> {
    let client = reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build().context("failed to create HTTP client")?;

    let body = match config.webhook_type {
        WebhookType::Generic => serde_json::to_string(payload)?,
        WebhookType::Slack => slack_payload(payload)?,
        WebhookType::Discord => discord_payload(payload)?,
    };

    let response = client.post(&config.url).header("Content-Type", "application/json").body(body).send().await.context("failed to send webhook request")?;

    if !response.status().is_success() {
        return Err(anyhow::anyhow!("webhook request failed with status {}: {}", response.status(), response.text().await.unwrap_or_default()));
    }
    Ok(())
}

fn slack_payload(payload: &NotificationPayload) -> Result<String> {
    let color = if payload.success { "good" } else { "danger" };
    let mut fields = vec![];

    if let Some(job_name) = &payload.job_name {
        fields.push(json!({ "title": "Job", "value": job_name, "short": true }));
    }
    if let Some(build_number) = payload.build_number {
        fields.push(json!({ "title": "Build", "value": build_number, "short": true }));
    }
    if let Some(branch) = &payload.branch {
        fields.push(json!({ "title": "Branch", "value": branch, "short": true }));
    }
    if let Some(error) = &payload.error {
        fields.push(json!({ "title": "Error", "value": error, "short": false }));
    }

    let slack_json = json!({
        "attachments": [{
            "color": color,
            "title": payload.title.as_ref().unwrap_or(&"Chengis Build".to_string()),
            "text": payload.message,
            "fields": fields
        }]
    });
    Ok(serde_json::to_string(&slack_json)?)
}

fn discord_payload(payload: &NotificationPayload) -> Result<String> {
    let color = if payload.success { 65280_u32 } else { 16711680_u32 };
    let mut fields = vec![];

    if let Some(job_name) = &payload.job_name {
        fields.push(json!({ "name": "Job", "value": job_name, "inline": true }));
    }
    if let Some(build_number) = payload.build_number {
        fields.push(json!({ "name": "Build", "value": build_number, "inline": true }));
    }
    if let Some(branch) = &payload.branch {
        fields.push(json!({ "name": "Branch", "value": branch, "inline": true }));
    }
    if let Some(error) = &payload.error {
        fields.push(json!({ "name": "Error", "value": error, "inline": false }));
    }

    let discord_json = json!({
        "embeds": [{
            "title": payload.title.as_ref().unwrap_or(&"Chengis Build".to_string()),
            "description": payload.message,
            "color": color,
            "fields": fields
        }]
    });
    Ok(serde_json::to_string(&discord_json)?)
}

/// Notification payload for a build that finished successfully.
pub fn build_completed_payload(job_name: &str, build_number: u64, branch: Option<&str>) -> NotificationPayload {
    NotificationPayload {
        message: format!("Build #{build_number} of {job_name} succeeded"),
        title: Some("Build Succeeded".to_string()),
        success: true,
        job_name: Some(job_name.to_string()),
        build_number: Some(build_number),
        branch: branch.map(str::to_string),
        ..Default::default()
    }
}

/// Notification payload for a build that failed or aborted.
pub fn build_failed_payload(job_name: &str, build_number: u64, status: BuildStatus, error: &str) -> NotificationPayload {
    let verb = if status == BuildStatus::Aborted { "aborted" } else { "failed" };
    NotificationPayload {
        message: format!("Build #{build_number} of {job_name} {verb}"),
        title: Some("Build Failed".to_string()),
        success: false,
        job_name: Some(job_name.to_string()),
        build_number: Some(build_number),
        error: Some(error.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_type_default() {
        assert_eq!(WebhookType::default(), WebhookType::Generic);
    }

    #[test]
    fn notification_config_default() {
        let config = NotificationConfig::default();
        assert!(config.url.is_empty());
        assert_eq!(config.webhook_type, WebhookType::Generic);
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn build_completed_payload_is_a_success() {
        let payload = build_completed_payload("nightly", 42, Some("main"));
        assert!(payload.success);
        assert_eq!(payload.build_number, Some(42));
        assert_eq!(payload.branch, Some("main".to_string()));
    }

    #[test]
    fn build_failed_payload_distinguishes_aborted_from_failed() {
        let aborted = build_failed_payload("nightly", 42, BuildStatus::Aborted, "cancelled");
        assert!(aborted.message.contains("aborted"));
        let failed = build_failed_payload("nightly", 42, BuildStatus::Failure, "exit 1");
        assert!(failed.message.contains("failed"));
    }

    #[test]
    fn slack_payload_format() {
        let payload = build_completed_payload("nightly", 42, Some("main"));
        let json = slack_payload(&payload).expect("format");
        assert!(json.contains("\"attachments\""));
        assert!(json.contains("\"color\":\"good\""));
    }

    #[test]
    fn discord_payload_format() {
        let payload = build_completed_payload("nightly", 42, Some("main"));
        let json = discord_payload(&payload).expect("format");
        assert!(json.contains("\"embeds\""));
        assert!(json.contains("\"color\":65280"));
    }

    #[test]
    fn slack_payload_failure_color() {
        let payload = build_failed_payload("nightly", 42, BuildStatus::Failure, "error");
        let json = slack_payload(&payload).expect("format");
        assert!(json.contains("\"color\":\"danger\""));
    }

    #[test]
    fn discord_payload_failure_color() {
        let payload = build_failed_payload("nightly", 42, BuildStatus::Failure, "error");
        let json = discord_payload(&payload).expect("format");
        assert!(json.contains("\"color\":16711680"));
    }

    #[test]
    fn notification_config_serialization() {
        let config = NotificationConfig { url: "https://example.com/webhook".to_string(), webhook_type: WebhookType::Slack, secret: None, timeout_secs: 60 };
        let json = serde_json::to_string(&config).expect("serialize");
        assert!(json.contains("\"url\""));
        assert!(json.contains("\"webhook_type\":\"Slack\""));
    }
}
