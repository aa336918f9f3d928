//! Inbound webhook replay (§4.N): the webhook log stores the raw request
//! body and headers; replay re-invokes the configured inbound handler with
//! an in-memory request carrying the original event header
//! (`x-github-event`, `x-gitlab-event`, ...).
//!
//! Grounded in `chengis-events::EventLog`: same append-only JSONL file,
//! same "read the whole file, filter in memory" access pattern — a webhook
//! log is small enough that this isn't a concern in practice.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const WEBHOOK_LOG_FILE: &str = "webhooks.jsonl";

pub fn webhook_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join(WEBHOOK_LOG_FILE)
}

/// The event-header key each provider uses to name the webhook event type.
pub fn event_header_name(provider: &str) -> Option<&'static str> {
    match provider {
        "github" => Some("x-github-event"),
        "gitlab" => Some("x-gitlab-event"),
        "bitbucket" => Some("x-event-key"),
        "gitea" => Some("x-gitea-event"),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLogEntry {
    pub id: String,
    pub provider: String,
    pub received_at: DateTime<Utc>,
    pub request: WebhookRequest,
    #[serde(default)]
    pub replayed: bool,
}

impl WebhookLogEntry {
    /// The original event-type header value, looked up by provider (e.g.
    /// `"push"` for a GitHub push event), case-insensitively.
    pub fn event_header(&self) -> Option<&str> {
        let header_name = event_header_name(&self.provider)?;
        self.request.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(header_name)).map(|(_, v)| v.as_str())
    }
}

/// Append-only log of received webhook requests, one JSON object per line.
#[derive(Debug, Default)]
pub struct WebhookLog {
    entries: Vec<WebhookLogEntry>,
}

impl WebhookLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: WebhookLogEntry) {
        self.entries.push(entry);
    }

    pub fn all_entries(&self) -> &[WebhookLogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path).with_context(|| format!("failed to open {}", path.display()))?;
        for entry in &self.entries {
            let line = serde_json::to_string(entry).context("failed to serialize webhook log entry")?;
            writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
        }
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Vec<WebhookLogEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.context("failed to read webhook log line")?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line).context("failed to parse webhook log entry")?);
        }
        Ok(entries)
    }
}

/// The inbound webhook endpoint, reduced to the shape replay needs to
/// re-invoke it: given the original event-type header and raw body, do
/// whatever the live endpoint would do (ordinarily parse the payload and
/// create a build).
pub trait InboundHandler {
    fn handle(&mut self, event_header: Option<&str>, body: &str) -> Result<()>;
}

/// Re-invoke `handler` with `entry`'s original header and body, as if the
/// request had just arrived over HTTP.
pub fn replay(entry: &WebhookLogEntry, handler: &mut dyn InboundHandler) -> Result<()> {
    handler.handle(entry.event_header(), &entry.request.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingHandler {
        calls: Vec<(Option<String>, String)>,
    }

    impl InboundHandler for RecordingHandler {
        fn handle(&mut self, event_header: Option<&str>, body: &str) -> Result<()> {
            self.calls.push((event_header.map(str::to_string), body.to_string()));
            Ok(())
        }
    }

    fn sample_entry(provider: &str, header_name: &str, header_value: &str, body: &str) -> WebhookLogEntry {
        let mut headers = BTreeMap::new();
        headers.insert(header_name.to_string(), header_value.to_string());
        WebhookLogEntry {
            id: "wh_1".to_string(),
            provider: provider.to_string(),
            received_at: Utc::now(),
            request: WebhookRequest { headers, body: body.to_string() },
            replayed: false,
        }
    }

    #[test]
    fn event_header_is_looked_up_case_insensitively() {
        let entry = sample_entry("github", "X-GitHub-Event", "push", "{}");
        assert_eq!(entry.event_header(), Some("push"));
    }

    #[test]
    fn replay_invokes_handler_with_original_header_and_body() {
        let entry = sample_entry("gitlab", "x-gitlab-event", "Merge Request Hook", r#"{"object_kind":"merge_request"}"#);
        let mut handler = RecordingHandler { calls: Vec::new() };
        replay(&entry, &mut handler).unwrap();
        assert_eq!(handler.calls.len(), 1);
        assert_eq!(handler.calls[0].0.as_deref(), Some("Merge Request Hook"));
        assert!(handler.calls[0].1.contains("merge_request"));
    }

    #[test]
    fn log_round_trips_through_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let path = webhook_log_path(tmp.path());

        let mut log = WebhookLog::new();
        log.record(sample_entry("github", "x-github-event", "push", "{}"));
        log.record(sample_entry("gitlab", "x-gitlab-event", "Push Hook", "{}"));
        log.write_to_file(&path).unwrap();

        let read_back = WebhookLog::read_from_file(&path).unwrap();
        assert_eq!(read_back.len(), 2);
        assert_eq!(read_back[0].provider, "github");
    }

    #[test]
    fn missing_log_file_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = webhook_log_path(tmp.path());
        assert!(WebhookLog::read_from_file(&path).unwrap().is_empty());
    }

    #[test]
    fn unknown_provider_has_no_event_header() {
        let entry = sample_entry("unknown-provider", "x-foo", "bar", "{}");
        assert_eq!(entry.event_header(), None);
    }
}
