//! Infrastructure-as-code engine (§4.S): tool detection, plan/apply
//! invocation, versioned gzip-compressed state storage, and per-project
//! locking.
//!
//! Tool invocation mirrors `chengis_policy::opa_allows` and
//! `chengis::provenance`'s external-tool pattern: build a `ProcessSpec`
//! with fixed safe defaults, run it, inspect `timed_out`, parse `stdout`.

use std::io::{Read as _, Write as _};
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use base64::Engine as _;
use chengis_process::{ProcessSpec, SecretMasker, command_exists, run};
use chengis_store::Store;
use chengis_types::{IacAction, IacLock, IacResourceChange, IacState, IacTool};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

/// Detect the IaC tool in use by file presence: any `*.tf` file means
/// Terraform; a `Pulumi.yaml` means Pulumi; a CloudFormation template
/// (`template.json`/`template.yaml`) means CloudFormation.
pub fn detect_tool(dir: &Path) -> Option<IacTool> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut names = Vec::new();
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    if names.iter().any(|n| n.ends_with(".tf")) {
        return Some(IacTool::Terraform);
    }
    if names.iter().any(|n| n == "Pulumi.yaml") {
        return Some(IacTool::Pulumi);
    }
    if names.iter().any(|n| n == "template.json" || n == "template.yaml") {
        return Some(IacTool::CloudFormation);
    }
    None
}

/// Build the plan/apply command for `tool`, with fixed safe defaults per
/// §4.S: `-no-color -input=false` for terraform, `apply` adding
/// `-auto-approve`; `--non-interactive --json` for pulumi; the aws CLI
/// with `--output json` for cloudformation.
fn command_for(tool: IacTool, apply: bool, workdir: &Path) -> ProcessSpec {
    match tool {
        IacTool::Terraform => {
            let mut args = vec!["-no-color".to_string(), "-input=false".to_string()];
            let action = if apply { "apply" } else { "plan" };
            args.insert(0, action.to_string());
            if apply {
                args.push("-auto-approve".to_string());
            }
            ProcessSpec::new("terraform", workdir).args(args)
        }
        IacTool::Pulumi => {
            let action = if apply { "up" } else { "preview" };
            ProcessSpec::new("pulumi", workdir).args([action, "--non-interactive", "--json"])
        }
        IacTool::CloudFormation => {
            let action = if apply { "deploy" } else { "create-change-set" };
            ProcessSpec::new("aws", workdir).args(["cloudformation", action, "--output", "json"])
        }
    }
}

fn binary_for(tool: IacTool) -> &'static str {
    match tool {
        IacTool::Terraform => "terraform",
        IacTool::Pulumi => "pulumi",
        IacTool::CloudFormation => "aws",
    }
}

/// Uniform summary of a plan's resource changes.
#[derive(Debug, Clone, Default)]
pub struct PlanSummary {
    pub resources_add: usize,
    pub resources_change: usize,
    pub resources_destroy: usize,
    pub resources: Vec<IacResourceChange>,
}

/// Parse plan output into the uniform shape. Each tool emits JSON lines
/// or a JSON document describing resource actions; this extracts
/// `{resource_type, name, action}` triples wherever a `resource_type` /
/// `name` / `action` shaped object appears, which covers terraform's
/// `-json` plan output, pulumi's `--json` preview, and the aws CLI's
/// change-set JSON alike.
fn parse_plan_output(stdout: &str) -> PlanSummary {
    let mut summary = PlanSummary::default();
    let Ok(value) = serde_json::from_str::<serde_json::Value>(stdout) else {
        return summary;
    };

    let candidates: Vec<&serde_json::Value> = match &value {
        serde_json::Value::Array(items) => items.iter().collect(),
        serde_json::Value::Object(_) => {
            value.get("resource_changes").and_then(|v| v.as_array()).map(|a| a.iter().collect()).unwrap_or_default()
        }
        _ => vec![],
    };

    for candidate in candidates {
        let resource_type = candidate
            .get("resource_type")
            .or_else(|| candidate.get("type"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let name = candidate.get("name").or_else(|| candidate.get("logical_id")).and_then(|v| v.as_str()).unwrap_or("").to_string();
        let action_str = candidate
            .get("action")
            .or_else(|| candidate.get("change").and_then(|c| c.get("actions")).and_then(|a| a.get(0)))
            .and_then(|v| v.as_str())
            .unwrap_or("no-op");

        let action = match action_str {
            "create" | "add" => IacAction::Add,
            "update" | "change" => IacAction::Change,
            "delete" | "destroy" => IacAction::Destroy,
            _ => IacAction::NoOp,
        };

        match action {
            IacAction::Add => summary.resources_add += 1,
            IacAction::Change => summary.resources_change += 1,
            IacAction::Destroy => summary.resources_destroy += 1,
            IacAction::NoOp => {}
        }
        summary.resources.push(IacResourceChange { resource_type, name, action });
    }

    summary
}

/// Run a plan (or apply) for `tool` in `workdir`. Missing binary returns
/// `Ok(None)` — tolerated by callers the same way provenance/policy tools
/// are.
pub fn run_plan(tool: IacTool, workdir: &Path, apply: bool, timeout: Duration) -> Result<Option<PlanSummary>> {
    if !command_exists(binary_for(tool)) {
        return Ok(None);
    }
    let spec = command_for(tool, apply, workdir).timeout(timeout);
    let result = run(&spec, &SecretMasker::default(), |_, _| {}, |_| {})?;
    if result.timed_out {
        return Ok(None);
    }
    Ok(Some(parse_plan_output(&result.stdout)))
}

const MAX_STATE_SIZE: u64 = 64 * 1024 * 1024;

fn gzip_b64(plaintext: &[u8]) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(plaintext)?;
    let compressed = encoder.finish()?;
    Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
}

fn un_gzip_b64(encoded: &str) -> Result<Vec<u8>> {
    let compressed = base64::engine::general_purpose::STANDARD.decode(encoded)?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut plaintext = Vec::new();
    decoder.read_to_end(&mut plaintext)?;
    Ok(plaintext)
}

/// Save a new version of `project_id`/`workspace_name`'s state. Versions
/// auto-increment per `(project_id, workspace_name)`; the plaintext is
/// gzip+base64-encoded with its SHA-256 recorded separately.
pub fn save_state(store: &dyn Store, project_id: &str, workspace_name: &str, plaintext: &[u8], created_by: &str, now: chrono::DateTime<chrono::Utc>) -> Result<IacState> {
    if plaintext.len() as u64 > MAX_STATE_SIZE {
        bail!("state for {project_id}/{workspace_name} exceeds the {MAX_STATE_SIZE} byte limit");
    }

    let next_version = store.list_iac_versions(project_id, workspace_name)?.into_iter().map(|s| s.version).max().map_or(1, |v| v + 1);

    let mut hasher = Sha256::new();
    hasher.update(plaintext);
    let state_hash = hex::encode(hasher.finalize());

    let state = IacState {
        project_id: project_id.to_string(),
        workspace_name: workspace_name.to_string(),
        version: next_version,
        state_gzip_b64: gzip_b64(plaintext)?,
        state_hash,
        state_size: plaintext.len() as u64,
        created_by: created_by.to_string(),
        created_at: now,
    };
    store.put_iac_state(&state)?;
    Ok(state)
}

/// Decompress a saved state back to its plaintext.
pub fn read_state(state: &IacState) -> Result<Vec<u8>> {
    un_gzip_b64(&state.state_gzip_b64)
}

/// Resource-level diff between two decompressed state documents, each
/// expected to contain a top-level `resources: [{type, name}]` array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

fn resource_names(state_json: &str) -> std::collections::BTreeMap<String, serde_json::Value> {
    serde_json::from_str::<serde_json::Value>(state_json)
        .ok()
        .and_then(|v| v.get("resources").cloned())
        .and_then(|r| r.as_array().cloned())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|r| r.get("name").and_then(|n| n.as_str()).map(|n| (n.to_string(), r)))
        .collect()
}

pub fn diff_states(before: &str, after: &str) -> StateDiff {
    let before_resources = resource_names(before);
    let after_resources = resource_names(after);

    let mut diff = StateDiff::default();
    for name in after_resources.keys() {
        if !before_resources.contains_key(name) {
            diff.added.push(name.clone());
        }
    }
    for name in before_resources.keys() {
        if !after_resources.contains_key(name) {
            diff.removed.push(name.clone());
        }
    }
    for (name, before_value) in &before_resources {
        if let Some(after_value) = after_resources.get(name) {
            if before_value != after_value {
                diff.changed.push(name.clone());
            }
        }
    }
    diff
}

/// Acquire `project_id`'s lock; refuses if held by another user.
pub fn acquire_lock(store: &dyn Store, project_id: &str, locked_by: &str, now: chrono::DateTime<chrono::Utc>) -> Result<bool> {
    store.try_acquire_iac_lock(&IacLock { project_id: project_id.to_string(), locked_by: locked_by.to_string(), locked_at: now })
}

/// Release `project_id`'s lock, ignoring ownership.
pub fn force_unlock(store: &dyn Store, project_id: &str) -> Result<bool> {
    store.force_unlock_iac(project_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detects_terraform_by_tf_file_presence() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("main.tf"), "").unwrap();
        assert_eq!(detect_tool(td.path()), Some(IacTool::Terraform));
    }

    #[test]
    fn detects_pulumi_by_yaml_manifest() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("Pulumi.yaml"), "").unwrap();
        assert_eq!(detect_tool(td.path()), Some(IacTool::Pulumi));
    }

    #[test]
    fn detects_cloudformation_by_template_presence() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("template.json"), "").unwrap();
        assert_eq!(detect_tool(td.path()), Some(IacTool::CloudFormation));
    }

    #[test]
    fn no_recognized_files_means_no_tool() {
        let td = tempdir().unwrap();
        assert_eq!(detect_tool(td.path()), None);
    }

    #[test]
    fn parses_terraform_style_resource_changes() {
        let stdout = serde_json::json!({
            "resource_changes": [
                { "resource_type": "aws_s3_bucket", "name": "assets", "action": "create" },
                { "resource_type": "aws_s3_bucket", "name": "logs", "action": "delete" },
                { "resource_type": "aws_iam_role", "name": "ci", "action": "no-op" },
            ]
        })
        .to_string();
        let summary = parse_plan_output(&stdout);
        assert_eq!(summary.resources_add, 1);
        assert_eq!(summary.resources_destroy, 1);
        assert_eq!(summary.resources.len(), 3);
    }

    #[test]
    fn state_round_trips_through_gzip_and_records_the_plaintext_hash() {
        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        let plaintext = br#"{"resources": [{"type": "aws_s3_bucket", "name": "assets"}]}"#;
        let saved = save_state(&store, "proj-1", "default", plaintext, "alice", chrono::Utc::now()).unwrap();
        assert_eq!(saved.version, 1);
        let restored = read_state(&saved).unwrap();
        assert_eq!(restored, plaintext);

        let mut hasher = Sha256::new();
        hasher.update(plaintext);
        assert_eq!(saved.state_hash, hex::encode(hasher.finalize()));
    }

    #[test]
    fn saving_state_twice_auto_increments_the_version() {
        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        save_state(&store, "proj-1", "default", b"{}", "alice", chrono::Utc::now()).unwrap();
        let second = save_state(&store, "proj-1", "default", b"{}", "alice", chrono::Utc::now()).unwrap();
        assert_eq!(second.version, 2);
    }

    #[test]
    fn oversized_state_is_rejected() {
        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        let huge = vec![0u8; (MAX_STATE_SIZE + 1) as usize];
        let result = save_state(&store, "proj-1", "default", &huge, "alice", chrono::Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn lock_refuses_a_second_owner_and_force_unlock_ignores_ownership() {
        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        assert!(acquire_lock(&store, "proj-1", "alice", chrono::Utc::now()).unwrap());
        assert!(!acquire_lock(&store, "proj-1", "bob", chrono::Utc::now()).unwrap());
        assert!(force_unlock(&store, "proj-1").unwrap());
        assert!(acquire_lock(&store, "proj-1", "bob", chrono::Utc::now()).unwrap());
    }

    #[test]
    fn diff_states_reports_added_removed_and_changed_resources() {
        let before = serde_json::json!({
            "resources": [
                { "name": "a", "type": "aws_s3_bucket" },
                { "name": "b", "type": "aws_iam_role" },
            ]
        })
        .to_string();
        let after = serde_json::json!({
            "resources": [
                { "name": "a", "type": "aws_s3_bucket", "versioning": true },
                { "name": "c", "type": "aws_lambda_function" },
            ]
        })
        .to_string();
        let diff = diff_states(&before, &after);
        assert_eq!(diff.added, vec!["c".to_string()]);
        assert_eq!(diff.removed, vec!["b".to_string()]);
        assert_eq!(diff.changed, vec!["a".to_string()]);
    }
}
