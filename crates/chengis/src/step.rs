//! Step executor (§4.F): resolves a step's condition, masks secrets,
//! invokes the process sub-executor (or builds a `docker run` invocation),
//! and turns an exit code into a `Step` result.
//!
//! Contract per step: (1) evaluate `condition` against the build — falsy
//! means `skipped`; (2) a cancelled build means `aborted` with exit code
//! `-2`, never spawning a process; (3) emit `step-started`; (4) dispatch by
//! `step_type` (default shell invokes `chengis-process` directly, docker
//! composes a validated `docker run` command); (5) emit `step-completed`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use chengis_events::EventBus;
use chengis_process::mask::SecretMasker;
use chengis_process::{ChunkEvent, ProcessResult, ProcessSpec, StreamKind};
use chengis_storage::Workspace;
use chengis_store::Store;
use chengis_types::{Build, BuildEvent, BuildId, Condition, EventId, EventKind, Step, StepDef, StepStatus, StepType};
use regex::Regex;

/// Result of running one step, separate from the persisted `Step` row so
/// callers (the pipeline executor) can inspect captured output for logging
/// without re-reading it from the store.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: Step,
    pub stdout: String,
    pub stderr: String,
}

/// Evaluate a step's `condition` against the build context. `Always` and a
/// missing condition are both truthy; `Branch` compares against
/// `build.git_branch`; `Param` compares against `build.parameters`.
pub fn evaluate_condition(condition: Option<&Condition>, build: &Build) -> bool {
    match condition {
        None | Some(Condition::Always) => true,
        Some(Condition::Branch { branch }) => build.git_branch.as_deref() == Some(branch.as_str()),
        Some(Condition::Param { key, value }) => build.parameters.get(key).map(String::as_str) == Some(value.as_str()),
    }
}

fn step_event(build_id: &BuildId, kind: EventKind, stage_name: &str, step_name: &str, data: serde_json::Value) -> BuildEvent {
    BuildEvent {
        id: EventId::generate(),
        build_id: build_id.clone(),
        event_type: kind,
        stage_name: Some(stage_name.to_string()),
        step_name: Some(step_name.to_string()),
        data,
        created_at: chrono::Utc::now(),
    }
}

fn record_step(store: &dyn Store, step: &Step) -> Result<()> {
    store.upsert_step(step)
}

/// Run one step to completion, honoring condition evaluation and
/// cancellation, emitting `step-started`/`step-completed`, and returning
/// the captured output alongside the persisted row.
#[allow(clippy::too_many_arguments)]
pub fn run_step(
    store: &dyn Store,
    events: &EventBus,
    build: &Build,
    stage_name: &str,
    def: &StepDef,
    workspace: &Workspace,
    masker: &SecretMasker,
    cancelled: &AtomicBool,
    on_line: &mut dyn FnMut(StreamKind, &str),
    on_chunk: &mut dyn FnMut(ChunkEvent),
) -> Result<StepOutcome> {
    let mut step = Step {
        id: chengis_types::StepId::generate(),
        build_id: build.id.clone(),
        stage_name: stage_name.to_string(),
        step_name: def.step_name.clone(),
        status: StepStatus::Pending,
        exit_code: None,
        stdout_truncated: false,
        stderr_truncated: false,
        started_at: None,
        completed_at: None,
    };

    if !evaluate_condition(def.condition.as_ref(), build) {
        step.status = StepStatus::Skipped;
        record_step(store, &step)?;
        return Ok(StepOutcome { step, stdout: String::new(), stderr: String::new() });
    }

    if cancelled.load(Ordering::SeqCst) {
        step.status = StepStatus::Aborted;
        step.exit_code = Some(-2);
        record_step(store, &step)?;
        return Ok(StepOutcome { step, stdout: String::new(), stderr: String::new() });
    }

    step.status = StepStatus::Running;
    step.started_at = Some(chrono::Utc::now());
    record_step(store, &step)?;
    events.publish(
        store,
        step_event(&build.id, EventKind::StepStarted, stage_name, &def.step_name, serde_json::json!({})),
    )?;

    let dispatch_result = dispatch(def, workspace, masker, on_line, on_chunk);

    step.completed_at = Some(chrono::Utc::now());
    let (status, exit_code, stdout, stderr, stdout_truncated, stderr_truncated) = match dispatch_result {
        Ok(result) => {
            let status = if result.timed_out {
                StepStatus::TimedOut
            } else if result.success() {
                StepStatus::Success
            } else {
                StepStatus::Failure
            };
            (status, result.exit_code, result.stdout, result.stderr, result.stdout_truncated, result.stderr_truncated)
        }
        Err(err) => (StepStatus::Failure, None, String::new(), format!("{err:#}"), false, false),
    };
    step.status = status;
    step.exit_code = exit_code;
    step.stdout_truncated = stdout_truncated;
    step.stderr_truncated = stderr_truncated;
    record_step(store, &step)?;

    events.publish(
        store,
        step_event(
            &build.id,
            EventKind::StepCompleted,
            stage_name,
            &def.step_name,
            serde_json::json!({ "status": format!("{:?}", step.status), "exit_code": step.exit_code }),
        ),
    )?;

    Ok(StepOutcome { step, stdout, stderr })
}

fn dispatch(
    def: &StepDef,
    workspace: &Workspace,
    masker: &SecretMasker,
    on_line: &mut dyn FnMut(StreamKind, &str),
    on_chunk: &mut dyn FnMut(ChunkEvent),
) -> Result<ProcessResult> {
    match def.step_type {
        StepType::Shell => run_shell(def, workspace, masker, on_line, on_chunk),
        StepType::Docker | StepType::Compose => run_docker(def, workspace, masker, on_line, on_chunk),
    }
}

fn run_shell(
    def: &StepDef,
    workspace: &Workspace,
    masker: &SecretMasker,
    on_line: &mut dyn FnMut(StreamKind, &str),
    on_chunk: &mut dyn FnMut(ChunkEvent),
) -> Result<ProcessResult> {
    let command = def.command.as_deref().ok_or_else(|| anyhow!("shell step {} has no command", def.step_name))?;
    let mut spec = ProcessSpec::new("sh", workspace.path()).args(["-c", command]);
    for (key, value) in &def.env {
        spec = spec.env(key, value);
    }
    if let Some(ms) = def.timeout_ms {
        spec = spec.timeout(Duration::from_millis(ms));
    }
    chengis_process::run(&spec, masker, on_line, on_chunk)
}

/// Safe-identifier regex for env/cache-volume names, and for image/network
/// names (§4.F): letters, digits, `_`, `-`, `.`, `/`, `:` — the ordinary
/// alphabet for Docker identifiers and image references, nothing a shell
/// would interpret specially.
fn safe_identifier_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:/-]+$").expect("valid regex"))
}

fn validate_safe_identifier(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || !safe_identifier_regex().is_match(value) {
        bail!("invalid {kind}: {value:?}");
    }
    Ok(())
}

fn substitute_workspace(value: &str, mount_path: &str) -> String {
    value.replace("${WORKSPACE}", mount_path).replace(":workspace", &format!(":{mount_path}"))
}

/// Build (but do not execute) the `docker run` argument vector for a
/// docker/compose step, applying every validation rule in §4.F. Exposed
/// separately from [`run_docker`] so tests can assert on the constructed
/// command without actually invoking `docker`.
pub fn build_docker_args(def: &StepDef, workspace: &Workspace) -> Result<Vec<String>> {
    let image = def.image.as_deref().ok_or_else(|| anyhow!("docker step {} has no image", def.step_name))?;
    if image.len() > 256 {
        bail!("docker image name exceeds 256 characters: {}", def.step_name);
    }
    validate_safe_identifier("docker image name", image)?;

    let mount_path = workspace.mount_path();
    let workdir = def.workdir.clone().unwrap_or_else(|| "/workspace".to_string());
    if !workdir.starts_with('/') {
        bail!("docker workdir must be absolute: {workdir}");
    }

    let mut args = vec!["run".to_string(), "--rm".to_string()];

    args.push("-v".to_string());
    args.push(format!("{mount_path}:{workdir}"));
    args.push("-w".to_string());
    args.push(workdir);

    for (key, value) in &def.env {
        validate_safe_identifier("env var name", key)?;
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    for (name, target) in &def.cache_volumes {
        validate_safe_identifier("cache volume name", name)?;
        if !target.starts_with('/') || target.split('/').any(|segment| segment == "..") {
            bail!("cache volume target must be absolute and free of '..': {target}");
        }
        args.push("-v".to_string());
        args.push(format!("{name}:{target}"));
    }

    for volume in &def.volumes {
        args.push("-v".to_string());
        args.push(substitute_workspace(volume, &mount_path));
    }

    if let Some(network) = &def.network {
        validate_safe_identifier("network name", network)?;
        args.push("--network".to_string());
        args.push(network.clone());
    }

    for extra in &def.extra_args {
        if !extra.starts_with('-') {
            bail!("docker extra arg must be a flag: {extra:?}");
        }
        args.push(extra.clone());
    }

    args.push(image.to_string());
    if let Some(command) = &def.command {
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(command.clone());
    }

    Ok(args)
}

fn run_docker(
    def: &StepDef,
    workspace: &Workspace,
    masker: &SecretMasker,
    on_line: &mut dyn FnMut(StreamKind, &str),
    on_chunk: &mut dyn FnMut(ChunkEvent),
) -> Result<ProcessResult> {
    let args = build_docker_args(def, workspace)?;
    let mut spec = ProcessSpec::new("docker", workspace.path()).args(args);
    if let Some(ms) = def.timeout_ms {
        spec = spec.timeout(Duration::from_millis(ms));
    }
    chengis_process::run(&spec, masker, on_line, on_chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_environment::SystemClock;
    use chengis_events::EventBus;
    use chengis_types::{BuildStatus, TriggerType};
    use tempfile::tempdir;

    fn build(branch: Option<&str>, params: BTreeMap<String, String>) -> Build {
        Build {
            id: BuildId::generate(),
            org_id: "acme".into(),
            job_id: chengis_types::JobId::generate(),
            build_number: 1,
            status: BuildStatus::Running,
            trigger_type: TriggerType::Manual,
            started_at: None,
            completed_at: None,
            created_at: chrono::Utc::now(),
            git_branch: branch.map(str::to_string),
            git_commit: None,
            git_commit_short: None,
            git_author: None,
            git_message: None,
            pr_number: None,
            merge_request_number: None,
            parameters: params,
        }
    }

    fn step_def(name: &str, command: &str) -> StepDef {
        StepDef {
            step_name: name.to_string(),
            step_type: StepType::Shell,
            command: Some(command.to_string()),
            image: None,
            env: BTreeMap::new(),
            timeout_ms: None,
            condition: None,
            cache_volumes: BTreeMap::new(),
            volumes: vec![],
            network: None,
            workdir: None,
            extra_args: vec![],
        }
    }

    #[test]
    fn condition_always_is_truthy() {
        let b = build(None, BTreeMap::new());
        assert!(evaluate_condition(Some(&Condition::Always), &b));
        assert!(evaluate_condition(None, &b));
    }

    #[test]
    fn condition_branch_matches_build_branch() {
        let b = build(Some("main"), BTreeMap::new());
        assert!(evaluate_condition(Some(&Condition::Branch { branch: "main".into() }), &b));
        assert!(!evaluate_condition(Some(&Condition::Branch { branch: "dev".into() }), &b));
    }

    #[test]
    fn condition_param_matches_build_parameter() {
        let mut params = BTreeMap::new();
        params.insert("deploy".to_string(), "true".to_string());
        let b = build(None, params);
        assert!(evaluate_condition(Some(&Condition::Param { key: "deploy".into(), value: "true".into() }), &b));
        assert!(!evaluate_condition(Some(&Condition::Param { key: "deploy".into(), value: "false".into() }), &b));
        assert!(!evaluate_condition(Some(&Condition::Param { key: "missing".into(), value: "true".into() }), &b));
    }

    #[test]
    fn falsy_condition_skips_without_running_a_process() {
        let td = tempdir().unwrap();
        let manager = chengis_storage::WorkspaceManager::new(td.path());
        let workspace = manager.allocate("acme", "job1", "build1").unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        let events = EventBus::new(Duration::from_millis(500));
        let b = build(Some("main"), BTreeMap::new());
        let mut def = step_def("deploy", "echo hi");
        def.condition = Some(Condition::Branch { branch: "release".into() });
        let cancelled = AtomicBool::new(false);

        let outcome =
            run_step(&store, &events, &b, "stage1", &def, &workspace, &SecretMasker::default(), &cancelled, &mut |_, _| {}, &mut |_| {})
                .unwrap();
        assert_eq!(outcome.step.status, StepStatus::Skipped);
    }

    #[test]
    fn cancelled_build_aborts_without_running() {
        let td = tempdir().unwrap();
        let manager = chengis_storage::WorkspaceManager::new(td.path());
        let workspace = manager.allocate("acme", "job1", "build1").unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        let events = EventBus::new(Duration::from_millis(500));
        let b = build(None, BTreeMap::new());
        let def = step_def("deploy", "echo hi");
        let cancelled = AtomicBool::new(true);

        let outcome =
            run_step(&store, &events, &b, "stage1", &def, &workspace, &SecretMasker::default(), &cancelled, &mut |_, _| {}, &mut |_| {})
                .unwrap();
        assert_eq!(outcome.step.status, StepStatus::Aborted);
        assert_eq!(outcome.step.exit_code, Some(-2));
    }

    #[test]
    fn shell_step_runs_and_records_success() {
        let td = tempdir().unwrap();
        let manager = chengis_storage::WorkspaceManager::new(td.path());
        let workspace = manager.allocate("acme", "job1", "build1").unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        let events = EventBus::new(Duration::from_millis(500));
        let b = build(None, BTreeMap::new());
        let def = step_def("build", "echo ok");
        let cancelled = AtomicBool::new(false);
        let _ = SystemClock;

        let mut lines = Vec::new();
        let outcome = run_step(&store, &events, &b, "stage1", &def, &workspace, &SecretMasker::default(), &cancelled, &mut |_, line| {
            lines.push(line.to_string());
        }, &mut |_| {})
        .unwrap();
        assert_eq!(outcome.step.status, StepStatus::Success);
        assert_eq!(outcome.stdout, "ok\n");
    }

    #[test]
    fn shell_step_chunks_output_per_configured_chunk_size() {
        let td = tempdir().unwrap();
        let manager = chengis_storage::WorkspaceManager::new(td.path());
        let workspace = manager.allocate("acme", "job1", "build1").unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        let events = EventBus::new(Duration::from_millis(500));
        let b = build(None, BTreeMap::new());
        let def = step_def("build", "for i in $(seq 1 21); do echo line$i; done");
        let cancelled = AtomicBool::new(false);

        let mut chunks = Vec::new();
        run_step(&store, &events, &b, "stage1", &def, &workspace, &SecretMasker::default(), &cancelled, &mut |_, _| {}, &mut |chunk| {
            chunks.push(chunk);
        })
        .unwrap();
        // Default chunk size is 20 lines: a full chunk plus one trailing line.
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].line_count, 20);
        assert_eq!(chunks[1].line_count, 1);
    }

    #[test]
    fn docker_args_mount_workspace_and_substitute_workdir_token() {
        let td = tempdir().unwrap();
        let manager = chengis_storage::WorkspaceManager::new(td.path());
        let workspace = manager.allocate("acme", "job1", "build1").unwrap();
        let mut def = step_def("build", "cargo build");
        def.step_type = StepType::Docker;
        def.image = Some("rust:1.80".to_string());
        def.volumes = vec!["${WORKSPACE}/target:/cache/target".to_string()];

        let args = build_docker_args(&def, &workspace).unwrap();
        let mount = workspace.mount_path();
        assert!(args.iter().any(|a| a == &format!("{mount}:/workspace")));
        assert!(args.iter().any(|a| a == &format!("{mount}/target:/cache/target")));
        assert!(args.contains(&"rust:1.80".to_string()));
    }

    #[test]
    fn docker_image_name_over_256_chars_is_rejected() {
        let td = tempdir().unwrap();
        let manager = chengis_storage::WorkspaceManager::new(td.path());
        let workspace = manager.allocate("acme", "job1", "build1").unwrap();
        let mut def = step_def("build", "cargo build");
        def.step_type = StepType::Docker;
        def.image = Some("r".repeat(300));

        assert!(build_docker_args(&def, &workspace).is_err());
    }

    #[test]
    fn docker_cache_volume_target_must_be_absolute_and_dotdot_free() {
        let td = tempdir().unwrap();
        let manager = chengis_storage::WorkspaceManager::new(td.path());
        let workspace = manager.allocate("acme", "job1", "build1").unwrap();
        let mut def = step_def("build", "cargo build");
        def.step_type = StepType::Docker;
        def.image = Some("rust:1.80".to_string());
        def.cache_volumes.insert("cargo-registry".to_string(), "../etc/passwd".to_string());

        assert!(build_docker_args(&def, &workspace).is_err());
    }

    #[test]
    fn docker_extra_args_must_be_flags() {
        let td = tempdir().unwrap();
        let manager = chengis_storage::WorkspaceManager::new(td.path());
        let workspace = manager.allocate("acme", "job1", "build1").unwrap();
        let mut def = step_def("build", "cargo build");
        def.step_type = StepType::Docker;
        def.image = Some("rust:1.80".to_string());
        def.extra_args = vec!["rm -rf /".to_string()];

        assert!(build_docker_args(&def, &workspace).is_err());
    }

    #[test]
    fn docker_network_name_is_validated() {
        let td = tempdir().unwrap();
        let manager = chengis_storage::WorkspaceManager::new(td.path());
        let workspace = manager.allocate("acme", "job1", "build1").unwrap();
        let mut def = step_def("build", "cargo build");
        def.step_type = StepType::Docker;
        def.image = Some("rust:1.80".to_string());
        def.network = Some("bad net;".to_string());

        assert!(build_docker_args(&def, &workspace).is_err());
    }
}
