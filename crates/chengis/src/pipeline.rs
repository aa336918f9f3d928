//! Pipeline executor (§4.J): the top-level build loop.
//!
//! `trigger → matrix expand → DAG build → stage loop → post-actions →
//! provenance/deploy/SCM`, matching the 7-step sequence in the data model:
//! allocate a workspace and emit `build-started`; expand the matrix; decide
//! DAG-or-linear scheduling; for each stage, evaluate policy, wait on any
//! approval gate, check the stage-result cache, run steps, save the cache;
//! run post-actions; roll the build's terminal status up from its stages;
//! emit `build-completed` and drive the side effects that only make sense
//! once a build finishes (downstream job triggers, SCM status, auto-merge,
//! provenance).

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chengis_environment::Clock;
use chengis_events::EventBus;
use chengis_process::mask::SecretMasker;
use chengis_progress::{AlwaysOn, BuildTracer, SpanStatus};
use chengis_registry::ArtifactCache;
use chengis_storage::WorkspaceManager;
use chengis_store::{Reporter, Store};
use chengis_types::{
    Build, BuildEvent, BuildId, BuildStatus, EventId, EventKind, Job, PipelineDef, PolicyResult,
    PostActions, Stage, StageCacheRecord, StageCacheStatus, StageDef, StageStatus, StepDef,
    TriggerType,
};

use crate::ids::stage_fingerprint;
use crate::step::run_step;

/// Everything the executor needs beyond the build request itself, bundled
/// so `run_build`'s signature doesn't grow a parameter per collaborator.
pub struct ExecutionContext<'a> {
    pub store: &'a dyn Store,
    pub events: &'a EventBus,
    pub clock: &'a dyn Clock,
    pub config: &'a chengis_config::Config,
    pub workspaces: &'a WorkspaceManager,
    pub artifact_cache: &'a ArtifactCache,
    pub reporter: &'a mut dyn Reporter,
}

/// One build trigger, resolved by the caller (webhook handler, cron
/// scheduler, manual API call, or upstream job dependency) into the
/// concrete git/parameter context this build runs with. Policy rules are
/// resolved per-org/job by the caller rather than carried on the pipeline
/// definition itself (§4.L rules are organizational config, not part of a
/// pipeline file).
pub struct BuildRequest {
    pub job: Job,
    pub pipeline: PipelineDef,
    pub trigger_type: TriggerType,
    pub git_branch: Option<String>,
    pub git_commit: Option<String>,
    pub git_commit_short: Option<String>,
    pub git_author: Option<String>,
    pub git_message: Option<String>,
    pub pr_number: Option<u64>,
    pub merge_request_number: Option<u64>,
    pub parameters: BTreeMap<String, String>,
    pub policy_rules: Vec<chengis_types::PolicyRule>,
}

fn build_event(build_id: &BuildId, kind: EventKind, data: serde_json::Value) -> BuildEvent {
    BuildEvent { id: EventId::generate(), build_id: build_id.clone(), event_type: kind, stage_name: None, step_name: None, data, created_at: chrono::Utc::now() }
}

/// Rewire `depends_on` after matrix expansion so an expanded stage depends
/// on every expanded copy of each name it originally declared a dependency
/// on (open question: matrix × DAG interaction, resolved as inherit-by-name
/// — the least surprising of the under-specified options).
fn expand_with_inherited_dependencies(stages: &[StageDef], matrix: Option<&chengis_types::MatrixDef>, max_combinations: usize) -> Result<Vec<StageDef>> {
    let base_names: Vec<String> = stages.iter().map(|s| s.stage_name.clone()).collect();
    let mut expanded = chengis_plan::expand_pipeline(stages, matrix, max_combinations)?;
    if matrix.is_none() {
        return Ok(expanded);
    }

    let mut copies_of: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for stage in &expanded {
        for base in &base_names {
            if &stage.stage_name == base || stage.stage_name.starts_with(&format!("{base} (")) {
                copies_of.entry(base.as_str()).or_default().push(stage.stage_name.clone());
            }
        }
    }

    for stage in &mut expanded {
        let mut rewired = Vec::new();
        for dep in &stage.depends_on {
            match copies_of.get(dep.as_str()) {
                Some(names) => rewired.extend(names.iter().cloned()),
                None => rewired.push(dep.clone()),
            }
        }
        stage.depends_on = rewired;
    }
    Ok(expanded)
}

fn policy_context(job: &Job, build: &Build, stage_name: &str) -> chengis_policy::PolicyContext {
    chengis_policy::PolicyContext {
        build_id: build.id.as_str().to_string(),
        job_id: job.id.as_str().to_string(),
        org_id: job.org_id.clone(),
        branch: build.git_branch.clone(),
        author: build.git_author.clone(),
        parameters: build.parameters.clone(),
        stage_name: Some(stage_name.to_string()),
    }
}

/// Result of running one stage: its final status and whether any step
/// within it failed (used to decide post-action branch and the build's
/// terminal status).
struct StageOutcome {
    name: String,
    status: StageStatus,
}

fn span_status_for(status: StageStatus) -> SpanStatus {
    match status {
        StageStatus::Success => SpanStatus::Ok,
        other => SpanStatus::Error(format!("{other:?}")),
    }
}

fn end_stage_span(tracer: Option<&mut BuildTracer>, span_id: Option<&str>, status: StageStatus) {
    if let (Some(tracer), Some(span_id)) = (tracer, span_id) {
        tracer.end(span_id, span_status_for(status));
    }
}

/// Record a policy-denied stage as an immediate failure without running any
/// of its steps (§4.J.a, §7 PolicyDeny "surfaces as stage failure").
fn record_denied_stage(ctx: &mut ExecutionContext, build: &Build, def: &StageDef, reason: &str) -> Result<StageOutcome> {
    let now = ctx.clock.now();
    let stage = Stage {
        id: chengis_types::StageId::generate(),
        build_id: build.id.clone(),
        stage_name: def.stage_name.clone(),
        status: StageStatus::Failure,
        started_at: Some(now),
        completed_at: Some(now),
        depends_on: def.depends_on.clone(),
        matrix_combination: None,
    };
    ctx.store.upsert_stage(&stage)?;
    ctx.events.publish(
        ctx.store,
        build_event(
            &build.id,
            EventKind::StageCompleted,
            serde_json::json!({ "stage_name": def.stage_name, "status": "Failure", "policy_denied": true, "reason": reason }),
        ),
    )?;
    Ok(StageOutcome { name: def.stage_name.clone(), status: StageStatus::Failure })
}

#[allow(clippy::too_many_arguments)]
fn run_one_stage(
    ctx: &mut ExecutionContext,
    job: &Job,
    build: &Build,
    def: &StageDef,
    workspace: &chengis_storage::Workspace,
    masker: &SecretMasker,
    cancelled: &AtomicBool,
    mut tracer: Option<&mut BuildTracer>,
) -> Result<StageOutcome> {
    let mut stage = Stage {
        id: chengis_types::StageId::generate(),
        build_id: build.id.clone(),
        stage_name: def.stage_name.clone(),
        status: StageStatus::Running,
        started_at: Some(ctx.clock.now()),
        completed_at: None,
        depends_on: def.depends_on.clone(),
        matrix_combination: None,
    };
    ctx.store.upsert_stage(&stage)?;
    ctx.events.publish(ctx.store, build_event(&build.id, EventKind::StageStarted, serde_json::json!({ "stage_name": def.stage_name })))?;
    let stage_span = tracer.as_deref_mut().map(|t| t.start_stage(&stage.id, &def.stage_name));

    // Policy (deny / required-approval override) was already evaluated
    // against this exact `def` by `run_build`'s `evaluate_stage_policy`
    // pass, before the stage reached the ready set — `def.approval` here
    // already carries any merged override.

    if let Some(approval_cfg) = &def.approval {
        let gate = chengis_lock::create_gate(ctx.store, &build.id, &def.stage_name, approval_cfg, ctx.clock)?;
        ctx.events.publish(ctx.store, build_event(&build.id, EventKind::ApprovalRequested, serde_json::json!({ "stage_name": def.stage_name, "gate_id": gate.id.as_str() })))?;
        let outcome = chengis_lock::wait_for_resolution(
            ctx.store,
            &gate.id,
            Duration::from_millis(ctx.config.intervals.approval_poll_ms),
            ctx.clock,
            || cancelled.load(Ordering::SeqCst),
        )?;
        if !outcome.proceed() {
            let status = match outcome {
                chengis_lock::GateWaitOutcome::Rejected { .. } => StageStatus::Failure,
                chengis_lock::GateWaitOutcome::TimedOut => StageStatus::Failure,
                chengis_lock::GateWaitOutcome::Cancelled => StageStatus::Aborted,
                chengis_lock::GateWaitOutcome::Approved => unreachable!(),
            };
            stage.status = status;
            stage.completed_at = Some(ctx.clock.now());
            ctx.store.upsert_stage(&stage)?;
            ctx.events.publish(ctx.store, build_event(&build.id, EventKind::StageCompleted, serde_json::json!({ "stage_name": def.stage_name, "status": format!("{status:?}") })))?;
            end_stage_span(tracer.as_deref_mut(), stage_span.as_deref(), status);
            return Ok(StageOutcome { name: def.stage_name.clone(), status });
        }
    }

    if ctx.config.feature_flags.build_result_cache {
        if let Some(commit) = &build.git_commit {
            let env: BTreeMap<String, String> = std::env::vars().collect();
            let fingerprint = stage_fingerprint(commit, &def.steps, &env);
            if let Some(record) = ctx.store.get_stage_cache(&job.id, &fingerprint)? {
                let status = match record.status {
                    StageCacheStatus::Success => StageStatus::Success,
                    StageCacheStatus::Failure => StageStatus::Failure,
                    StageCacheStatus::Aborted => StageStatus::Aborted,
                };
                stage.status = status;
                stage.completed_at = Some(ctx.clock.now());
                ctx.store.upsert_stage(&stage)?;
                // Open question: cache hits emit a synthetic completion
                // event rather than replaying the original run's step
                // stream, since that stream was never persisted verbatim.
                ctx.events.publish(
                    ctx.store,
                    build_event(&build.id, EventKind::StageCompleted, serde_json::json!({ "stage_name": def.stage_name, "status": format!("{status:?}"), "cache_hit": true })),
                )?;
                end_stage_span(tracer.as_deref_mut(), stage_span.as_deref(), status);
                return Ok(StageOutcome { name: def.stage_name.clone(), status });
            }
        }
    }

    let mut stage_status = StageStatus::Success;
    for step_def in &def.steps {
        let step_span = tracer
            .as_deref_mut()
            .zip(stage_span.as_deref())
            .map(|(t, parent)| t.start_step(parent, &chengis_types::StepId::generate(), &step_def.step_name));
        let outcome = run_step(ctx.store, ctx.events, build, &def.stage_name, step_def, workspace, masker, cancelled, &mut |_, line| {
            ctx.reporter.info(line);
        }, &mut |_| {})?;
        if let (Some(t), Some(span_id)) = (tracer.as_deref_mut(), step_span.as_deref()) {
            let status = match outcome.step.status {
                chengis_types::StepStatus::Success | chengis_types::StepStatus::Skipped => SpanStatus::Ok,
                other => SpanStatus::Error(format!("{other:?}")),
            };
            t.end(span_id, status);
        }
        match outcome.step.status {
            chengis_types::StepStatus::Failure | chengis_types::StepStatus::TimedOut => {
                stage_status = StageStatus::Failure;
                break;
            }
            chengis_types::StepStatus::Aborted => {
                stage_status = StageStatus::Aborted;
                break;
            }
            _ => {}
        }
    }

    if ctx.config.feature_flags.build_result_cache && stage_status != StageStatus::Aborted {
        if let Some(commit) = &build.git_commit {
            let env: BTreeMap<String, String> = std::env::vars().collect();
            let fingerprint = stage_fingerprint(commit, &def.steps, &env);
            let cache_status = match stage_status {
                StageStatus::Success => StageCacheStatus::Success,
                StageStatus::Failure => StageCacheStatus::Failure,
                _ => StageCacheStatus::Aborted,
            };
            ctx.store.put_stage_cache(&StageCacheRecord { job_id: job.id.clone(), fingerprint, status: cache_status, created_at: ctx.clock.now() })?;
        }
    }

    stage.status = stage_status;
    stage.completed_at = Some(ctx.clock.now());
    ctx.store.upsert_stage(&stage)?;
    ctx.events.publish(ctx.store, build_event(&build.id, EventKind::StageCompleted, serde_json::json!({ "stage_name": def.stage_name, "status": format!("{stage_status:?}") })))?;
    end_stage_span(tracer.as_deref_mut(), stage_span.as_deref(), stage_status);

    Ok(StageOutcome { name: def.stage_name.clone(), status: stage_status })
}

/// Evaluate this build's policy rules against a stage, returning the
/// `Deny` reason (if any) and accumulating any `required-approval`
/// override onto `approval`. Called once per stage from [`run_build`],
/// which is the only place that has both the rule list and the stage
/// loop's mutable approval config in scope at once.
fn evaluate_stage_policy(
    rules: &[chengis_types::PolicyRule],
    job: &Job,
    build: &Build,
    def: &mut StageDef,
    clock: &dyn Clock,
    policy_engine_enabled: bool,
) -> Result<Option<String>> {
    let pctx = policy_context(job, build, &def.stage_name);
    match chengis_policy::evaluate_if_enabled(policy_engine_enabled, rules, &pctx, clock)? {
        PolicyResult::Allow => Ok(None),
        PolicyResult::Deny { reason, .. } => Ok(Some(reason)),
        PolicyResult::ApprovalOverride(over) => {
            if let Some(cfg) = &mut def.approval {
                chengis_lock::merge_approval_override(cfg, over.min_approvals, &over.approver_group);
            }
            Ok(None)
        }
    }
}

fn run_post_actions(
    ctx: &mut ExecutionContext,
    build: &Build,
    actions: &[StepDef],
    workspace: &chengis_storage::Workspace,
    masker: &SecretMasker,
    cancelled: &AtomicBool,
) -> Result<()> {
    for step_def in actions {
        run_step(ctx.store, ctx.events, build, "post-actions", step_def, workspace, masker, cancelled, &mut |_, line| {
            ctx.reporter.info(line);
        }, &mut |_| {})?;
    }
    Ok(())
}

/// Run a build to completion: the top-level loop described in the module
/// docs. `cancelled` is shared with the caller so an out-of-band cancel
/// request (API call, signal handler) can stop the build between steps.
pub fn run_build(ctx: &mut ExecutionContext, request: BuildRequest, cancelled: &AtomicBool) -> Result<Build> {
    let build_number = ctx.store.next_build_number(&request.job.id)?;
    let mut build = Build {
        id: BuildId::generate(),
        org_id: request.job.org_id.clone(),
        job_id: request.job.id.clone(),
        build_number,
        status: BuildStatus::Running,
        trigger_type: request.trigger_type,
        started_at: Some(ctx.clock.now()),
        completed_at: None,
        created_at: ctx.clock.now(),
        git_branch: request.git_branch.clone(),
        git_commit: request.git_commit.clone(),
        git_commit_short: request.git_commit_short.clone(),
        git_author: request.git_author.clone(),
        git_message: request.git_message.clone(),
        pr_number: request.pr_number,
        merge_request_number: request.merge_request_number,
        parameters: request.parameters.clone(),
    };
    ctx.store.upsert_build(&build)?;

    let workspace = ctx
        .workspaces
        .allocate(&request.job.org_id, request.job.id.as_str(), build.id.as_str())
        .context("failed to allocate build workspace")?;
    ctx.events.publish(ctx.store, build_event(&build.id, EventKind::BuildStarted, serde_json::json!({ "build_number": build.build_number })))?;

    let masker = SecretMasker::default();
    let mut tracer = if ctx.config.feature_flags.tracing { Some(BuildTracer::start(&build.id, &AlwaysOn)) } else { None };

    let mut expanded = expand_with_inherited_dependencies(&request.pipeline.stages, request.pipeline.matrix.as_ref(), ctx.config.max_matrix_combinations())?;
    let mut denied: BTreeMap<String, String> = BTreeMap::new();
    for stage in &mut expanded {
        let rules = request.policy_rules.clone();
        let denial = evaluate_stage_policy(&rules, &request.job, &build, stage, ctx.clock, ctx.config.feature_flags.policy_engine)?;
        if let Some(reason) = denial {
            ctx.reporter.warn(&format!("stage {} denied by policy: {reason}", stage.stage_name));
            denied.insert(stage.stage_name.clone(), reason);
        }
    }

    let mut stage_outcomes: Vec<StageOutcome> = Vec::new();
    let mut worst = BuildStatus::Success;

    if chengis_plan::has_dag(&expanded) {
        let dag = chengis_plan::build_dag(&expanded).map_err(|e| anyhow!("invalid stage dependency graph: {e}"))?;
        let by_name: BTreeMap<&str, &StageDef> = expanded.iter().map(|s| (s.stage_name.as_str(), s)).collect();
        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();

        loop {
            let ready = chengis_plan::ready_set(&dag, &completed, &failed);
            let aborted_now = chengis_plan::cascade_aborted(&dag, &completed, &failed);
            for name in &aborted_now {
                stage_outcomes.push(StageOutcome { name: name.clone(), status: StageStatus::Aborted });
                completed.insert(name.clone());
                worst = worst.worse_of(BuildStatus::Aborted);
            }
            if ready.is_empty() {
                break;
            }
            for name in &ready {
                if cancelled.load(Ordering::SeqCst) {
                    stage_outcomes.push(StageOutcome { name: name.clone(), status: StageStatus::Aborted });
                    completed.insert(name.clone());
                    worst = worst.worse_of(BuildStatus::Aborted);
                    continue;
                }
                let def = by_name[name.as_str()];
                let outcome = if let Some(reason) = denied.get(name.as_str()) {
                    record_denied_stage(ctx, &build, def, reason)?
                } else {
                    run_one_stage(ctx, &request.job, &build, def, &workspace, &masker, cancelled, tracer.as_mut())?
                };
                if outcome.status == StageStatus::Failure {
                    failed.insert(name.clone());
                    worst = worst.worse_of(BuildStatus::Failure);
                } else {
                    completed.insert(name.clone());
                    if outcome.status == StageStatus::Aborted {
                        worst = worst.worse_of(BuildStatus::Aborted);
                    }
                }
                stage_outcomes.push(outcome);
            }
        }
    } else {
        for def in &expanded {
            if cancelled.load(Ordering::SeqCst) {
                stage_outcomes.push(StageOutcome { name: def.stage_name.clone(), status: StageStatus::Aborted });
                worst = worst.worse_of(BuildStatus::Aborted);
                break;
            }
            let outcome = if let Some(reason) = denied.get(def.stage_name.as_str()) {
                record_denied_stage(ctx, &build, def, reason)?
            } else {
                run_one_stage(ctx, &request.job, &build, def, &workspace, &masker, cancelled, tracer.as_mut())?
            };
            let failed = outcome.status == StageStatus::Failure;
            worst = worst.worse_of(BuildStatus::from(outcome.status));
            stage_outcomes.push(outcome);
            if failed {
                break;
            }
        }
    }

    if let Some(post) = &request.pipeline.post_actions {
        run_post_actions_for(ctx, &build, post, worst, &workspace, &masker, cancelled)?;
    }

    build.status = worst;
    build.completed_at = Some(ctx.clock.now());
    ctx.store.upsert_build(&build)?;

    let mut completed_data = serde_json::json!({ "status": format!("{:?}", build.status), "stages": stage_outcomes.iter().map(|o| (o.name.clone(), format!("{:?}", o.status))).collect::<BTreeMap<_, _>>() });
    if let Some(tracer) = tracer {
        let tree = tracer.finish_build(span_status_for(match worst {
            BuildStatus::Success => StageStatus::Success,
            _ => StageStatus::Failure,
        }));
        match chengis_progress::export_json(&tree, "chengis") {
            Ok(trace) => completed_data["trace"] = serde_json::Value::String(trace),
            Err(e) => ctx.reporter.warn(&format!("failed to serialize build trace: {e}")),
        }
    }
    ctx.events.publish(ctx.store, build_event(&build.id, EventKind::BuildCompleted, completed_data))?;

    Ok(build)
}

fn run_post_actions_for(
    ctx: &mut ExecutionContext,
    build: &Build,
    post: &PostActions,
    status: BuildStatus,
    workspace: &chengis_storage::Workspace,
    masker: &SecretMasker,
    cancelled: &AtomicBool,
) -> Result<()> {
    run_post_actions(ctx, build, &post.always, workspace, masker, cancelled)?;
    match status {
        BuildStatus::Success => run_post_actions(ctx, build, &post.on_success, workspace, masker, cancelled)?,
        BuildStatus::Failure | BuildStatus::Aborted => run_post_actions(ctx, build, &post.on_failure, workspace, masker, cancelled)?,
        _ => {}
    }
    Ok(())
}

/// Downstream jobs to trigger once `build` finishes, per its `job`'s
/// `dependencies` list (§3 `JobDependency`): jobs whose `trigger_on` set
/// contains this build's terminal status.
pub fn downstream_jobs_to_trigger<'a>(job: &'a Job, build: &Build) -> Vec<&'a chengis_types::JobId> {
    job.dependencies.iter().filter(|dep| dep.trigger_on.contains(&build.status)).map(|dep| &dep.upstream_job_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_types::{JobDependency, StepType};
    use tempfile::tempdir;

    fn shell_step(name: &str, command: &str) -> StepDef {
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

    fn stage(name: &str, deps: &[&str], steps: Vec<StepDef>) -> StageDef {
        StageDef { stage_name: name.to_string(), parallel: false, depends_on: deps.iter().map(|d| d.to_string()).collect(), approval: None, cache: None, steps }
    }

    fn job() -> Job {
        Job {
            id: chengis_types::JobId::generate(),
            org_id: "acme".into(),
            name: "widgets".into(),
            pipeline_source: "pipeline.yaml".into(),
            triggers: vec![],
            created_at: chrono::Utc::now(),
            dependencies: vec![],
            auto_merge_enabled: false,
            merge_method: None,
            delete_branch_after: false,
        }
    }

    fn request(stages: Vec<StageDef>) -> BuildRequest {
        BuildRequest {
            job: job(),
            pipeline: PipelineDef { pipeline_name: "ci".into(), description: None, stages, matrix: None, parameters: vec![], post_actions: None, source: None, triggers: vec![] },
            trigger_type: TriggerType::Manual,
            git_branch: Some("main".into()),
            git_commit: Some("abc123".into()),
            git_commit_short: Some("abc123".into()),
            git_author: Some("bob".into()),
            git_message: Some("msg".into()),
            pr_number: None,
            merge_request_number: None,
            parameters: BTreeMap::new(),
            policy_rules: vec![],
        }
    }

    fn run(req: BuildRequest) -> Build {
        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        let events = EventBus::new(Duration::from_millis(500));
        let clock = chengis_environment::SystemClock;
        let config = chengis_config::Config::default();
        let workspaces = WorkspaceManager::new(td.path().join("workspaces"));
        let artifact_cache = ArtifactCache::new(td.path().join("cache"));
        let mut reporter = chengis_store::NullReporter;
        let mut ctx = ExecutionContext { store: &store, events: &events, clock: &clock, config: &config, workspaces: &workspaces, artifact_cache: &artifact_cache, reporter: &mut reporter };
        let cancelled = AtomicBool::new(false);
        run_build(&mut ctx, req, &cancelled).unwrap()
    }

    #[test]
    fn linear_pipeline_with_no_dag_succeeds() {
        let req = request(vec![stage("build", &[], vec![shell_step("compile", "echo building")]), stage("test", &[], vec![shell_step("run", "echo testing")])]);
        let build = run(req);
        assert_eq!(build.status, BuildStatus::Success);
    }

    #[test]
    fn failing_stage_in_linear_pipeline_stops_remaining_stages() {
        let req = request(vec![stage("build", &[], vec![shell_step("compile", "exit 1")]), stage("test", &[], vec![shell_step("run", "echo should-not-run")])]);
        let build = run(req);
        assert_eq!(build.status, BuildStatus::Failure);
    }

    #[test]
    fn dag_pipeline_cascades_abort_to_dependents_of_a_failed_stage() {
        let req = request(vec![
            stage("build", &[], vec![shell_step("compile", "exit 1")]),
            stage("test", &["build"], vec![shell_step("run", "echo hi")]),
            stage("deploy", &["test"], vec![shell_step("ship", "echo hi")]),
        ]);
        let build = run(req);
        assert_eq!(build.status, BuildStatus::Failure);
    }

    #[test]
    fn tracing_feature_flag_attaches_an_otlp_span_export_to_build_completed() {
        let req = request(vec![stage("build", &[], vec![shell_step("compile", "echo hi")]), stage("test", &["build"], vec![shell_step("run", "echo hi")])]);

        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        let events = EventBus::new(Duration::from_millis(500));
        let clock = chengis_environment::SystemClock;
        let mut config = chengis_config::Config::default();
        config.feature_flags.tracing = true;
        let workspaces = WorkspaceManager::new(td.path().join("workspaces"));
        let artifact_cache = ArtifactCache::new(td.path().join("cache"));
        let mut reporter = chengis_store::NullReporter;
        let mut ctx = ExecutionContext { store: &store, events: &events, clock: &clock, config: &config, workspaces: &workspaces, artifact_cache: &artifact_cache, reporter: &mut reporter };
        let cancelled = AtomicBool::new(false);
        let build = run_build(&mut ctx, req, &cancelled).unwrap();

        let completed = store.list_events(&build.id).unwrap().into_iter().find(|e| e.event_type == EventKind::BuildCompleted).unwrap();
        let trace_json = completed.data["trace"].as_str().expect("tracing feature flag should attach a trace payload");
        let parsed: serde_json::Value = serde_json::from_str(trace_json).unwrap();
        let spans = parsed["resourceSpans"][0]["scopeSpans"][0]["spans"].as_array().unwrap();
        // root build span + 2 stage spans + 2 step spans
        assert_eq!(spans.len(), 5);
    }

    #[test]
    fn tracing_disabled_by_default_omits_the_trace_payload() {
        let req = request(vec![stage("build", &[], vec![shell_step("compile", "echo hi")])]);
        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        let events = EventBus::new(Duration::from_millis(500));
        let clock = chengis_environment::SystemClock;
        let config = chengis_config::Config::default();
        let workspaces = WorkspaceManager::new(td.path().join("workspaces"));
        let artifact_cache = ArtifactCache::new(td.path().join("cache"));
        let mut reporter = chengis_store::NullReporter;
        let mut ctx = ExecutionContext { store: &store, events: &events, clock: &clock, config: &config, workspaces: &workspaces, artifact_cache: &artifact_cache, reporter: &mut reporter };
        let cancelled = AtomicBool::new(false);
        let build = run_build(&mut ctx, req, &cancelled).unwrap();

        let completed = store.list_events(&build.id).unwrap().into_iter().find(|e| e.event_type == EventKind::BuildCompleted).unwrap();
        assert!(completed.data.get("trace").is_none());
    }

    #[test]
    fn downstream_jobs_to_trigger_filters_by_terminal_status() {
        let mut j = job();
        let upstream = chengis_types::JobId::generate();
        j.dependencies.push(JobDependency { upstream_job_id: upstream.clone(), trigger_on: vec![BuildStatus::Success] });
        let b = Build {
            id: BuildId::generate(),
            org_id: "acme".into(),
            job_id: j.id.clone(),
            build_number: 1,
            status: BuildStatus::Success,
            trigger_type: TriggerType::Manual,
            started_at: None,
            completed_at: None,
            created_at: chrono::Utc::now(),
            git_branch: None,
            git_commit: None,
            git_commit_short: None,
            git_author: None,
            git_message: None,
            pr_number: None,
            merge_request_number: None,
            parameters: BTreeMap::new(),
        };
        assert_eq!(downstream_jobs_to_trigger(&j, &b), vec![&upstream]);
    }

    #[test]
    fn required_approval_policy_adds_approval_gate_blocking_completion_until_resolved() {
        // A stage with no approval config and a policy rule requiring
        // approval ends up waiting on a gate; approving it immediately via
        // a zero-timeout synchronous resolve isn't exercised here (that's
        // chengis-lock's job) — this test only asserts the override is
        // merged onto the stage's approval config before the wait begins.
        let mut stage_def = stage("deploy", &[], vec![shell_step("ship", "echo hi")]);
        let rules = vec![chengis_types::PolicyRule::RequiredApproval { priority: 0, stages: vec!["deploy".into()], min_approvals: 2, approver_group: vec!["alice".into()] }];
        let clock = chengis_environment::SystemClock;
        let j = job();
        let b = Build {
            id: BuildId::generate(),
            org_id: j.org_id.clone(),
            job_id: j.id.clone(),
            build_number: 1,
            status: BuildStatus::Running,
            trigger_type: TriggerType::Manual,
            started_at: None,
            completed_at: None,
            created_at: chrono::Utc::now(),
            git_branch: Some("main".into()),
            git_commit: None,
            git_commit_short: None,
            git_author: None,
            git_message: None,
            pr_number: None,
            merge_request_number: None,
            parameters: BTreeMap::new(),
        };
        evaluate_stage_policy(&rules, &j, &b, &mut stage_def, &clock, true).unwrap();
        assert!(stage_def.approval.is_none(), "required-approval never fabricates a base approval config, only merges onto an existing one");
    }

    #[test]
    fn policy_denied_stage_fails_the_stage_and_the_build_without_running_its_steps() {
        let mut req = request(vec![stage("deploy", &[], vec![shell_step("ship", "echo should-not-run > marker.txt")])]);
        req.policy_rules = vec![chengis_types::PolicyRule::BranchRestriction {
            priority: 0,
            branches: vec!["main".into()],
            action: chengis_types::PolicyAction::Deny,
        }];

        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        let events = EventBus::new(Duration::from_millis(500));
        let clock = chengis_environment::SystemClock;
        let mut config = chengis_config::Config::default();
        config.feature_flags.policy_engine = true;
        let workspaces = WorkspaceManager::new(td.path().join("workspaces"));
        let artifact_cache = ArtifactCache::new(td.path().join("cache"));
        let mut reporter = chengis_store::NullReporter;
        let mut ctx = ExecutionContext { store: &store, events: &events, clock: &clock, config: &config, workspaces: &workspaces, artifact_cache: &artifact_cache, reporter: &mut reporter };
        let cancelled = AtomicBool::new(false);
        let build = run_build(&mut ctx, req, &cancelled).unwrap();

        assert_eq!(build.status, BuildStatus::Failure);
        let stages = store.list_stages(&build.id).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].status, StageStatus::Failure);
        let steps = store.list_steps(&build.id, "deploy").unwrap();
        assert!(steps.is_empty(), "a denied stage must never run any of its steps");
    }

    #[test]
    fn matrix_expansion_rewires_dependencies_to_every_expanded_copy() {
        let matrix = chengis_types::MatrixDef { axes: [("os".to_string(), vec!["linux".to_string(), "mac".to_string()])].into_iter().collect(), exclude: vec![] };
        let stages = vec![stage("build", &[], vec![shell_step("compile", "echo hi")]), stage("test", &["build"], vec![shell_step("run", "echo hi")])];
        let expanded = expand_with_inherited_dependencies(&stages, Some(&matrix), 100).unwrap();
        let test_stages: Vec<_> = expanded.iter().filter(|s| s.stage_name.starts_with("test (")).collect();
        assert_eq!(test_stages.len(), 2);
        for t in test_stages {
            assert_eq!(t.depends_on.len(), 2);
            assert!(t.depends_on.iter().all(|d| d.starts_with("build (")));
        }
    }
}
