use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use chengis::pipeline::{BuildRequest, ExecutionContext};
use chengis_environment::SystemClock;
use chengis_events::EventBus;
use chengis_registry::ArtifactCache;
use chengis_storage::WorkspaceManager;
use chengis_store::{Reporter, Store};
use chengis_types::{
    BuildId, CheckStatus, DeploymentStrategy, Environment, JobId, PipelineDef, TriggerType,
};

#[derive(Parser, Debug)]
#[command(name = "chengis", version)]
#[command(about = "Build execution engine for a CI/CD orchestrator: run builds, resolve gates, deploy, manage IaC state, tick schedulers")]
struct Cli {
    /// Organization id all commands operate under.
    #[arg(long, default_value = "default", global = true)]
    org: String,

    /// Directory holding chengis.toml, the state file, workspaces, and the artifact cache.
    #[arg(long, default_value = ".chengis", global = true)]
    data_dir: PathBuf,

    /// Identity recorded as the actor for locks, approvals, and audit entries.
    #[arg(long, default_value = "cli", global = true)]
    user: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline definition to completion.
    Run(RunArgs),
    /// Show a build's stages and steps.
    Status { build: String },
    /// Resolve approval gates.
    Gate {
        #[command(subcommand)]
        cmd: GateCommands,
    },
    /// Run or roll back a deployment.
    Deploy {
        #[command(subcommand)]
        cmd: DeployCommands,
    },
    /// Promote a build from one environment to the next.
    Promote(PromoteArgs),
    /// Seed or inspect environment definitions.
    Env {
        #[command(subcommand)]
        cmd: EnvCommands,
    },
    /// Infrastructure-as-code plan/state/lock operations.
    Iac {
        #[command(subcommand)]
        cmd: IacCommands,
    },
    /// Process due cron schedules once.
    Cron,
    /// Run one tick of a background scheduler.
    Scheduler {
        #[command(subcommand)]
        cmd: SchedulerCommands,
    },
    /// Compliance audit chain and readiness checks.
    Compliance {
        #[command(subcommand)]
        cmd: ComplianceCommands,
    },
    /// Structurally diff two builds.
    Compare { left: String, right: String },
    /// Print environment and external-tool diagnostics.
    Doctor,
    /// Print shell completions.
    Completions { shell: clap_complete::Shell },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the pipeline definition (YAML).
    #[arg(long)]
    pipeline: PathBuf,
    /// Job name this build belongs to; created on first use.
    #[arg(long)]
    job: String,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long)]
    commit: Option<String>,
    #[arg(long)]
    author: Option<String>,
    #[arg(long)]
    message: Option<String>,
    #[arg(long)]
    pr_number: Option<u64>,
    /// Repeatable `KEY=VALUE` build parameter.
    #[arg(long = "param")]
    params: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum GateCommands {
    List { build: String },
    Approve {
        gate: String,
        /// Caller's role, compared against the gate's required role.
        #[arg(long, default_value = "admin")]
        role: String,
    },
    Reject {
        gate: String,
        #[arg(long, default_value = "admin")]
        role: String,
    },
}

#[derive(Subcommand, Debug)]
enum DeployCommands {
    Run {
        build: String,
        environment: String,
        /// `direct`, `blue-green`, or `canary:N`.
        #[arg(long, default_value = "direct")]
        strategy: String,
        /// Shell command template run for each strategy step; `{step}` is substituted.
        #[arg(long, default_value = "true")]
        step_cmd: String,
    },
    Rollback {
        environment: String,
        #[arg(long, default_value = "true")]
        step_cmd: String,
    },
}

#[derive(Parser, Debug)]
struct PromoteArgs {
    build: String,
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
    #[arg(long)]
    digest: String,
    #[arg(long, default_value = "true")]
    step_cmd: String,
}

#[derive(Subcommand, Debug)]
enum EnvCommands {
    /// Load environment definitions (JSON array) and persist them for `org`.
    Seed { file: PathBuf },
    List,
}

#[derive(Subcommand, Debug)]
enum IacCommands {
    /// Detect which IaC tool a directory uses.
    Detect { dir: PathBuf },
    /// Run `plan` (or `apply` with --apply) and print the parsed resource changes.
    Plan {
        dir: PathBuf,
        #[arg(long)]
        apply: bool,
        #[arg(long, default_value = "5m")]
        timeout: String,
    },
    /// Save a new state version from a local state file.
    SaveState { project: String, workspace: String, file: PathBuf },
    /// Diff two raw state JSON documents (by file path).
    Diff { before: PathBuf, after: PathBuf },
    Lock { project: String },
    Unlock { project: String },
}

#[derive(Subcommand, Debug)]
enum SchedulerCommands {
    Retention {
        #[arg(long, default_value_t = 30)]
        max_age_days: i64,
    },
    Rotation {
        /// IaC project id to check (repeatable); only locked projects are rotated.
        #[arg(long = "project")]
        projects: Vec<String>,
        #[arg(long, default_value_t = 1)]
        stale_after_hours: i64,
    },
    Analytics,
}

#[derive(Subcommand, Debug)]
enum ComplianceCommands {
    Verify,
    /// `checks_file` is a JSON array of `{"name": ..., "status": "passing"|"failing"|"not-assessed"}`.
    Readiness { framework: String, checks_file: PathBuf },
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

/// Everything a subcommand needs to talk to the engine, opened once per
/// invocation from `--data-dir`.
struct Session {
    store: chengis_state::JsonStore,
    config: chengis_config::Config,
    workspaces: WorkspaceManager,
    artifact_cache: ArtifactCache,
    events: EventBus,
    clock: SystemClock,
}

impl Session {
    fn open(data_dir: &PathBuf) -> Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;
        let store = chengis_state::JsonStore::open(data_dir.join("store.json"))?;
        let config = chengis_config::load_config(data_dir)?;
        let workspaces = WorkspaceManager::new(data_dir.join("workspaces"));
        let artifact_cache = ArtifactCache::new(data_dir.join("cache"));
        let events = EventBus::new(config.timeouts.critical_event_ms);
        Ok(Self { store, config, workspaces, artifact_cache, events, clock: SystemClock })
    }

    fn clock_now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let session = Session::open(&cli.data_dir)?;

    match cli.cmd {
        Commands::Run(args) => cmd_run(&session, &cli.org, args)?,
        Commands::Status { build } => cmd_status(&session, &build)?,
        Commands::Gate { cmd } => cmd_gate(&session, &cli.user, cmd)?,
        Commands::Deploy { cmd } => cmd_deploy(&session, &cli.user, cmd)?,
        Commands::Promote(args) => cmd_promote(&session, &cli.org, &cli.user, args)?,
        Commands::Env { cmd } => cmd_env(&session, &cli.org, cmd)?,
        Commands::Iac { cmd } => cmd_iac(&session, &cli.user, cmd)?,
        Commands::Cron => cmd_cron(&session)?,
        Commands::Scheduler { cmd } => cmd_scheduler(&session, &cli.org, cmd)?,
        Commands::Compliance { cmd } => cmd_compliance(&session, &cli.org, cmd)?,
        Commands::Compare { left, right } => cmd_compare(&session, &cli.org, &left, &right)?,
        Commands::Doctor => cmd_doctor(),
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        }
    }

    Ok(())
}

fn parse_params(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    for entry in raw {
        let (key, value) = entry.split_once('=').with_context(|| format!("invalid --param {entry:?}, expected KEY=VALUE"))?;
        params.insert(key.to_string(), value.to_string());
    }
    Ok(params)
}

fn find_or_create_job(store: &dyn Store, org: &str, name: &str) -> Result<chengis_types::Job> {
    if let Some(job) = store.list_jobs(org)?.into_iter().find(|j| j.name == name) {
        return Ok(job);
    }
    let job = chengis_types::Job {
        id: JobId::generate(),
        org_id: org.to_string(),
        name: name.to_string(),
        pipeline_source: name.to_string(),
        triggers: vec![],
        created_at: chrono::Utc::now(),
        dependencies: vec![],
        auto_merge_enabled: false,
        merge_method: None,
        delete_branch_after: false,
    };
    store.upsert_job(&job)?;
    Ok(job)
}

fn cmd_run(session: &Session, org: &str, args: RunArgs) -> Result<()> {
    let content = std::fs::read_to_string(&args.pipeline).with_context(|| format!("failed to read pipeline file: {}", args.pipeline.display()))?;
    let pipeline: PipelineDef = serde_yaml::from_str(&content).context("failed to parse pipeline definition")?;
    let job = find_or_create_job(&session.store, org, &args.job)?;

    let request = BuildRequest {
        job,
        pipeline,
        trigger_type: TriggerType::Manual,
        git_branch: args.branch,
        git_commit: args.commit,
        git_commit_short: None,
        git_author: args.author,
        git_message: args.message,
        pr_number: args.pr_number,
        merge_request_number: None,
        parameters: parse_params(&args.params)?,
        policy_rules: vec![],
    };

    let mut reporter = CliReporter;
    let mut ctx = ExecutionContext {
        store: &session.store,
        events: &session.events,
        clock: &session.clock,
        config: &session.config,
        workspaces: &session.workspaces,
        artifact_cache: &session.artifact_cache,
        reporter: &mut reporter,
    };
    let cancelled = AtomicBool::new(false);
    let build = chengis::pipeline::run_build(&mut ctx, request, &cancelled)?;

    println!("build: {} #{}", build.id, build.build_number);
    println!("status: {:?}", build.status);
    Ok(())
}

fn cmd_status(session: &Session, build_id: &str) -> Result<()> {
    let id: BuildId = build_id.into();
    let build = session.store.get_build(&id)?.with_context(|| format!("no such build: {build_id}"))?;
    println!("build: {} #{}", build.id, build.build_number);
    println!("status: {:?}", build.status);
    for stage in session.store.list_stages(&id)? {
        println!("  stage {} [{:?}]", stage.stage_name, stage.status);
        for step in session.store.list_steps(&id, &stage.stage_name)? {
            println!("    step {} [{:?}] exit={:?}", step.step_name, step.status, step.exit_code);
        }
    }
    Ok(())
}

fn cmd_gate(session: &Session, user: &str, cmd: GateCommands) -> Result<()> {
    match cmd {
        GateCommands::List { build } => {
            let id: BuildId = build.into();
            for stage in session.store.list_stages(&id)? {
                if let Some(gate) = session.store.get_gate_for_stage(&id, &stage.stage_name)? {
                    println!("{} [{:?}] stage={} required_role={}", gate.id, gate.status, stage.stage_name, gate.required_role);
                }
            }
        }
        GateCommands::Approve { gate, role } => {
            let gate_id: chengis_types::GateId = gate.into();
            let gate = session.store.get_gate(&gate_id)?.with_context(|| "no such gate")?;
            let approved = chengis_lock::approve(&session.store, &gate, user, &role, &session.clock)?;
            println!("approved: {approved}");
        }
        GateCommands::Reject { gate, role } => {
            let gate_id: chengis_types::GateId = gate.into();
            let gate = session.store.get_gate(&gate_id)?.with_context(|| "no such gate")?;
            let rejected = chengis_lock::reject(&session.store, &gate, user, &role, &session.clock)?;
            println!("rejected: {rejected}");
        }
    }
    Ok(())
}

fn parse_strategy(raw: &str) -> Result<DeploymentStrategy> {
    if raw == "direct" {
        return Ok(DeploymentStrategy::Direct);
    }
    if raw == "blue-green" {
        return Ok(DeploymentStrategy::BlueGreen);
    }
    if let Some(n) = raw.strip_prefix("canary:") {
        let steps: u32 = n.parse().with_context(|| format!("invalid canary step count: {n}"))?;
        return Ok(DeploymentStrategy::Canary { steps });
    }
    bail!("unknown deployment strategy: {raw} (expected direct, blue-green, or canary:N)")
}

fn shell_step_runner<'a>(workdir: &'a std::path::Path, template: &'a str) -> impl Fn(&str) -> Result<bool> + 'a {
    move |step_name: &str| {
        let command = template.replace("{step}", step_name);
        let spec = chengis_process::ProcessSpec::new("sh", workdir).args(["-c", &command]);
        let masker = chengis_process::mask::SecretMasker::default();
        let result = chengis_process::run(&spec, &masker, |_, line| eprintln!("[{step_name}] {line}"), |_| {})?;
        Ok(result.success())
    }
}

fn cmd_deploy(session: &Session, user: &str, cmd: DeployCommands) -> Result<()> {
    let cwd = std::env::current_dir()?;
    match cmd {
        DeployCommands::Run { build, environment, strategy, step_cmd } => {
            let id: BuildId = build.into();
            let build = session.store.get_build(&id)?.with_context(|| "no such build")?;
            let strategy = parse_strategy(&strategy)?;
            let runner = shell_step_runner(&cwd, &step_cmd);
            let deployment = chengis::deploy::execute_deployment(&session.store, &build, &environment, strategy, user, &session.clock, &runner)?;
            println!("deployment: {} [{:?}]", deployment.id, deployment.status);
        }
        DeployCommands::Rollback { environment, step_cmd } => {
            let current = session
                .store
                .list_deployments_for_environment(&environment)?
                .into_iter()
                .max_by_key(|d| d.created_at)
                .with_context(|| format!("no deployments recorded for {environment}"))?;
            let runner = shell_step_runner(&cwd, &step_cmd);
            let deployment = chengis::deploy::rollback_deployment(&session.store, &environment, &current, user, &session.clock, &runner)?;
            println!("rolled back to: {} [{:?}]", deployment.id, deployment.status);
        }
    }
    Ok(())
}

fn cmd_promote(session: &Session, org: &str, user: &str, args: PromoteArgs) -> Result<()> {
    let id: BuildId = args.build.into();
    let build = session.store.get_build(&id)?.with_context(|| "no such build")?;
    let to_env = session
        .store
        .list_environments(org)?
        .into_iter()
        .find(|e| e.name == args.to)
        .with_context(|| format!("unknown environment: {} (seed it first with `chengis env seed`)", args.to))?;
    let cwd = std::env::current_dir()?;
    let runner = shell_step_runner(&cwd, &args.step_cmd);
    let promotion = chengis::deploy::promote(&session.store, &build, &args.from, &to_env, &args.digest, user, &session.clock, &runner)?;
    println!("promotion: {} -> {} [{:?}]", promotion.from_env, promotion.to_env, promotion.status);
    Ok(())
}

fn cmd_env(session: &Session, org: &str, cmd: EnvCommands) -> Result<()> {
    match cmd {
        EnvCommands::Seed { file } => {
            let content = std::fs::read_to_string(&file).with_context(|| format!("failed to read {}", file.display()))?;
            let environments: Vec<Environment> = serde_json::from_str(&content).context("failed to parse environment list")?;
            session.store.seed_environments(org, environments)?;
            println!("seeded environments for {org}");
        }
        EnvCommands::List => {
            for env in session.store.list_environments(org)? {
                println!("{} order={} requires_approval={} auto_promote={}", env.name, env.env_order, env.requires_approval, env.auto_promote);
            }
        }
    }
    Ok(())
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn cmd_iac(session: &Session, user: &str, cmd: IacCommands) -> Result<()> {
    match cmd {
        IacCommands::Detect { dir } => match chengis::iac::detect_tool(&dir) {
            Some(tool) => println!("{tool:?}"),
            None => println!("no recognized IaC tool in {}", dir.display()),
        },
        IacCommands::Plan { dir, apply, timeout } => {
            let tool = chengis::iac::detect_tool(&dir).with_context(|| format!("no recognized IaC tool in {}", dir.display()))?;
            match chengis::iac::run_plan(tool, &dir, apply, parse_duration(&timeout)?)? {
                Some(summary) => {
                    println!("add={} change={} destroy={}", summary.resources_add, summary.resources_change, summary.resources_destroy);
                    for r in &summary.resources {
                        println!("  {:?} {} ({})", r.action, r.name, r.resource_type);
                    }
                }
                None => println!("{tool:?} is not installed; skipped"),
            }
        }
        IacCommands::SaveState { project, workspace, file } => {
            let plaintext = std::fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
            let state = chengis::iac::save_state(&session.store, &project, &workspace, &plaintext, user, session.clock_now())?;
            println!("saved version {} (hash={})", state.version, state.state_hash);
        }
        IacCommands::Diff { before, after } => {
            let before = std::fs::read_to_string(&before)?;
            let after = std::fs::read_to_string(&after)?;
            let diff = chengis::iac::diff_states(&before, &after);
            println!("added: {:?}", diff.added);
            println!("removed: {:?}", diff.removed);
            println!("changed: {:?}", diff.changed);
        }
        IacCommands::Lock { project } => {
            let acquired = chengis::iac::acquire_lock(&session.store, &project, user, session.clock_now())?;
            println!("locked: {acquired}");
        }
        IacCommands::Unlock { project } => {
            let released = chengis::iac::force_unlock(&session.store, &project)?;
            println!("released: {released}");
        }
    }
    Ok(())
}

fn cmd_cron(session: &Session) -> Result<()> {
    let threshold = session.config.intervals.missed_run_threshold_minutes;
    let results = chengis::cron::process_due_schedules(&session.store, &session.clock, threshold, |schedule| {
        eprintln!("[cron] triggering job {}", schedule.job_id);
        Ok(())
    })?;
    for (schedule, outcome) in &results {
        println!("{} -> {outcome:?}", schedule.id);
    }
    if results.is_empty() {
        println!("no schedules due");
    }
    Ok(())
}

fn cmd_scheduler(session: &Session, org: &str, cmd: SchedulerCommands) -> Result<()> {
    match cmd {
        SchedulerCommands::Retention { max_age_days } => {
            let candidates = chengis::schedulers::retention_tick(&session.store, org, session.clock_now(), chrono::Duration::days(max_age_days))?;
            println!("{} build(s) eligible for retention", candidates.len());
            for id in candidates {
                println!("  {id}");
            }
        }
        SchedulerCommands::Rotation { projects, stale_after_hours } => {
            let locks: Vec<_> = projects.iter().filter_map(|p| session.store.get_iac_lock(p).ok().flatten()).collect();
            let released = chengis::schedulers::rotate_stale_locks(&session.store, &locks, session.clock_now(), chrono::Duration::hours(stale_after_hours))?;
            println!("{} lock(s) rotated: {released:?}", released.len());
        }
        SchedulerCommands::Analytics => {
            let analytics = chengis::schedulers::analytics_tick(&session.store, org)?;
            println!(
                "total={} succeeded={} failed={} success_rate={}% mean_duration_ms={:?}",
                analytics.total, analytics.succeeded, analytics.failed, analytics.success_rate, analytics.mean_duration_ms
            );
        }
    }
    Ok(())
}

fn parse_check_status(raw: &str) -> CheckStatus {
    match raw {
        "passing" => CheckStatus::Passing,
        "failing" => CheckStatus::Failing,
        _ => CheckStatus::NotAssessed,
    }
}

#[derive(serde::Deserialize)]
struct CheckEntry {
    name: String,
    status: String,
}

fn cmd_compliance(session: &Session, org: &str, cmd: ComplianceCommands) -> Result<()> {
    match cmd {
        ComplianceCommands::Verify => {
            let entries = session.store.list_audit(org)?;
            match chengis::compliance::verify_audit_chain(&entries) {
                Some(brk) => println!("chain broken at index {}", brk.index),
                None => println!("chain intact ({} entries)", entries.len()),
            }
        }
        ComplianceCommands::Readiness { framework, checks_file } => {
            let content = std::fs::read_to_string(&checks_file).with_context(|| format!("failed to read {}", checks_file.display()))?;
            let entries: Vec<CheckEntry> = serde_json::from_str(&content).context("failed to parse checks file")?;
            let checks: Vec<(&str, CheckStatus)> = entries.iter().map(|e| (e.name.as_str(), parse_check_status(&e.status))).collect();
            let report = chengis::compliance::assess_readiness(&framework, checks);
            println!("{}: {}%", report.framework, report.score);
            for check in &report.checks {
                println!("  {} [{:?}]", check.name, check.status);
            }
        }
    }
    Ok(())
}

fn cmd_compare(session: &Session, org: &str, left: &str, right: &str) -> Result<()> {
    let left_id: BuildId = left.into();
    let right_id: BuildId = right.into();
    let left_build = session.store.get_build(&left_id)?.with_context(|| "no such build (left)")?;
    let right_build = session.store.get_build(&right_id)?.with_context(|| "no such build (right)")?;
    let comparison = chengis::compare::compare_builds(&session.store, &left_build, &right_build, org)?;
    println!("status_changed: {}", comparison.status_changed);
    for stage in &comparison.stages {
        if stage.changed() {
            println!("  stage {}: {:?} -> {:?}", stage.stage_name, stage.left, stage.right);
        }
    }
    for artifact in &comparison.artifacts {
        if artifact.changed() {
            println!("  artifact {}: {:?} -> {:?}", artifact.environment, artifact.left, artifact.right);
        }
    }
    if !comparison.has_differences() {
        println!("no differences");
    }
    Ok(())
}

fn cmd_doctor() {
    print_cmd_version("git");
    print_cmd_version("terraform");
    print_cmd_version("pulumi");
    print_cmd_version("aws");
    print_cmd_version("syft");
    print_cmd_version("cosign");
    print_cmd_version("gpg");
    print_cmd_version("opa");
    println!();
    println!("git_sha: {}", env!("CHENGIS_GIT_SHA"));
    println!("build_profile: {}", env!("CHENGIS_BUILD_PROFILE"));
    println!("rustc: {}", env!("CHENGIS_RUSTC_VERSION"));
}

fn print_cmd_version(cmd: &str) {
    let out = Command::new(cmd).arg("--version").output();
    match out {
        Ok(o) if o.status.success() => {
            let s = String::from_utf8_lossy(&o.stdout).lines().next().unwrap_or("").to_string();
            println!("{cmd}: {s}");
        }
        _ => println!("{cmd}: not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_params_splits_key_value_pairs() {
        let params = parse_params(&["FOO=bar".to_string(), "BAZ=qux".to_string()]).unwrap();
        assert_eq!(params.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(params.get("BAZ"), Some(&"qux".to_string()));
    }

    #[test]
    fn parse_params_rejects_entries_without_equals() {
        assert!(parse_params(&["nope".to_string()]).is_err());
    }

    #[test]
    fn parse_strategy_recognizes_all_three_forms() {
        assert_eq!(parse_strategy("direct").unwrap(), DeploymentStrategy::Direct);
        assert_eq!(parse_strategy("blue-green").unwrap(), DeploymentStrategy::BlueGreen);
        assert_eq!(parse_strategy("canary:4").unwrap(), DeploymentStrategy::Canary { steps: 4 });
        assert!(parse_strategy("nonsense").is_err());
    }

    #[test]
    fn parse_check_status_defaults_unknown_to_not_assessed() {
        assert_eq!(parse_check_status("passing"), CheckStatus::Passing);
        assert_eq!(parse_check_status("failing"), CheckStatus::Failing);
        assert_eq!(parse_check_status("whatever"), CheckStatus::NotAssessed);
    }

    #[test]
    fn find_or_create_job_is_idempotent_by_name() {
        let td = tempfile::tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        let first = find_or_create_job(&store, "acme", "widgets").unwrap();
        let second = find_or_create_job(&store, "acme", "widgets").unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn cli_reporter_methods_are_callable() {
        let mut rep = CliReporter;
        rep.info("info");
        rep.warn("warn");
        rep.error("error");
    }

    #[test]
    fn print_cmd_version_reports_missing_command() {
        print_cmd_version("definitely-not-a-real-chengis-command");
    }
}
