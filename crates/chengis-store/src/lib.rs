//! `Store` and `Reporter` trait abstractions for Chengis.
//!
//! The executor, approval-gate machine, cache, provenance chain, and every
//! other component in this workspace are written against the traits here,
//! never against a concrete database. `chengis-state` supplies a JSON-file
//! reference implementation good enough for tests and single-node use; a
//! production deployment is expected to swap in a real RDBMS-backed
//! implementation without touching the executor.
//!
//! Logging follows the same shape: components take a `&mut dyn Reporter`
//! rather than depending on a logging crate directly, so a CLI can render
//! progress bars while a server renders structured lines, from the same
//! core.

use anyhow::Result;
use chengis_types::{
    ApprovalGate, Attestation, AuditLog, Build, BuildEvent, BuildId, BuildLog, CacheEntry,
    CronSchedule, Deployment, DeploymentStep, Environment, EnvironmentArtifact, GateId, IacLock,
    IacState, Job, JobId, LicenseReport, Promotion, Sbom, ScheduleId, Signature, Stage,
    StageCacheRecord, Step,
};

/// Text-channel logging sink injected by the caller, mirroring the shape a
/// CLI progress bar or a server-side structured logger both implement.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A `Reporter` that discards everything; useful in tests and for library
/// callers that don't want console output.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// A `Reporter` that collects every line, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub lines: Vec<String>,
}

impl Reporter for RecordingReporter {
    fn info(&mut self, msg: &str) {
        self.lines.push(format!("INFO {msg}"));
    }

    fn warn(&mut self, msg: &str) {
        self.lines.push(format!("WARN {msg}"));
    }

    fn error(&mut self, msg: &str) {
        self.lines.push(format!("ERROR {msg}"));
    }
}

/// Persistence boundary for the build execution engine.
///
/// Every entity carries an `org_id` tenancy boundary at the type level
/// (`chengis_types::OrgId`); implementations are expected to scope every
/// query by it and never leak a row across organizations.
pub trait Store: Send + Sync {
    // Jobs & builds
    fn upsert_job(&self, job: &Job) -> Result<()>;
    fn get_job(&self, id: &JobId) -> Result<Option<Job>>;
    fn list_jobs(&self, org_id: &str) -> Result<Vec<Job>>;

    fn upsert_build(&self, build: &Build) -> Result<()>;
    fn get_build(&self, id: &BuildId) -> Result<Option<Build>>;
    fn list_builds_for_job(&self, job_id: &JobId) -> Result<Vec<Build>>;
    fn next_build_number(&self, job_id: &JobId) -> Result<u64>;

    // Stages & steps
    fn upsert_stage(&self, stage: &Stage) -> Result<()>;
    fn list_stages(&self, build_id: &BuildId) -> Result<Vec<Stage>>;

    fn upsert_step(&self, step: &Step) -> Result<()>;
    fn list_steps(&self, build_id: &BuildId, stage_name: &str) -> Result<Vec<Step>>;

    // Logs
    fn append_log(&self, log: &BuildLog) -> Result<()>;
    fn list_logs(&self, build_id: &BuildId) -> Result<Vec<BuildLog>>;

    // Events (durable event log; the event bus persists here before
    // broadcasting to live subscribers)
    fn append_event(&self, event: &BuildEvent) -> Result<()>;
    fn list_events(&self, build_id: &BuildId) -> Result<Vec<BuildEvent>>;

    // Approval gates
    fn upsert_gate(&self, gate: &ApprovalGate) -> Result<()>;
    fn get_gate(&self, id: &GateId) -> Result<Option<ApprovalGate>>;
    fn get_gate_for_stage(&self, build_id: &BuildId, stage_name: &str) -> Result<Option<ApprovalGate>>;

    /// Atomically transition a gate from `Pending` to a terminal status,
    /// returning `true` only if this call performed the transition
    /// (single-winner invariant: concurrent approve/reject racers see
    /// exactly one `true`).
    fn try_resolve_gate(
        &self,
        id: &GateId,
        resolve: &dyn Fn(&ApprovalGate) -> ApprovalGate,
    ) -> Result<bool>;

    // Audit log (append-only, hash-chained)
    fn append_audit(&self, entry: &AuditLog) -> Result<()>;
    fn last_audit(&self, org_id: &str) -> Result<Option<AuditLog>>;
    fn list_audit(&self, org_id: &str) -> Result<Vec<AuditLog>>;

    // Caches
    fn get_cache_entry(&self, job_id: &JobId, resolved_key: &str) -> Result<Option<CacheEntry>>;
    fn put_cache_entry(&self, entry: &CacheEntry) -> Result<()>;

    fn get_stage_cache(&self, job_id: &JobId, fingerprint: &str) -> Result<Option<StageCacheRecord>>;
    fn put_stage_cache(&self, record: &StageCacheRecord) -> Result<()>;

    // IaC
    fn get_iac_state(&self, project_id: &str, workspace_name: &str) -> Result<Option<IacState>>;
    fn put_iac_state(&self, state: &IacState) -> Result<()>;
    fn list_iac_versions(&self, project_id: &str, workspace_name: &str) -> Result<Vec<IacState>>;

    fn get_iac_lock(&self, project_id: &str) -> Result<Option<IacLock>>;
    /// Acquire iff currently unlocked; returns `true` only if this call
    /// acquired the lock.
    fn try_acquire_iac_lock(&self, lock: &IacLock) -> Result<bool>;
    fn release_iac_lock(&self, project_id: &str, locked_by: &str) -> Result<bool>;
    /// Release `project_id`'s lock regardless of who holds it. Returns
    /// `true` only if a lock was actually held.
    fn force_unlock_iac(&self, project_id: &str) -> Result<bool>;

    // Environments & deployments
    fn list_environments(&self, org_id: &str) -> Result<Vec<Environment>>;
    fn upsert_deployment(&self, deployment: &Deployment) -> Result<()>;
    fn list_deployments_for_environment(&self, environment: &str) -> Result<Vec<Deployment>>;
    fn upsert_deployment_step(&self, step: &DeploymentStep) -> Result<()>;
    fn list_deployment_steps(&self, deployment_id: &str) -> Result<Vec<DeploymentStep>>;
    fn upsert_promotion(&self, promotion: &Promotion) -> Result<()>;
    fn get_environment_artifact(&self, environment: &str, build_id: &BuildId) -> Result<Option<EnvironmentArtifact>>;
    fn put_environment_artifact(&self, artifact: &EnvironmentArtifact) -> Result<()>;

    fn try_acquire_environment_lock(&self, environment: &str, locked_by: &str) -> Result<bool>;
    fn release_environment_lock(&self, environment: &str, locked_by: &str) -> Result<bool>;

    // Provenance
    fn put_signature(&self, signature: &Signature) -> Result<()>;
    fn put_attestation(&self, attestation: &Attestation) -> Result<()>;
    fn put_sbom(&self, sbom: &Sbom) -> Result<()>;
    fn put_license_report(&self, report: &LicenseReport) -> Result<()>;
    fn get_sbom(&self, build_id: &BuildId) -> Result<Option<Sbom>>;

    // Cron schedules
    fn upsert_cron_schedule(&self, schedule: &CronSchedule) -> Result<()>;
    fn get_cron_schedule(&self, id: &ScheduleId) -> Result<Option<CronSchedule>>;
    fn list_cron_schedules(&self, org_id: &str) -> Result<Vec<CronSchedule>>;
    fn list_enabled_cron_schedules(&self) -> Result<Vec<CronSchedule>>;
}
