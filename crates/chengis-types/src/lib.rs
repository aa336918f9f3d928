//! Core domain types for the Chengis build execution engine.
//!
//! This crate holds the data modeled in the system's data model: `Job`,
//! `Build`, `Stage`, `Step`, `BuildLog`, `BuildEvent`, `ApprovalGate`,
//! `AuditLog`, cache records, deployment/IaC/provenance entities, and the
//! tagged-union pipeline definition types (`StageDef`, `StepDef`, ...) that a
//! pipeline-file parser produces and the executor consumes.
//!
//! Parsing YAML/EDN/JSON into these types is out of scope for this crate and
//! this workspace (see the pipeline executor's module docs); this crate only
//! defines the typed tree a parser is expected to hand the executor.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tenancy boundary carried on every persisted row.
pub type OrgId = String;

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Mint a lexicographically time-ordered id: epoch-millisecond timestamp
/// as zero-padded hex, then a monotonic counter breaking ties within the
/// same millisecond. String ordering of ids therefore matches creation
/// order, which event replay relies on.
fn next_ordered_id(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let seq = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{millis:013x}-{seq:08x}")
}

macro_rules! id_newtype {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Mint a fresh time-ordered id for a new row of this kind.
            pub fn generate() -> Self {
                Self(next_ordered_id($prefix))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

id_newtype!(JobId, "job_");
id_newtype!(BuildId, "build_");
id_newtype!(StageId, "stage_");
id_newtype!(StepId, "step_");
id_newtype!(EventId, "evt_");
id_newtype!(GateId, "gate_");
id_newtype!(AuditId, "audit_");

// ---------------------------------------------------------------------
// Job / Build / Stage / Step
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub org_id: OrgId,
    pub name: String,
    pub pipeline_source: String,
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
    pub created_at: DateTime<Utc>,
    /// Downstream jobs to trigger on this job's completion, and under what
    /// condition.
    #[serde(default)]
    pub dependencies: Vec<JobDependency>,
    /// Job-level auto-merge opt-in, separate from the global `auto-merge`
    /// feature flag.
    #[serde(default)]
    pub auto_merge_enabled: bool,
    #[serde(default)]
    pub merge_method: Option<String>,
    #[serde(default)]
    pub delete_branch_after: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDependency {
    pub upstream_job_id: JobId,
    /// Which upstream terminal statuses trigger this job.
    pub trigger_on: Vec<BuildStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Running,
    Success,
    Failure,
    Aborted,
    WaitingApproval,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failure | BuildStatus::Aborted)
    }

    /// Status-mapping invariant: `success -> success`, `failure -> failure`,
    /// `aborted -> error`, `running|queued|waiting-approval -> pending`.
    /// Total over `BuildStatus`.
    pub fn to_scm_status(self) -> ScmStatus {
        match self {
            BuildStatus::Success => ScmStatus::Success,
            BuildStatus::Failure => ScmStatus::Failure,
            BuildStatus::Aborted => ScmStatus::Error,
            BuildStatus::Running | BuildStatus::Queued | BuildStatus::WaitingApproval => {
                ScmStatus::Pending
            }
        }
    }

    /// Worst-status ordering used to roll a build's terminal status up from
    /// its stages: `failure > aborted > success > (non-terminal)`.
    fn rank(self) -> u8 {
        match self {
            BuildStatus::Failure => 3,
            BuildStatus::Aborted => 2,
            BuildStatus::Success => 1,
            BuildStatus::Queued | BuildStatus::Running | BuildStatus::WaitingApproval => 0,
        }
    }

    pub fn worse_of(self, other: BuildStatus) -> BuildStatus {
        if other.rank() > self.rank() { other } else { self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScmStatus {
    Success,
    Failure,
    Error,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    Cron,
    Api,
    Dependency,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub org_id: OrgId,
    pub job_id: JobId,
    pub build_number: u64,
    pub status: BuildStatus,
    pub trigger_type: TriggerType,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub git_branch: Option<String>,
    pub git_commit: Option<String>,
    pub git_commit_short: Option<String>,
    pub git_author: Option<String>,
    pub git_message: Option<String>,
    pub pr_number: Option<u64>,
    pub merge_request_number: Option<u64>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Build {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failure,
    Aborted,
    Skipped,
}

impl From<StageStatus> for BuildStatus {
    fn from(s: StageStatus) -> Self {
        match s {
            StageStatus::Success | StageStatus::Skipped => BuildStatus::Success,
            StageStatus::Failure => BuildStatus::Failure,
            StageStatus::Aborted => BuildStatus::Aborted,
            StageStatus::Pending | StageStatus::Running => BuildStatus::Running,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub build_id: BuildId,
    pub stage_name: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Present when this stage is one expanded copy of a matrix stage.
    #[serde(default)]
    pub matrix_combination: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failure,
    Aborted,
    Skipped,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub build_id: BuildId,
    pub stage_name: String,
    pub step_name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLog {
    pub build_id: BuildId,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

// ---------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    BuildStarted,
    BuildCompleted,
    BuildCancelled,
    StageStarted,
    StageCompleted,
    StepStarted,
    StepCompleted,
    LogLine,
    Progress,
    Heartbeat,
    ApprovalRequested,
    ProvenanceNotice,
}

impl EventKind {
    /// Critical events must succeed (block up to `critical-timeout-ms`, or
    /// return a timeout error). Everything else is best-effort.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            EventKind::BuildStarted
                | EventKind::BuildCompleted
                | EventKind::BuildCancelled
                | EventKind::StageStarted
                | EventKind::StageCompleted
                | EventKind::StepStarted
                | EventKind::StepCompleted
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    pub id: EventId,
    pub build_id: BuildId,
    pub event_type: EventKind,
    #[serde(default)]
    pub stage_name: Option<String>,
    #[serde(default)]
    pub step_name: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Approval gate
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

impl GateStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, GateStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub id: GateId,
    pub build_id: BuildId,
    pub stage_name: String,
    pub status: GateStatus,
    pub required_role: String,
    pub message: String,
    pub timeout_minutes: u64,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: AuditId,
    pub user_id: String,
    pub username: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub detail: serde_json::Value,
    pub ip_address: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

// ---------------------------------------------------------------------
// Caches
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub job_id: JobId,
    pub resolved_key: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCacheStatus {
    Success,
    Failure,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCacheRecord {
    pub job_id: JobId,
    pub fingerprint: String,
    pub status: StageCacheStatus,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// IaC
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IacState {
    pub project_id: String,
    pub workspace_name: String,
    pub version: u32,
    pub state_gzip_b64: String,
    pub state_hash: String,
    pub state_size: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IacLock {
    pub project_id: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IacTool {
    Terraform,
    Pulumi,
    CloudFormation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IacResourceChange {
    pub resource_type: String,
    pub name: String,
    pub action: IacAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IacAction {
    Add,
    Change,
    Destroy,
    NoOp,
}

// ---------------------------------------------------------------------
// Deployment & Promotion
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub env_order: u32,
    pub requires_approval: bool,
    pub auto_promote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStrategy {
    Direct,
    BlueGreen,
    Canary { steps: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub build_id: BuildId,
    pub environment: String,
    pub strategy: DeploymentStrategy,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStepStatus {
    Pending,
    Running,
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub deployment_id: String,
    pub name: String,
    pub status: DeploymentStepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    Pending,
    Approved,
    Placed,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promotion {
    pub build_id: BuildId,
    pub from_env: String,
    pub to_env: String,
    pub status: PromotionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentArtifact {
    pub environment: String,
    pub build_id: BuildId,
    pub artifact_digest: String,
}

// ---------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub build_id: BuildId,
    pub signer: String,
    pub key_reference: String,
    pub signature_value: String,
    pub target_digest: String,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attestation {
    pub build_id: BuildId,
    pub payload_type: String,
    pub payload_b64: String,
    pub predicate: serde_json::Value,
    pub subjects: serde_json::Value,
    pub source_repo: Option<String>,
    pub source_branch: Option<String>,
    pub source_commit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sbom {
    pub build_id: BuildId,
    pub format: String,
    pub version: String,
    pub component_count: usize,
    pub content_hash: String,
    pub tool_name: String,
    pub tool_version: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseReport {
    pub build_id: BuildId,
    pub allowed: Vec<String>,
    pub denied: Vec<String>,
    pub unknown: Vec<String>,
    pub passed: bool,
}

// ---------------------------------------------------------------------
// Pipeline definition — tagged unions, not dynamic maps
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    pub pipeline_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<StageDef>,
    #[serde(default)]
    pub matrix: Option<MatrixDef>,
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
    #[serde(default)]
    pub post_actions: Option<PostActions>,
    #[serde(default)]
    pub source: Option<SourceDef>,
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    pub stage_name: String,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub approval: Option<ApprovalConfig>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    pub steps: Vec<StepDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    pub message: String,
    pub role: String,
    #[serde(default = "default_min_approvals")]
    pub min_approvals: u32,
    #[serde(default)]
    pub approver_group: Vec<String>,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
}

fn default_min_approvals() -> u32 {
    1
}

fn default_timeout_minutes() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub key: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub step_name: String,
    #[serde(default)]
    pub step_type: StepType,
    pub command: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub cache_volumes: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Shell,
    Docker,
    Compose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Branch { branch: String },
    Param { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixDef {
    pub axes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Text,
    Choice,
    Bool,
    Number,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostActions {
    #[serde(default)]
    pub always: Vec<StepDef>,
    #[serde(default)]
    pub on_success: Vec<StepDef>,
    #[serde(default)]
    pub on_failure: Vec<StepDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDef {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDef {
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(flatten)]
    pub config: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------
// Policy engine types — tagged unions
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterOperator {
    Equals,
    NotEquals,
    Matches,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyRule {
    BranchRestriction {
        priority: i32,
        branches: Vec<String>,
        action: PolicyAction,
    },
    AuthorRestriction {
        priority: i32,
        authors: Vec<String>,
        action: PolicyAction,
    },
    TimeWindow {
        priority: i32,
        timezone: String,
        days: Vec<u8>,
        start_hour: u8,
        end_hour: u8,
        action: PolicyAction,
    },
    ParameterRestriction {
        priority: i32,
        parameter: String,
        operator: ParameterOperator,
        value: String,
        action: PolicyAction,
    },
    RequiredApproval {
        priority: i32,
        stages: Vec<String>,
        min_approvals: u32,
        approver_group: Vec<String>,
    },
    Opa {
        priority: i32,
        policy_path: String,
        timeout_ms: u64,
    },
}

impl PolicyRule {
    pub fn priority(&self) -> i32 {
        match self {
            PolicyRule::BranchRestriction { priority, .. }
            | PolicyRule::AuthorRestriction { priority, .. }
            | PolicyRule::TimeWindow { priority, .. }
            | PolicyRule::ParameterRestriction { priority, .. }
            | PolicyRule::RequiredApproval { priority, .. }
            | PolicyRule::Opa { priority, .. } => *priority,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalOverride {
    pub min_approvals: u32,
    pub approver_group: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PolicyResult {
    Allow,
    Deny { rule_index: usize, reason: String },
    ApprovalOverride(ApprovalOverride),
}

// ---------------------------------------------------------------------
// Cron scheduling — persisted schedule state (§4.O)
// ---------------------------------------------------------------------

id_newtype!(ScheduleId, "sched_");

/// A persisted cron schedule attached to a job. `expression` is a 5-field
/// POSIX cron string; `next_run_at` is advanced by the scheduler after
/// every tick, whether the tick triggered a build, was logged as missed,
/// or found the schedule disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSchedule {
    pub id: ScheduleId,
    pub org_id: OrgId,
    pub job_id: JobId,
    pub expression: String,
    pub timezone: String,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Outcome of one scheduler tick against a single schedule, recorded to
/// the audit trail by `chengis::cron`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRunOutcome {
    Triggered,
    Missed,
    Disabled,
}

// ---------------------------------------------------------------------
// Compliance readiness checks (§4.T)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passing,
    Failing,
    NotAssessed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessCheck {
    pub name: String,
    pub status: CheckStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub framework: String,
    pub checks: Vec<ReadinessCheck>,
    /// `passing / total * 100`, rounded to two decimal places.
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_status_worst_of_failure_wins() {
        let worst = BuildStatus::Success.worse_of(BuildStatus::Failure);
        assert_eq!(worst, BuildStatus::Failure);
    }

    #[test]
    fn build_status_worst_of_aborted_beats_success() {
        let worst = BuildStatus::Success.worse_of(BuildStatus::Aborted);
        assert_eq!(worst, BuildStatus::Aborted);
    }

    #[test]
    fn build_status_worst_of_failure_beats_aborted() {
        let worst = BuildStatus::Aborted.worse_of(BuildStatus::Failure);
        assert_eq!(worst, BuildStatus::Failure);
    }

    #[test]
    fn scm_status_mapping_is_total() {
        assert_eq!(BuildStatus::Success.to_scm_status(), ScmStatus::Success);
        assert_eq!(BuildStatus::Failure.to_scm_status(), ScmStatus::Failure);
        assert_eq!(BuildStatus::Aborted.to_scm_status(), ScmStatus::Error);
        assert_eq!(BuildStatus::Running.to_scm_status(), ScmStatus::Pending);
        assert_eq!(BuildStatus::Queued.to_scm_status(), ScmStatus::Pending);
        assert_eq!(
            BuildStatus::WaitingApproval.to_scm_status(),
            ScmStatus::Pending
        );
    }

    #[test]
    fn event_kind_critical_classification() {
        assert!(EventKind::BuildStarted.is_critical());
        assert!(EventKind::StepCompleted.is_critical());
        assert!(!EventKind::LogLine.is_critical());
        assert!(!EventKind::Heartbeat.is_critical());
    }

    #[test]
    fn id_newtype_roundtrips_through_json() {
        let id = BuildId::new("b-1");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"b-1\"");
        let back: BuildId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn policy_rule_priority_is_total() {
        let rule = PolicyRule::Opa {
            priority: 5,
            policy_path: "p.rego".into(),
            timeout_ms: 1000,
        };
        assert_eq!(rule.priority(), 5);
    }

    #[test]
    fn condition_tagged_union_serializes_by_type() {
        let c = Condition::Branch { branch: "main".into() };
        let json = serde_json::to_string(&c).expect("serialize");
        assert!(json.contains("\"type\":\"branch\""));
    }
}
