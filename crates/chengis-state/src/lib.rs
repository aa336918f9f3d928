//! Reference `Store` implementation backed by a single JSON file.
//!
//! Good enough for tests and single-node use. A production deployment is
//! expected to swap this out for a real RDBMS-backed `Store` without
//! touching the executor, the event bus, or any other component written
//! against the trait in `chengis-store`. Every mutation re-serializes the
//! whole snapshot and writes it atomically (temp file + rename).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chengis_store::Store;
use chengis_types::{
    ApprovalGate, Attestation, AuditLog, Build, BuildEvent, BuildId, BuildLog, CacheEntry,
    CronSchedule, Deployment, DeploymentStep, Environment, EnvironmentArtifact, GateId,
    GateStatus, IacLock, IacState, Job, JobId, LicenseReport, Promotion, Sbom, ScheduleId,
    Signature, Stage, StageCacheRecord, Step,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    jobs: HashMap<String, Job>,
    builds: HashMap<String, Build>,
    build_numbers: HashMap<String, u64>,
    stages: HashMap<String, Stage>,
    steps: HashMap<String, Step>,
    logs: Vec<BuildLog>,
    events: Vec<BuildEvent>,
    gates: HashMap<String, ApprovalGate>,
    audit: Vec<AuditLog>,
    cache_entries: HashMap<String, CacheEntry>,
    stage_cache: HashMap<String, StageCacheRecord>,
    iac_states: HashMap<String, Vec<IacState>>,
    iac_locks: HashMap<String, IacLock>,
    environments: HashMap<String, Vec<Environment>>,
    deployments: HashMap<String, Deployment>,
    deployment_steps: HashMap<String, Vec<DeploymentStep>>,
    promotions: Vec<Promotion>,
    environment_artifacts: HashMap<String, EnvironmentArtifact>,
    environment_locks: HashMap<String, String>,
    signatures: Vec<Signature>,
    attestations: Vec<Attestation>,
    sboms: HashMap<String, Sbom>,
    license_reports: Vec<LicenseReport>,
    cron_schedules: HashMap<String, CronSchedule>,
}

fn iac_key(project_id: &str, workspace_name: &str) -> String {
    format!("{project_id}/{workspace_name}")
}

fn cache_key(job_id: &JobId, resolved_key: &str) -> String {
    format!("{}/{}", job_id.as_str(), resolved_key)
}

fn stage_cache_key(job_id: &JobId, fingerprint: &str) -> String {
    format!("{}/{}", job_id.as_str(), fingerprint)
}

fn artifact_key(environment: &str, build_id: &BuildId) -> String {
    format!("{}/{}", environment, build_id.as_str())
}

/// JSON-file-backed `Store`. Holds the whole snapshot in memory behind a
/// `Mutex` and flushes to disk on every write, which gives single-process
/// callers the same conditional-update guarantees (`try_resolve_gate`,
/// `try_acquire_iac_lock`, `try_acquire_environment_lock`) a real database
/// would provide via row locks or `UPDATE ... WHERE`.
pub struct JsonStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading store file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing store file {}", path.display()))?
        } else {
            StoreData::default()
        };
        Ok(Self { path, data: Mutex::new(data) })
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data).context("serializing store snapshot")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} to {}", tmp.display(), self.path.display()))?;
        Ok(())
    }

    /// Seed environments for an org. Not part of `Store` because
    /// environment catalogues are provisioned out of band (config or an
    /// admin surface), not by the executor.
    pub fn seed_environments(&self, org_id: &str, environments: Vec<Environment>) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.environments.insert(org_id.to_string(), environments);
        self.persist(&data)
    }
}

impl Store for JsonStore {
    fn upsert_job(&self, job: &Job) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.jobs.insert(job.id.as_str().to_string(), job.clone());
        self.persist(&data)
    }

    fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.data.lock().unwrap().jobs.get(id.as_str()).cloned())
    }

    fn list_jobs(&self, org_id: &str) -> Result<Vec<Job>> {
        Ok(self.data.lock().unwrap().jobs.values().filter(|j| j.org_id == org_id).cloned().collect())
    }

    fn upsert_build(&self, build: &Build) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.builds.insert(build.id.as_str().to_string(), build.clone());
        self.persist(&data)
    }

    fn get_build(&self, id: &BuildId) -> Result<Option<Build>> {
        Ok(self.data.lock().unwrap().builds.get(id.as_str()).cloned())
    }

    fn list_builds_for_job(&self, job_id: &JobId) -> Result<Vec<Build>> {
        let mut builds: Vec<Build> =
            self.data.lock().unwrap().builds.values().filter(|b| &b.job_id == job_id).cloned().collect();
        builds.sort_by_key(|b| b.build_number);
        Ok(builds)
    }

    fn next_build_number(&self, job_id: &JobId) -> Result<u64> {
        let mut data = self.data.lock().unwrap();
        let counter = data.build_numbers.entry(job_id.as_str().to_string()).or_insert(0);
        *counter += 1;
        let number = *counter;
        self.persist(&data)?;
        Ok(number)
    }

    fn upsert_stage(&self, stage: &Stage) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.stages.insert(stage.id.as_str().to_string(), stage.clone());
        self.persist(&data)
    }

    fn list_stages(&self, build_id: &BuildId) -> Result<Vec<Stage>> {
        Ok(self.data.lock().unwrap().stages.values().filter(|s| &s.build_id == build_id).cloned().collect())
    }

    fn upsert_step(&self, step: &Step) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.steps.insert(step.id.as_str().to_string(), step.clone());
        self.persist(&data)
    }

    fn list_steps(&self, build_id: &BuildId, stage_name: &str) -> Result<Vec<Step>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .steps
            .values()
            .filter(|s| &s.build_id == build_id && s.stage_name == stage_name)
            .cloned()
            .collect())
    }

    fn append_log(&self, log: &BuildLog) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.logs.push(log.clone());
        self.persist(&data)
    }

    fn list_logs(&self, build_id: &BuildId) -> Result<Vec<BuildLog>> {
        Ok(self.data.lock().unwrap().logs.iter().filter(|l| &l.build_id == build_id).cloned().collect())
    }

    fn append_event(&self, event: &BuildEvent) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.events.push(event.clone());
        self.persist(&data)
    }

    fn list_events(&self, build_id: &BuildId) -> Result<Vec<BuildEvent>> {
        Ok(self.data.lock().unwrap().events.iter().filter(|e| &e.build_id == build_id).cloned().collect())
    }

    fn upsert_gate(&self, gate: &ApprovalGate) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.gates.insert(gate.id.as_str().to_string(), gate.clone());
        self.persist(&data)
    }

    fn get_gate(&self, id: &GateId) -> Result<Option<ApprovalGate>> {
        Ok(self.data.lock().unwrap().gates.get(id.as_str()).cloned())
    }

    fn get_gate_for_stage(&self, build_id: &BuildId, stage_name: &str) -> Result<Option<ApprovalGate>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .gates
            .values()
            .find(|g| &g.build_id == build_id && g.stage_name == stage_name)
            .cloned())
    }

    fn try_resolve_gate(&self, id: &GateId, resolve: &dyn Fn(&ApprovalGate) -> ApprovalGate) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        let Some(gate) = data.gates.get(id.as_str()) else {
            return Ok(false);
        };
        if gate.status != GateStatus::Pending {
            return Ok(false);
        }
        let resolved = resolve(gate);
        data.gates.insert(id.as_str().to_string(), resolved);
        self.persist(&data)?;
        Ok(true)
    }

    fn append_audit(&self, entry: &AuditLog) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.audit.push(entry.clone());
        self.persist(&data)
    }

    fn last_audit(&self, _org_id: &str) -> Result<Option<AuditLog>> {
        Ok(self.data.lock().unwrap().audit.last().cloned())
    }

    fn list_audit(&self, _org_id: &str) -> Result<Vec<AuditLog>> {
        Ok(self.data.lock().unwrap().audit.clone())
    }

    fn get_cache_entry(&self, job_id: &JobId, resolved_key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.data.lock().unwrap().cache_entries.get(&cache_key(job_id, resolved_key)).cloned())
    }

    fn put_cache_entry(&self, entry: &CacheEntry) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.cache_entries.insert(cache_key(&entry.job_id, &entry.resolved_key), entry.clone());
        self.persist(&data)
    }

    fn get_stage_cache(&self, job_id: &JobId, fingerprint: &str) -> Result<Option<StageCacheRecord>> {
        Ok(self.data.lock().unwrap().stage_cache.get(&stage_cache_key(job_id, fingerprint)).cloned())
    }

    fn put_stage_cache(&self, record: &StageCacheRecord) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let key = stage_cache_key(&record.job_id, &record.fingerprint);
        // first write wins: a record already exists for this fingerprint, leave it alone.
        data.stage_cache.entry(key).or_insert_with(|| record.clone());
        self.persist(&data)
    }

    fn get_iac_state(&self, project_id: &str, workspace_name: &str) -> Result<Option<IacState>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .iac_states
            .get(&iac_key(project_id, workspace_name))
            .and_then(|versions| versions.iter().max_by_key(|s| s.version).cloned()))
    }

    fn put_iac_state(&self, state: &IacState) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let key = iac_key(&state.project_id, &state.workspace_name);
        data.iac_states.entry(key).or_default().push(state.clone());
        self.persist(&data)
    }

    fn list_iac_versions(&self, project_id: &str, workspace_name: &str) -> Result<Vec<IacState>> {
        let mut versions =
            self.data.lock().unwrap().iac_states.get(&iac_key(project_id, workspace_name)).cloned().unwrap_or_default();
        versions.sort_by_key(|s| s.version);
        Ok(versions)
    }

    fn get_iac_lock(&self, project_id: &str) -> Result<Option<IacLock>> {
        Ok(self.data.lock().unwrap().iac_locks.get(project_id).cloned())
    }

    fn try_acquire_iac_lock(&self, lock: &IacLock) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        if data.iac_locks.contains_key(&lock.project_id) {
            return Ok(false);
        }
        data.iac_locks.insert(lock.project_id.clone(), lock.clone());
        self.persist(&data)?;
        Ok(true)
    }

    fn release_iac_lock(&self, project_id: &str, locked_by: &str) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        match data.iac_locks.get(project_id) {
            Some(lock) if lock.locked_by == locked_by => {
                data.iac_locks.remove(project_id);
                self.persist(&data)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn force_unlock_iac(&self, project_id: &str) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        let had_lock = data.iac_locks.remove(project_id).is_some();
        if had_lock {
            self.persist(&data)?;
        }
        Ok(had_lock)
    }

    fn list_environments(&self, org_id: &str) -> Result<Vec<Environment>> {
        Ok(self.data.lock().unwrap().environments.get(org_id).cloned().unwrap_or_default())
    }

    fn upsert_deployment(&self, deployment: &Deployment) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.deployments.insert(deployment.id.clone(), deployment.clone());
        self.persist(&data)
    }

    fn list_deployments_for_environment(&self, environment: &str) -> Result<Vec<Deployment>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .deployments
            .values()
            .filter(|d| d.environment == environment)
            .cloned()
            .collect())
    }

    fn upsert_deployment_step(&self, step: &DeploymentStep) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let steps = data.deployment_steps.entry(step.deployment_id.clone()).or_default();
        if let Some(existing) = steps.iter_mut().find(|s| s.name == step.name) {
            *existing = step.clone();
        } else {
            steps.push(step.clone());
        }
        self.persist(&data)
    }

    fn list_deployment_steps(&self, deployment_id: &str) -> Result<Vec<DeploymentStep>> {
        Ok(self.data.lock().unwrap().deployment_steps.get(deployment_id).cloned().unwrap_or_default())
    }

    fn upsert_promotion(&self, promotion: &Promotion) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        if let Some(existing) = data
            .promotions
            .iter_mut()
            .find(|p| p.build_id == promotion.build_id && p.from_env == promotion.from_env && p.to_env == promotion.to_env)
        {
            *existing = promotion.clone();
        } else {
            data.promotions.push(promotion.clone());
        }
        self.persist(&data)
    }

    fn get_environment_artifact(&self, environment: &str, build_id: &BuildId) -> Result<Option<EnvironmentArtifact>> {
        Ok(self.data.lock().unwrap().environment_artifacts.get(&artifact_key(environment, build_id)).cloned())
    }

    fn put_environment_artifact(&self, artifact: &EnvironmentArtifact) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.environment_artifacts.insert(artifact_key(&artifact.environment, &artifact.build_id), artifact.clone());
        self.persist(&data)
    }

    fn try_acquire_environment_lock(&self, environment: &str, locked_by: &str) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        match data.environment_locks.get(environment) {
            Some(holder) if holder != locked_by => return Ok(false),
            _ => {}
        }
        data.environment_locks.insert(environment.to_string(), locked_by.to_string());
        self.persist(&data)?;
        Ok(true)
    }

    fn release_environment_lock(&self, environment: &str, locked_by: &str) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        match data.environment_locks.get(environment) {
            Some(holder) if holder == locked_by => {
                data.environment_locks.remove(environment);
                self.persist(&data)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn put_signature(&self, signature: &Signature) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.signatures.push(signature.clone());
        self.persist(&data)
    }

    fn put_attestation(&self, attestation: &Attestation) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.attestations.push(attestation.clone());
        self.persist(&data)
    }

    fn put_sbom(&self, sbom: &Sbom) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.sboms.insert(sbom.build_id.as_str().to_string(), sbom.clone());
        self.persist(&data)
    }

    fn put_license_report(&self, report: &LicenseReport) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.license_reports.push(report.clone());
        self.persist(&data)
    }

    fn get_sbom(&self, build_id: &BuildId) -> Result<Option<Sbom>> {
        Ok(self.data.lock().unwrap().sboms.get(build_id.as_str()).cloned())
    }

    fn upsert_cron_schedule(&self, schedule: &CronSchedule) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        data.cron_schedules.insert(schedule.id.as_str().to_string(), schedule.clone());
        self.persist(&data)
    }

    fn get_cron_schedule(&self, id: &ScheduleId) -> Result<Option<CronSchedule>> {
        Ok(self.data.lock().unwrap().cron_schedules.get(id.as_str()).cloned())
    }

    fn list_cron_schedules(&self, org_id: &str) -> Result<Vec<CronSchedule>> {
        Ok(self.data.lock().unwrap().cron_schedules.values().filter(|s| s.org_id == org_id).cloned().collect())
    }

    fn list_enabled_cron_schedules(&self) -> Result<Vec<CronSchedule>> {
        Ok(self.data.lock().unwrap().cron_schedules.values().filter(|s| s.enabled).cloned().collect())
    }
}
