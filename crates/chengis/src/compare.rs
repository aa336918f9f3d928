//! Build comparator (§4.U): structural diff of two builds' stages, steps,
//! and artifacts.
//!
//! Read-side only — this module never mutates the store, it only shapes
//! two builds' already-persisted rows into an addressable diff. Grounded
//! in the same "compare two snapshots by key" shape `chengis-registry`'s
//! artifact delta uses, narrowed from byte blocks to named rows.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chengis_store::Store;
use chengis_types::{Build, BuildId, Stage, StageStatus, Step, StepStatus};

/// One stage's status in both builds, or its absence from one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDiff {
    pub stage_name: String,
    pub left: Option<StageStatus>,
    pub right: Option<StageStatus>,
}

impl StageDiff {
    pub fn changed(&self) -> bool {
        self.left != self.right
    }
}

/// One step's status in both builds, or its absence from one side,
/// addressed by `(stage_name, step_name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDiff {
    pub stage_name: String,
    pub step_name: String,
    pub left: Option<StepStatus>,
    pub right: Option<StepStatus>,
}

impl StepDiff {
    pub fn changed(&self) -> bool {
        self.left != self.right
    }
}

/// One environment artifact digest in both builds, or its absence from
/// one side, addressed by environment name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDiff {
    pub environment: String,
    pub left: Option<String>,
    pub right: Option<String>,
}

impl ArtifactDiff {
    pub fn changed(&self) -> bool {
        self.left != self.right
    }
}

/// Structural diff of two builds: every stage/step/artifact that exists on
/// either side, paired up by name and compared.
#[derive(Debug, Clone)]
pub struct BuildComparison {
    pub left_build_id: BuildId,
    pub right_build_id: BuildId,
    pub status_changed: bool,
    pub stages: Vec<StageDiff>,
    pub steps: Vec<StepDiff>,
    pub artifacts: Vec<ArtifactDiff>,
}

impl BuildComparison {
    pub fn has_differences(&self) -> bool {
        self.status_changed
            || self.stages.iter().any(StageDiff::changed)
            || self.steps.iter().any(StepDiff::changed)
            || self.artifacts.iter().any(ArtifactDiff::changed)
    }
}

fn diff_stages(left: &[Stage], right: &[Stage]) -> Vec<StageDiff> {
    let left_by_name: BTreeMap<&str, &Stage> = left.iter().map(|s| (s.stage_name.as_str(), s)).collect();
    let right_by_name: BTreeMap<&str, &Stage> = right.iter().map(|s| (s.stage_name.as_str(), s)).collect();
    let names: BTreeSet<&str> = left_by_name.keys().chain(right_by_name.keys()).copied().collect();

    names
        .into_iter()
        .map(|name| StageDiff {
            stage_name: name.to_string(),
            left: left_by_name.get(name).map(|s| s.status),
            right: right_by_name.get(name).map(|s| s.status),
        })
        .collect()
}

fn diff_steps(left: &[Step], right: &[Step]) -> Vec<StepDiff> {
    let left_by_key: BTreeMap<(&str, &str), &Step> = left.iter().map(|s| ((s.stage_name.as_str(), s.step_name.as_str()), s)).collect();
    let right_by_key: BTreeMap<(&str, &str), &Step> = right.iter().map(|s| ((s.stage_name.as_str(), s.step_name.as_str()), s)).collect();
    let keys: BTreeSet<(&str, &str)> = left_by_key.keys().chain(right_by_key.keys()).copied().collect();

    keys.into_iter()
        .map(|(stage_name, step_name)| StepDiff {
            stage_name: stage_name.to_string(),
            step_name: step_name.to_string(),
            left: left_by_key.get(&(stage_name, step_name)).map(|s| s.status),
            right: right_by_key.get(&(stage_name, step_name)).map(|s| s.status),
        })
        .collect()
}

fn diff_artifacts(
    environments: &[chengis_types::Environment],
    left_build: &BuildId,
    right_build: &BuildId,
    store: &dyn Store,
) -> Result<Vec<ArtifactDiff>> {
    let mut diffs = Vec::with_capacity(environments.len());
    for env in environments {
        let left = store.get_environment_artifact(&env.name, left_build)?.map(|a| a.artifact_digest);
        let right = store.get_environment_artifact(&env.name, right_build)?.map(|a| a.artifact_digest);
        if left.is_none() && right.is_none() {
            continue;
        }
        diffs.push(ArtifactDiff { environment: env.name.clone(), left, right });
    }
    Ok(diffs)
}

/// Compare two builds: their terminal status, every stage/step pair by
/// name, and every environment artifact either build placed.
pub fn compare_builds(store: &dyn Store, left: &Build, right: &Build, org_id: &str) -> Result<BuildComparison> {
    let left_stages = store.list_stages(&left.id)?;
    let right_stages = store.list_stages(&right.id)?;

    let mut steps_left = Vec::new();
    for stage in &left_stages {
        steps_left.extend(store.list_steps(&left.id, &stage.stage_name)?);
    }
    let mut steps_right = Vec::new();
    for stage in &right_stages {
        steps_right.extend(store.list_steps(&right.id, &stage.stage_name)?);
    }

    let environments = store.list_environments(org_id)?;
    let artifacts = diff_artifacts(&environments, &left.id, &right.id, store)?;

    Ok(BuildComparison {
        left_build_id: left.id.clone(),
        right_build_id: right.id.clone(),
        status_changed: left.status != right.status,
        stages: diff_stages(&left_stages, &right_stages),
        steps: diff_steps(&steps_left, &steps_right),
        artifacts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_types::{BuildStatus, Environment, EnvironmentArtifact, JobId, StepId, TriggerType};
    use std::collections::BTreeMap as Map;
    use tempfile::tempdir;

    fn build(status: BuildStatus) -> Build {
        Build {
            id: BuildId::generate(),
            org_id: "acme".into(),
            job_id: JobId::generate(),
            build_number: 1,
            status,
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
            parameters: Map::new(),
        }
    }

    fn stage(build_id: &BuildId, name: &str, status: StageStatus) -> Stage {
        Stage {
            id: chengis_types::StageId::generate(),
            build_id: build_id.clone(),
            stage_name: name.to_string(),
            status,
            started_at: None,
            completed_at: None,
            depends_on: vec![],
            matrix_combination: None,
        }
    }

    fn step(build_id: &BuildId, stage_name: &str, name: &str, status: StepStatus) -> Step {
        Step {
            id: StepId::generate(),
            build_id: build_id.clone(),
            stage_name: stage_name.to_string(),
            step_name: name.to_string(),
            status,
            exit_code: Some(0),
            stdout_truncated: false,
            stderr_truncated: false,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn identical_builds_have_no_differences() {
        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();

        let left = build(BuildStatus::Success);
        let right = build(BuildStatus::Success);
        store.upsert_stage(&stage(&left.id, "build", StageStatus::Success)).unwrap();
        store.upsert_stage(&stage(&right.id, "build", StageStatus::Success)).unwrap();
        store.upsert_step(&step(&left.id, "build", "compile", StepStatus::Success)).unwrap();
        store.upsert_step(&step(&right.id, "build", "compile", StepStatus::Success)).unwrap();

        let comparison = compare_builds(&store, &left, &right, "acme").unwrap();
        assert!(!comparison.has_differences());
    }

    #[test]
    fn a_stage_that_regressed_is_reported_as_changed() {
        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();

        let left = build(BuildStatus::Success);
        let right = build(BuildStatus::Failure);
        store.upsert_stage(&stage(&left.id, "build", StageStatus::Success)).unwrap();
        store.upsert_stage(&stage(&right.id, "build", StageStatus::Failure)).unwrap();

        let comparison = compare_builds(&store, &left, &right, "acme").unwrap();
        assert!(comparison.has_differences());
        assert!(comparison.status_changed);
        let build_diff = comparison.stages.iter().find(|d| d.stage_name == "build").unwrap();
        assert_eq!(build_diff.left, Some(StageStatus::Success));
        assert_eq!(build_diff.right, Some(StageStatus::Failure));
    }

    #[test]
    fn a_stage_only_present_on_one_side_is_reported_with_a_none_counterpart() {
        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();

        let left = build(BuildStatus::Success);
        let right = build(BuildStatus::Success);
        store.upsert_stage(&stage(&left.id, "build", StageStatus::Success)).unwrap();
        store.upsert_stage(&stage(&right.id, "build", StageStatus::Success)).unwrap();
        store.upsert_stage(&stage(&right.id, "deploy", StageStatus::Success)).unwrap();

        let comparison = compare_builds(&store, &left, &right, "acme").unwrap();
        let deploy_diff = comparison.stages.iter().find(|d| d.stage_name == "deploy").unwrap();
        assert_eq!(deploy_diff.left, None);
        assert_eq!(deploy_diff.right, Some(StageStatus::Success));
        assert!(deploy_diff.changed());
    }

    #[test]
    fn artifact_digests_are_compared_per_environment() {
        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();

        let left = build(BuildStatus::Success);
        let right = build(BuildStatus::Success);
        // list_environments is org-scoped in the reference store only via
        // what was upserted through deployments; here we exercise the
        // artifact lookup directly since `Environment` rows aren't
        // separately upsertable through the trait.
        store.put_environment_artifact(&EnvironmentArtifact { environment: "prod".into(), build_id: left.id.clone(), artifact_digest: "sha256:aaa".into() }).unwrap();
        store.put_environment_artifact(&EnvironmentArtifact { environment: "prod".into(), build_id: right.id.clone(), artifact_digest: "sha256:bbb".into() }).unwrap();

        let environments = vec![Environment { name: "prod".into(), env_order: 0, requires_approval: false, auto_promote: true }];
        let diffs = diff_artifacts(&environments, &left.id, &right.id, &store).unwrap();
        assert_eq!(diffs.len(), 1);
        assert!(diffs[0].changed());
    }
}
