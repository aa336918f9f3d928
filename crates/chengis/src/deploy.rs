//! Deployment & promotion engine (§4.R).
//!
//! Environment locking follows the same conditional-update shape
//! `chengis-lock` uses for approval gates: acquire iff unlocked or already
//! held by the caller, release iff held by the caller.

use anyhow::{Result, bail};
use chengis_environment::Clock;
use chengis_store::Store;
use chengis_types::{
    Build, BuildId, BuildStatus, Deployment, DeploymentStatus, DeploymentStep, DeploymentStepStatus,
    DeploymentStrategy, Environment, EnvironmentArtifact, Promotion, PromotionStatus,
};

fn deployment_id(build_id: &BuildId, environment: &str, clock: &dyn Clock) -> String {
    format!("{environment}-{}-{}", build_id.as_str(), clock.now().timestamp_nanos_opt().unwrap_or(0))
}

fn step_names_for_strategy(strategy: DeploymentStrategy) -> Vec<String> {
    match strategy {
        DeploymentStrategy::Direct => vec!["deploy".to_string()],
        DeploymentStrategy::BlueGreen => {
            vec!["deploy-green".to_string(), "warm".to_string(), "switch".to_string(), "retire-blue".to_string()]
        }
        DeploymentStrategy::Canary { steps } => {
            (1..=steps.max(1)).map(|i| format!("promote-{}%", (i * 100) / steps.max(1))).collect()
        }
    }
}

/// A single deployment step's outcome, supplied by the caller (the actual
/// rollout mechanics — calling a k8s API, a load balancer, etc. — are
/// outside this engine's scope).
pub type StepRunner<'a> = dyn Fn(&str) -> Result<bool> + 'a;

/// Execute a deployment of `build` to `environment` using `strategy`.
/// Acquires the environment lock (refusing if held by another owner),
/// creates and runs the strategy's steps in order via `run_step`, and
/// releases the lock on both success and failure.
pub fn execute_deployment(
    store: &dyn Store,
    build: &Build,
    environment: &str,
    strategy: DeploymentStrategy,
    locked_by: &str,
    clock: &dyn Clock,
    run_step: &StepRunner<'_>,
) -> Result<Deployment> {
    if !store.try_acquire_environment_lock(environment, locked_by)? {
        bail!("environment {environment} is locked by another owner");
    }

    let deployment = Deployment {
        id: deployment_id(&build.id, environment, clock),
        build_id: build.id.clone(),
        environment: environment.to_string(),
        strategy,
        status: DeploymentStatus::Running,
        created_at: clock.now(),
    };
    store.upsert_deployment(&deployment)?;

    let mut failed = false;
    for step_name in step_names_for_strategy(strategy) {
        store.upsert_deployment_step(&DeploymentStep {
            deployment_id: deployment.id.clone(),
            name: step_name.clone(),
            status: DeploymentStepStatus::Running,
        })?;

        let succeeded = run_step(&step_name)?;
        store.upsert_deployment_step(&DeploymentStep {
            deployment_id: deployment.id.clone(),
            name: step_name,
            status: if succeeded { DeploymentStepStatus::Success } else { DeploymentStepStatus::Failure },
        })?;

        if !succeeded {
            failed = true;
            break;
        }
    }

    let mut finished = deployment.clone();
    finished.status = if failed { DeploymentStatus::Failed } else { DeploymentStatus::Succeeded };
    store.upsert_deployment(&finished)?;
    store.release_environment_lock(environment, locked_by)?;

    Ok(finished)
}

/// Roll back `environment` to the most recent prior `succeeded`
/// deployment strictly earlier than `current`. Creates a reverse
/// deployment against that build.
pub fn rollback_deployment(
    store: &dyn Store,
    environment: &str,
    current: &Deployment,
    locked_by: &str,
    clock: &dyn Clock,
    run_step: &StepRunner<'_>,
) -> Result<Deployment> {
    let prior = store
        .list_deployments_for_environment(environment)?
        .into_iter()
        .filter(|d| d.status == DeploymentStatus::Succeeded && d.created_at < current.created_at)
        .max_by_key(|d| d.created_at)
        .ok_or_else(|| anyhow::anyhow!("no prior succeeded deployment to roll back to on {environment}"))?;

    let rollback_build = Build {
        id: prior.build_id.clone(),
        org_id: "".into(),
        job_id: chengis_types::JobId::generate(),
        build_number: 0,
        status: BuildStatus::Success,
        trigger_type: chengis_types::TriggerType::Manual,
        started_at: None,
        completed_at: None,
        created_at: prior.created_at,
        git_branch: None,
        git_commit: None,
        git_commit_short: None,
        git_author: None,
        git_message: None,
        pr_number: None,
        merge_request_number: None,
        parameters: Default::default(),
    };

    let deployment = execute_deployment(store, &rollback_build, environment, prior.strategy, locked_by, clock, run_step)?;
    let mut rolled_back = deployment;
    if rolled_back.status == DeploymentStatus::Succeeded {
        rolled_back.status = DeploymentStatus::RolledBack;
        store.upsert_deployment(&rolled_back)?;
    }
    Ok(rolled_back)
}

/// Promote `build` from `from_env` to `to_env`. Rejects non-`success`
/// builds. If `to_env` requires approval, records the promotion as
/// `pending` without placing an artifact; otherwise places the artifact
/// and runs a direct deployment.
pub fn promote(
    store: &dyn Store,
    build: &Build,
    from_env: &str,
    to_env: &Environment,
    artifact_digest: &str,
    locked_by: &str,
    clock: &dyn Clock,
    run_step: &StepRunner<'_>,
) -> Result<Promotion> {
    if build.status != BuildStatus::Success {
        bail!("cannot promote a non-success build");
    }

    if to_env.requires_approval {
        let promotion = Promotion {
            build_id: build.id.clone(),
            from_env: from_env.to_string(),
            to_env: to_env.name.clone(),
            status: PromotionStatus::Pending,
        };
        store.upsert_promotion(&promotion)?;
        return Ok(promotion);
    }

    store.put_environment_artifact(&EnvironmentArtifact {
        environment: to_env.name.clone(),
        build_id: build.id.clone(),
        artifact_digest: artifact_digest.to_string(),
    })?;
    execute_deployment(store, build, &to_env.name, DeploymentStrategy::Direct, locked_by, clock, run_step)?;

    let promotion =
        Promotion { build_id: build.id.clone(), from_env: from_env.to_string(), to_env: to_env.name.clone(), status: PromotionStatus::Placed };
    store.upsert_promotion(&promotion)?;
    Ok(promotion)
}
