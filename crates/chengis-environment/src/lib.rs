//! Clock abstraction and environment fingerprinting for Chengis.
//!
//! Two independent concerns live here because they're both "ambient
//! environment" the executor needs and neither is big enough to justify its
//! own crate: a [`Clock`] trait the executor and lock primitives take a
//! dependency on instead of calling `Utc::now()` directly (so tests can
//! inject deterministic time), and CI/host fingerprinting reused by stage
//! fingerprinting (§3 data model) to build the `stable-env` exclusion list.

use std::collections::BTreeMap;
use std::env;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Abstracts wall-clock time so the executor, lock primitives, and cron
/// scheduler can be driven by a fake clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that starts at a fixed instant and advances only when told to.
/// Used by tests that need reproducible, monotonically increasing
/// timestamps (e.g. to assert event ordering) without sleeping.
#[derive(Debug)]
pub struct FakeClock {
    base: DateTime<Utc>,
    offset_millis: AtomicI64,
}

impl FakeClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self { base, offset_millis: AtomicI64::new(0) }
    }

    /// Advance the clock and return the new `now()`.
    pub fn advance(&self, millis: i64) -> DateTime<Utc> {
        self.offset_millis.fetch_add(millis, Ordering::SeqCst);
        self.now()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::milliseconds(self.offset_millis.load(Ordering::SeqCst))
    }
}

/// Detected CI environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CiEnvironment {
    GitHubActions,
    GitLabCI,
    CircleCI,
    TravisCI,
    AzurePipelines,
    Jenkins,
    BitbucketPipelines,
    #[default]
    Local,
}

impl std::fmt::Display for CiEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CiEnvironment::GitHubActions => write!(f, "GitHub Actions"),
            CiEnvironment::GitLabCI => write!(f, "GitLab CI"),
            CiEnvironment::CircleCI => write!(f, "CircleCI"),
            CiEnvironment::TravisCI => write!(f, "Travis CI"),
            CiEnvironment::AzurePipelines => write!(f, "Azure Pipelines"),
            CiEnvironment::Jenkins => write!(f, "Jenkins"),
            CiEnvironment::BitbucketPipelines => write!(f, "Bitbucket Pipelines"),
            CiEnvironment::Local => write!(f, "Local"),
        }
    }
}

pub fn detect_environment() -> CiEnvironment {
    if env::var("GITHUB_ACTIONS").is_ok() {
        return CiEnvironment::GitHubActions;
    }
    if env::var("GITLAB_CI").is_ok() {
        return CiEnvironment::GitLabCI;
    }
    if env::var("CIRCLECI").is_ok() {
        return CiEnvironment::CircleCI;
    }
    if env::var("TRAVIS").is_ok() {
        return CiEnvironment::TravisCI;
    }
    if env::var("TF_BUILD").is_ok() {
        return CiEnvironment::AzurePipelines;
    }
    if env::var("JENKINS_URL").is_ok() {
        return CiEnvironment::Jenkins;
    }
    if env::var("BITBUCKET_BUILD_NUMBER").is_ok() {
        return CiEnvironment::BitbucketPipelines;
    }
    CiEnvironment::Local
}

pub fn is_ci() -> bool {
    detect_environment() != CiEnvironment::Local
}

/// Host information collected for fingerprinting a build's environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub ci_environment: CiEnvironment,
    pub os: String,
    pub arch: String,
    pub hostname: String,
    pub env_vars: BTreeMap<String, String>,
    pub collected_at: DateTime<Utc>,
}

impl EnvironmentInfo {
    pub fn collect() -> Result<Self> {
        Ok(Self {
            ci_environment: detect_environment(),
            os: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            env_vars: collect_env_vars(),
            collected_at: Utc::now(),
        })
    }

    pub fn fingerprint(&self) -> String {
        let mut components = vec![
            format!("ci:{}", self.ci_environment),
            format!("os:{}", self.os),
            format!("arch:{}", self.arch),
        ];
        for (key, value) in &self.env_vars {
            components.push(format!("{key}:{value}"));
        }
        components.join("|")
    }
}

fn collect_env_vars() -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    let ci_vars = [
        "CI",
        "GITHUB_REF",
        "GITHUB_SHA",
        "GITHUB_REPOSITORY",
        "GITHUB_RUN_ID",
        "GITLAB_CI_PIPELINE_ID",
        "CIRCLE_BUILD_NUM",
        "TRAVIS_BUILD_NUMBER",
        "BUILD_BUILDID",
        "BITBUCKET_BUILD_NUMBER",
    ];
    for var in ci_vars {
        if let Ok(value) = env::var(var) {
            vars.insert(var.to_string(), value);
        }
    }
    vars
}

pub fn get_ci_branch() -> Option<String> {
    match detect_environment() {
        CiEnvironment::GitHubActions => env::var("GITHUB_REF_NAME").ok(),
        CiEnvironment::GitLabCI => env::var("CI_COMMIT_REF_NAME").ok(),
        CiEnvironment::CircleCI => env::var("CIRCLE_BRANCH").ok(),
        CiEnvironment::TravisCI => env::var("TRAVIS_BRANCH").ok(),
        CiEnvironment::AzurePipelines => env::var("BUILD_SOURCEBRANCHNAME").ok(),
        CiEnvironment::Jenkins => env::var("GIT_BRANCH").ok(),
        CiEnvironment::BitbucketPipelines => env::var("BITBUCKET_BRANCH").ok(),
        CiEnvironment::Local => None,
    }
}

/// Environment variable key prefixes excluded from stage fingerprinting
/// (§3 data model: a stage's cache key is derived from its step commands,
/// inputs, and env — excluding variables that vary run-to-run without
/// affecting build output, like CI run IDs or timestamps).
pub const STABLE_ENV_EXCLUSIONS: &[&str] = &[
    "CI_",
    "GITHUB_RUN_",
    "GITHUB_SHA",
    "GITHUB_REF",
    "BUILD_BUILDID",
    "BUILD_NUMBER",
    "CIRCLE_BUILD_NUM",
    "CIRCLE_SHA1",
    "TRAVIS_BUILD_NUMBER",
    "TRAVIS_COMMIT",
    "BITBUCKET_BUILD_NUMBER",
    "BITBUCKET_COMMIT",
];

/// Filter a step's env map down to the keys that should participate in its
/// fingerprint, dropping anything matching [`STABLE_ENV_EXCLUSIONS`].
pub fn stable_env<'a>(env: &'a BTreeMap<String, String>) -> BTreeMap<&'a str, &'a str> {
    env.iter()
        .filter(|(k, _)| !STABLE_ENV_EXCLUSIONS.iter().any(|prefix| k.starts_with(prefix)))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}
