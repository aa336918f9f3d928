//! Configuration surface for the Chengis build execution engine.
//!
//! Configuration *loading* is out of scope for the core (§1): the core
//! consumes a [`Config`] value and never reaches for an env var or a file
//! path on its own. This crate supplies the typed shape of that value
//! (feature flags plus per-subsystem settings, per §6) and a TOML loader
//! good enough for a single-process deployment — the same relationship the
//! reference `Store` in `chengis-state` has to the `Store` trait.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chengis_duration::{deserialize_duration, serialize_duration};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "chengis.toml";

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// `feature-flags.*` from §6. Every flag defaults to off so a minimal
/// config enables only linear stage execution and shell steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FeatureFlags {
    pub build_analytics: bool,
    pub auto_merge: bool,
    pub pr_status_checks: bool,
    pub branch_overrides: bool,
    pub monorepo_filtering: bool,
    pub build_dependencies: bool,
    pub artifact_cache: bool,
    pub build_result_cache: bool,
    pub cost_attribution: bool,
    pub license_scanning: bool,
    pub sbom_generation: bool,
    pub slsa_provenance: bool,
    pub artifact_signing: bool,
    pub artifact_checksums: bool,
    pub policy_engine: bool,
    pub cron_scheduling: bool,
    pub tracing: bool,
    pub webhook_replay: bool,
    pub secret_rotation: bool,
    pub regulatory_dashboards: bool,
    pub parallel_stage_execution: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    pub cache_root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self { root: PathBuf::from("./workspaces"), cache_root: PathBuf::from("./cache") }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TimeoutsConfig {
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub critical_event_ms: Duration,
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub opa_eval_ms: Duration,
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub http_ms: Duration,
    #[serde(serialize_with = "serialize_duration", deserialize_with = "deserialize_duration")]
    pub health_check_ms: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            critical_event_ms: Duration::from_millis(5_000),
            opa_eval_ms: Duration::from_millis(2_000),
            http_ms: Duration::from_millis(10_000),
            health_check_ms: Duration::from_millis(2_000),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IntervalsConfig {
    pub approval_poll_ms: u64,
    pub cron_tick_ms: u64,
    pub retention_tick_ms: u64,
    pub missed_run_threshold_minutes: i64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            approval_poll_ms: 2_000,
            cron_tick_ms: 60_000,
            retention_tick_ms: 3_600_000,
            missed_run_threshold_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ScmProviderConfig {
    pub token: Option<String>,
    pub username: Option<String>,
    pub app_password: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ScmConfig {
    #[serde(flatten)]
    pub providers: BTreeMap<String, ScmProviderConfig>,
}

impl ScmConfig {
    pub fn provider(&self, name: &str) -> Option<&ScmProviderConfig> {
        self.providers.get(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SigningConfig {
    pub tool: Option<String>,
    pub key_reference: Option<String>,
}

/// Per-org allow/deny license policy evaluated against SBOM components
/// (§4.Q step 2). A license absent from both lists is `unknown`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LicensePolicyConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProvenanceConfig {
    pub sbom_tool: Option<String>,
    #[serde(default = "default_sbom_format")]
    pub sbom_format: String,
    #[serde(default)]
    pub license_policy: BTreeMap<String, LicensePolicyConfig>,
}

fn default_sbom_format() -> String {
    "cyclonedx-json".to_string()
}

impl Default for ProvenanceConfig {
    fn default() -> Self {
        Self { sbom_tool: None, sbom_format: default_sbom_format(), license_policy: BTreeMap::new() }
    }
}

impl ProvenanceConfig {
    pub fn license_policy_for(&self, org_id: &str) -> LicensePolicyConfig {
        self.license_policy.get(org_id).cloned().unwrap_or_default()
    }
}

/// Complete configuration consumed by the core. `master_key` is the
/// passphrase handed to `chengis-encrypt` for state-at-rest encryption.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub feature_flags: FeatureFlags,
    pub workspace: WorkspaceConfig,
    pub timeouts: TimeoutsConfig,
    pub intervals: IntervalsConfig,
    pub scm: ScmConfig,
    pub signing: SigningConfig,
    pub provenance: ProvenanceConfig,
    pub master_key: Option<String>,
    pub max_matrix_combinations: Option<usize>,
    pub max_concurrent_stages: Option<usize>,
}

impl Config {
    pub fn max_matrix_combinations(&self) -> usize {
        self.max_matrix_combinations.unwrap_or(100)
    }

    pub fn max_concurrent_stages(&self) -> usize {
        self.max_concurrent_stages.unwrap_or(8)
    }
}

pub fn load_config(dir: &Path) -> Result<Config> {
    let path = config_path(dir);
    if !path.exists() {
        return Ok(Config::default());
    }
    load_config_from_file(&path)
}

pub fn load_config_from_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))
}

pub fn save_config(dir: &Path, config: &Config) -> Result<()> {
    let path = config_path(dir);
    let content = toml::to_string_pretty(config).context("failed to serialize config to TOML")?;
    std::fs::write(&path, content)
        .with_context(|| format!("failed to write config file: {}", path.display()))?;
    Ok(())
}

pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;
    loop {
        let candidate = current.join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
        current = current.parent()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_every_flag_off() {
        let config = Config::default();
        assert!(!config.feature_flags.policy_engine);
        assert!(!config.feature_flags.parallel_stage_execution);
        assert_eq!(config.max_matrix_combinations(), 100);
    }

    #[test]
    fn load_missing_config_returns_default() {
        let td = tempdir().expect("tempdir");
        let config = load_config(td.path()).expect("load");
        assert!(!config.feature_flags.auto_merge);
    }

    #[test]
    fn save_and_load_config_roundtrips_feature_flags() {
        let td = tempdir().expect("tempdir");
        let mut config = Config::default();
        config.feature_flags.policy_engine = true;
        config.feature_flags.build_result_cache = true;
        config.max_matrix_combinations = Some(250);

        save_config(td.path(), &config).expect("save");
        let loaded = load_config(td.path()).expect("load");

        assert!(loaded.feature_flags.policy_engine);
        assert!(loaded.feature_flags.build_result_cache);
        assert_eq!(loaded.max_matrix_combinations(), 250);
    }

    #[test]
    fn scm_provider_tokens_are_addressable_by_name() {
        let toml_src = r#"
            [scm.github]
            token = "ghp_abc"
            [scm.bitbucket]
            username = "bot"
            app-password = "secret"
        "#;
        let config: Config = toml::from_str(toml_src).expect("parse");
        assert_eq!(config.scm.provider("github").unwrap().token.as_deref(), Some("ghp_abc"));
        assert_eq!(config.scm.provider("bitbucket").unwrap().username.as_deref(), Some("bot"));
        assert!(config.scm.provider("gitlab").is_none());
    }

    #[test]
    fn find_config_walks_up_directory_tree() {
        let td = tempdir().expect("tempdir");
        let nested = td.path().join("a").join("b").join("c");
        std::fs::create_dir_all(&nested).expect("create dirs");
        let path = td.path().join(CONFIG_FILE);
        std::fs::write(&path, "").expect("write");

        assert_eq!(find_config(&nested), Some(path));
    }

    #[test]
    fn find_config_returns_none_when_absent() {
        let td = tempdir().expect("tempdir");
        let nested = td.path().join("a");
        std::fs::create_dir_all(&nested).expect("create dirs");
        assert!(find_config(&nested).is_none());
    }
}
