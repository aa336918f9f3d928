//! Stage-result cache fingerprinting (§3 data model, §4.G).
//!
//! `StageCacheRecord` is keyed by `(job-id, fingerprint)` where
//! `fingerprint = SHA-256(git-commit || canonical(stage-def.steps) ||
//! canonical(stable-env))`. The fingerprint must be independent of
//! `build-id`, `build-number`, `workspace`, and `job-name` (§8 property 4)
//! so that two builds of the same commit with the same stage definition and
//! environment hit the same cache entry.

use std::collections::BTreeMap;

use chengis_types::StepDef;
use sha2::{Digest, Sha256};

/// Env-var keys excluded from a stage fingerprint's environment component,
/// beyond the CI-vendor run-variant prefixes [`chengis_environment::STABLE_ENV_EXCLUSIONS`]
/// already filters. These four are named explicitly by the data model.
const STAGE_FINGERPRINT_LITERAL_EXCLUSIONS: &[&str] =
    &["BUILD_ID", "BUILD_NUMBER", "WORKSPACE", "JOB_NAME"];

/// Filter an environment map down to the subset that participates in a
/// stage fingerprint: drop both the CI-vendor run-variant keys
/// (`chengis-environment`'s exclusion list, e.g. `GITHUB_RUN_ID`) and the
/// four keys the data model names literally (`BUILD_ID`, `BUILD_NUMBER`,
/// `WORKSPACE`, `JOB_NAME`), which are unconditionally excluded regardless
/// of prefix match.
pub fn stable_env_for_fingerprint(env: &BTreeMap<String, String>) -> BTreeMap<&str, &str> {
    chengis_environment::stable_env(env)
        .into_iter()
        .filter(|(k, _)| !STAGE_FINGERPRINT_LITERAL_EXCLUSIONS.contains(k))
        .collect()
}

/// Canonicalize a serializable value as `serde_json` bytes. Map-shaped
/// fields in this workspace's types are `BTreeMap`, which `serde_json`
/// already serializes in key order, so this is a thin, well-named wrapper
/// rather than a general-purpose canonicalizer — the invariant it documents
/// is "never introduce a `HashMap` into a fingerprinted or hash-chained
/// type", not "reorder an arbitrary `serde_json::Value`".
pub fn canonical_json<T: serde::Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("canonical types are always serializable")
}

/// Compute the stage fingerprint gating the stage-result cache.
///
/// `git_commit` is the full commit SHA; `steps` is the stage's step
/// definitions in declaration order; `env` is the build's environment
/// before fingerprint-exclusion filtering (this function applies
/// [`stable_env_for_fingerprint`] itself).
pub fn stage_fingerprint(git_commit: &str, steps: &[StepDef], env: &BTreeMap<String, String>) -> String {
    let stable = stable_env_for_fingerprint(env);
    let mut hasher = Sha256::new();
    hasher.update(git_commit.as_bytes());
    hasher.update(canonical_json(&steps));
    hasher.update(canonical_json(&stable));
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_types::StepType;

    fn step(name: &str, command: &str) -> StepDef {
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
    fn fingerprint_is_deterministic_for_same_inputs() {
        let steps = vec![step("build", "cargo build")];
        let env = BTreeMap::new();
        let a = stage_fingerprint("abc123", &steps, &env);
        let b = stage_fingerprint("abc123", &steps, &env);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_changes_with_commit() {
        let steps = vec![step("build", "cargo build")];
        let env = BTreeMap::new();
        let a = stage_fingerprint("abc123", &steps, &env);
        let b = stage_fingerprint("def456", &steps, &env);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_changes_with_steps() {
        let env = BTreeMap::new();
        let a = stage_fingerprint("abc123", &[step("build", "cargo build")], &env);
        let b = stage_fingerprint("abc123", &[step("build", "cargo test")], &env);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_ignores_run_variant_env_keys() {
        let steps = vec![step("build", "cargo build")];
        let mut env_a = BTreeMap::new();
        env_a.insert("BUILD_NUMBER".to_string(), "1".to_string());
        env_a.insert("BUILD_ID".to_string(), "xyz".to_string());
        env_a.insert("WORKSPACE".to_string(), "/tmp/a".to_string());
        env_a.insert("JOB_NAME".to_string(), "my-job".to_string());
        env_a.insert("GITHUB_RUN_ID".to_string(), "999".to_string());

        let mut env_b = BTreeMap::new();
        env_b.insert("BUILD_NUMBER".to_string(), "2".to_string());
        env_b.insert("BUILD_ID".to_string(), "abc".to_string());
        env_b.insert("WORKSPACE".to_string(), "/tmp/b".to_string());
        env_b.insert("JOB_NAME".to_string(), "other-job".to_string());
        env_b.insert("GITHUB_RUN_ID".to_string(), "111".to_string());

        assert_eq!(stage_fingerprint("abc123", &steps, &env_a), stage_fingerprint("abc123", &steps, &env_b));
    }

    #[test]
    fn fingerprint_changes_with_stable_env() {
        let steps = vec![step("build", "cargo build")];
        let mut env_a = BTreeMap::new();
        env_a.insert("APP_ENV".to_string(), "staging".to_string());
        let mut env_b = BTreeMap::new();
        env_b.insert("APP_ENV".to_string(), "production".to_string());

        assert_ne!(stage_fingerprint("abc123", &steps, &env_a), stage_fingerprint("abc123", &steps, &env_b));
    }
}
