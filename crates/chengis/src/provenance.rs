//! Provenance chain (§4.Q): SBOM → license scan → signing → SLSA-v1
//! attestation, run on a successful build. Each step is independently
//! feature-flagged and downstream steps tolerate an upstream skip.
//!
//! External tool invocation mirrors `chengis_policy::opa_allows`: a missing
//! binary (exit 127 / `which` lookup failure) is never an error, it is a
//! silent skip of that step.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::time::Duration;

use anyhow::Result;
use base64::Engine as _;
use chengis_config::{LicensePolicyConfig, ProvenanceConfig, SigningConfig};
use chengis_process::{ProcessSpec, SecretMasker, command_exists, run};
use chengis_store::Store;
use chengis_types::{Attestation, Build, BuildId, LicenseReport, Sbom, Signature};
use sha2::{Digest, Sha256};

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Invoke the configured SBOM tool (default `syft`) against `target`.
/// Missing binary skips silently (returns `Ok(None)`).
fn generate_sbom(build: &Build, target: &str, config: &ProvenanceConfig, timeout: Duration) -> Result<Option<Sbom>> {
    let tool = config.sbom_tool.as_deref().unwrap_or("syft");
    if !command_exists(tool) {
        return Ok(None);
    }

    let workdir = std::env::temp_dir();
    let spec = ProcessSpec::new(tool, workdir)
        .args([target.to_string(), "-o".to_string(), config.sbom_format.clone()])
        .timeout(timeout);
    let result = run(&spec, &SecretMasker::default(), |_, _| {}, |_| {})?;
    if result.timed_out {
        return Ok(None);
    }

    let content = result.stdout;
    let component_count = serde_json::from_str::<serde_json::Value>(&content)
        .ok()
        .and_then(|v| v.get("components").and_then(|c| c.as_array().map(|a| a.len())))
        .unwrap_or(0);

    Ok(Some(Sbom {
        build_id: build.id.clone(),
        format: config.sbom_format.clone(),
        version: "1".to_string(),
        component_count,
        content_hash: sha256_hex(content.as_bytes()),
        tool_name: tool.to_string(),
        tool_version: "unknown".to_string(),
        content,
    }))
}

/// Evaluate each SBOM component's `license-id` against the org's
/// allow/deny policy. A license absent from both lists is `unknown`.
fn scan_licenses(build: &Build, sbom: &Sbom, policy: &LicensePolicyConfig) -> LicenseReport {
    let license_ids: Vec<String> = serde_json::from_str::<serde_json::Value>(&sbom.content)
        .ok()
        .and_then(|v| v.get("components").cloned())
        .and_then(|components| components.as_array().cloned())
        .unwrap_or_default()
        .iter()
        .filter_map(|component| component.get("license-id").and_then(|id| id.as_str()).map(str::to_string))
        .collect();

    let mut allowed = Vec::new();
    let mut denied = Vec::new();
    let mut unknown = Vec::new();
    for license_id in license_ids {
        if policy.deny.contains(&license_id) {
            denied.push(license_id);
        } else if policy.allow.contains(&license_id) {
            allowed.push(license_id);
        } else {
            unknown.push(license_id);
        }
    }

    let passed = denied.is_empty();
    LicenseReport { build_id: build.id.clone(), allowed, denied, unknown, passed }
}

/// One artifact to sign and attest: a display name plus the bytes backing
/// its digest.
pub struct ArtifactRef<'a> {
    pub name: String,
    pub content: &'a [u8],
}

/// Sign `artifact` with the configured tool (`cosign` or `gpg`, default
/// `cosign`). Missing binary skips silently.
fn sign_artifact(build: &Build, artifact: &ArtifactRef<'_>, config: &SigningConfig, timeout: Duration) -> Result<Option<Signature>> {
    let tool = config.tool.as_deref().unwrap_or("cosign");
    if !command_exists(tool) {
        return Ok(None);
    }

    let digest = sha256_hex(artifact.content);
    let key_reference = config.key_reference.clone().unwrap_or_default();

    let mut artifact_file = tempfile::NamedTempFile::new()?;
    artifact_file.write_all(artifact.content)?;
    let artifact_path = artifact_file.path().to_string_lossy().to_string();

    let workdir = std::env::temp_dir();
    let spec = match tool {
        "gpg" => ProcessSpec::new(tool, workdir).args(["--detach-sign", "--armor", "--output", "-", &artifact_path]),
        _ => ProcessSpec::new(tool, workdir).args(["sign-blob", "--key", &key_reference, &artifact_path]),
    }
    .timeout(timeout);

    let result = run(&spec, &SecretMasker::default(), |_, _| {}, |_| {})?;
    if result.timed_out {
        return Ok(None);
    }

    Ok(Some(Signature {
        build_id: build.id.clone(),
        signer: tool.to_string(),
        key_reference,
        signature_value: result.stdout,
        target_digest: digest,
        verified: false,
    }))
}

/// Build the SLSA-v1 in-toto predicate, wrap it in a DSSE envelope, and
/// compute the subject digests from `artifacts`.
fn build_attestation(build: &Build, artifacts: &[ArtifactRef<'_>], parameters: &BTreeMap<String, String>) -> Attestation {
    let subjects: Vec<serde_json::Value> = artifacts
        .iter()
        .map(|a| {
            serde_json::json!({
                "name": a.name,
                "digest": { "sha256": sha256_hex(a.content) },
            })
        })
        .collect();

    let predicate = serde_json::json!({
        "buildDefinition": {
            "buildType": "chengis/pipeline/v1",
            "externalParameters": { "pipeline": build.job_id.as_str(), "parameters": parameters },
            "internalParameters": {
                "build-id": build.id.as_str(),
                "job-id": build.job_id.as_str(),
                "build-number": build.build_number,
            },
        },
        "runDetails": {
            "builder": { "id": "chengis", "version": "1.0" },
            "metadata": {
                "invocationId": build.id.as_str(),
                "startedOn": build.started_at,
                "finishedOn": build.completed_at,
            },
            "byproducts": [],
        },
    });

    let envelope_payload = serde_json::json!({
        "_type": "https://in-toto.io/Statement/v1",
        "subject": subjects,
        "predicate": predicate,
    });
    let payload_b64 = base64::engine::general_purpose::STANDARD.encode(envelope_payload.to_string());

    Attestation {
        build_id: build.id.clone(),
        payload_type: "application/vnd.in-toto+json".to_string(),
        payload_b64,
        predicate,
        subjects: serde_json::Value::Array(subjects),
        source_repo: None,
        source_branch: build.git_branch.clone(),
        source_commit: build.git_commit.clone(),
    }
}

/// Which provenance steps ran, for the caller's logging/audit emission.
#[derive(Debug, Default)]
pub struct ProvenanceOutcome {
    pub sbom: Option<Sbom>,
    pub license_report: Option<LicenseReport>,
    pub signatures: Vec<Signature>,
    pub attestation: Option<Attestation>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProvenanceFlags {
    pub sbom_generation: bool,
    pub license_scanning: bool,
    pub artifact_signing: bool,
    pub slsa_provenance: bool,
}

/// Run the full chain for one build. `sbom_target` is the workspace path
/// (or image reference) handed to the SBOM tool; `artifacts` are the
/// build's output artifacts to sign and attest.
#[allow(clippy::too_many_arguments)]
pub fn run_provenance_chain(
    store: &dyn Store,
    build: &Build,
    org_id: &str,
    sbom_target: &str,
    artifacts: &[ArtifactRef<'_>],
    flags: ProvenanceFlags,
    provenance_config: &ProvenanceConfig,
    signing_config: &SigningConfig,
    timeout: Duration,
) -> Result<ProvenanceOutcome> {
    let mut outcome = ProvenanceOutcome::default();

    if flags.sbom_generation {
        if let Some(sbom) = generate_sbom(build, sbom_target, provenance_config, timeout)? {
            store.put_sbom(&sbom)?;
            outcome.sbom = Some(sbom);
        }
    }

    if flags.license_scanning {
        if let Some(sbom) = &outcome.sbom {
            let policy = provenance_config.license_policy_for(org_id);
            let report = scan_licenses(build, sbom, &policy);
            store.put_license_report(&report)?;
            outcome.license_report = Some(report);
        }
    }

    if flags.artifact_signing {
        for artifact in artifacts {
            if let Some(signature) = sign_artifact(build, artifact, signing_config, timeout)? {
                store.put_signature(&signature)?;
                outcome.signatures.push(signature);
            }
        }
    }

    if flags.slsa_provenance {
        let attestation = build_attestation(build, artifacts, &build.parameters);
        store.put_attestation(&attestation)?;
        outcome.attestation = Some(attestation);
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_types::{JobId, TriggerType};
    use tempfile::tempdir;

    fn build() -> Build {
        Build {
            id: BuildId::generate(),
            org_id: "acme".into(),
            job_id: JobId::generate(),
            build_number: 1,
            status: chengis_types::BuildStatus::Success,
            trigger_type: TriggerType::Manual,
            started_at: Some(chrono::Utc::now()),
            completed_at: Some(chrono::Utc::now()),
            created_at: chrono::Utc::now(),
            git_branch: Some("main".into()),
            git_commit: Some("deadbeef".into()),
            git_commit_short: Some("deadbee".into()),
            git_author: None,
            git_message: None,
            pr_number: None,
            merge_request_number: None,
            parameters: BTreeMap::new(),
        }
    }

    #[test]
    fn sbom_generation_skips_silently_when_tool_missing() {
        let config = ProvenanceConfig { sbom_tool: Some("definitely-not-a-real-binary".into()), ..Default::default() };
        let result = generate_sbom(&build(), ".", &config, Duration::from_millis(100)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn license_scan_splits_allow_deny_unknown() {
        let b = build();
        let sbom = Sbom {
            build_id: b.id.clone(),
            format: "cyclonedx-json".into(),
            version: "1".into(),
            component_count: 3,
            content_hash: "abc".into(),
            tool_name: "syft".into(),
            tool_version: "1.0".into(),
            content: serde_json::json!({
                "components": [
                    { "license-id": "MIT" },
                    { "license-id": "GPL-3.0" },
                    { "license-id": "Unrecognized-1.0" },
                ]
            })
            .to_string(),
        };
        let policy = LicensePolicyConfig { allow: vec!["MIT".into()], deny: vec!["GPL-3.0".into()] };
        let report = scan_licenses(&b, &sbom, &policy);
        assert_eq!(report.allowed, vec!["MIT".to_string()]);
        assert_eq!(report.denied, vec!["GPL-3.0".to_string()]);
        assert_eq!(report.unknown, vec!["Unrecognized-1.0".to_string()]);
        assert!(!report.passed);
    }

    #[test]
    fn license_scan_passes_when_nothing_denied() {
        let b = build();
        let sbom = Sbom {
            build_id: b.id.clone(),
            format: "cyclonedx-json".into(),
            version: "1".into(),
            component_count: 1,
            content_hash: "abc".into(),
            tool_name: "syft".into(),
            tool_version: "1.0".into(),
            content: serde_json::json!({ "components": [{ "license-id": "MIT" }] }).to_string(),
        };
        let report = scan_licenses(&b, &sbom, &LicensePolicyConfig::default());
        assert!(report.passed);
    }

    #[test]
    fn signing_skips_silently_when_tool_missing() {
        let config = SigningConfig { tool: Some("definitely-not-a-real-binary".into()), key_reference: None };
        let artifact = ArtifactRef { name: "bin".into(), content: b"hello" };
        let result = sign_artifact(&build(), &artifact, &config, Duration::from_millis(100)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn attestation_subjects_carry_sha256_digests() {
        let b = build();
        let artifacts = vec![ArtifactRef { name: "bin".into(), content: b"hello" }];
        let attestation = build_attestation(&b, &artifacts, &b.parameters);
        let subjects = attestation.subjects.as_array().unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0]["digest"]["sha256"], sha256_hex(b"hello"));
        assert_eq!(attestation.payload_type, "application/vnd.in-toto+json");
        assert!(!attestation.payload_b64.is_empty());
    }

    #[test]
    fn full_chain_persists_whatever_steps_are_enabled() {
        let td = tempdir().unwrap();
        let store = chengis_state::JsonStore::open(td.path().join("store.json")).unwrap();
        let b = build();
        let flags = ProvenanceFlags { sbom_generation: false, license_scanning: false, artifact_signing: false, slsa_provenance: true };
        let artifacts = vec![ArtifactRef { name: "bin".into(), content: b"hello" }];
        let outcome = run_provenance_chain(
            &store,
            &b,
            "acme",
            ".",
            &artifacts,
            flags,
            &ProvenanceConfig::default(),
            &SigningConfig::default(),
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(outcome.sbom.is_none());
        assert!(outcome.attestation.is_some());
    }
}
