//! SCM subsystem (§4.M): provider detection from a repo URL, build-status
//! reporting, and auto-merge dispatch for GitHub/GitLab/Bitbucket/Gitea.
//!
//! Grounded in `chengis-auth`'s credential resolution (same provider-name
//! keying into `config.scm.<provider>`) and uses the same blocking
//! `reqwest::Client` pattern as the rest of this workspace's outbound HTTP
//! calls.

use anyhow::{Context, Result};
use chengis_auth::resolve_credential;
use chengis_config::ScmConfig;
use chengis_types::BuildStatus;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScmProvider {
    GitHub,
    GitLab,
    Bitbucket,
    Gitea,
}

impl ScmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            ScmProvider::GitHub => "github",
            ScmProvider::GitLab => "gitlab",
            ScmProvider::Bitbucket => "bitbucket",
            ScmProvider::Gitea => "gitea",
        }
    }
}

/// Host portion of an HTTPS or SSH repo url, lower-cased. `None` if the
/// url doesn't parse as either form.
fn extract_host(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("git@") {
        return rest.split(':').next().map(|h| h.to_lowercase());
    }
    let after_scheme = url.split("://").nth(1)?;
    after_scheme.split('/').next().map(|h| h.to_lowercase())
}

/// `owner/repo` portion of an HTTPS or SSH repo url, `.git` suffix
/// stripped.
fn owner_repo(url: &str) -> Option<(String, String)> {
    let path = if let Some(rest) = url.strip_prefix("git@") {
        rest.splitn(2, ':').nth(1)?.to_string()
    } else {
        url.split("://").nth(1)?.splitn(2, '/').nth(1)?.to_string()
    };
    let path = path.trim_end_matches('/').trim_end_matches(".git");
    let (owner, repo) = path.split_once('/')?;
    Some((owner.to_string(), repo.to_string()))
}

/// Detect the provider hosting `repo_url`. Exact host match only —
/// a look-alike host (`evil-github.com`) never matches `github.com`. A
/// `gitea_base_url` configured host is checked last since it's the only
/// provider without a fixed public hostname. `None` (no-op) for an absent
/// or unrecognized url.
pub fn detect_provider(repo_url: Option<&str>, gitea_base_url: Option<&str>) -> Option<ScmProvider> {
    let host = extract_host(repo_url?)?;
    match host.as_str() {
        "github.com" => Some(ScmProvider::GitHub),
        "gitlab.com" => Some(ScmProvider::GitLab),
        "bitbucket.org" => Some(ScmProvider::Bitbucket),
        _ => {
            let gitea_host = extract_host(gitea_base_url?)?;
            (host == gitea_host).then_some(ScmProvider::Gitea)
        }
    }
}

/// Everything [`report_status`] needs about a build, kept separate from
/// [`chengis_types::Build`] since repo url lives on the pipeline's
/// `SourceDef`, not on the build row itself.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub repo_url: Option<String>,
    pub commit_sha: Option<String>,
    pub gitea_base_url: Option<String>,
}

fn status_request(provider: ScmProvider, owner: &str, repo: &str, sha: &str, status: BuildStatus, description: &str, base_url: Option<&str>) -> (String, Value) {
    match provider {
        ScmProvider::GitHub => (
            format!("https://api.github.com/repos/{owner}/{repo}/statuses/{sha}"),
            json!({ "state": github_state(status), "description": description, "context": "chengis" }),
        ),
        ScmProvider::GitLab => (
            format!("https://gitlab.com/api/v4/projects/{}/statuses/{sha}", encode_path(&format!("{owner}/{repo}"))),
            json!({ "state": gitlab_state(status), "description": description, "name": "chengis" }),
        ),
        ScmProvider::Bitbucket => (
            format!("https://api.bitbucket.org/2.0/repositories/{owner}/{repo}/commit/{sha}/statuses/build"),
            json!({ "state": bitbucket_state(status), "key": "chengis", "description": description }),
        ),
        ScmProvider::Gitea => (
            format!("{}/repos/{owner}/{repo}/statuses/{sha}", base_url.unwrap_or_default().trim_end_matches('/')),
            json!({ "state": github_state(status), "description": description, "context": "chengis" }),
        ),
    }
}

fn github_state(status: BuildStatus) -> &'static str {
    match status.to_scm_status() {
        chengis_types::ScmStatus::Success => "success",
        chengis_types::ScmStatus::Failure => "failure",
        chengis_types::ScmStatus::Error => "error",
        chengis_types::ScmStatus::Pending => "pending",
    }
}

fn gitlab_state(status: BuildStatus) -> &'static str {
    match status.to_scm_status() {
        chengis_types::ScmStatus::Success => "success",
        chengis_types::ScmStatus::Failure => "failed",
        chengis_types::ScmStatus::Error => "canceled",
        chengis_types::ScmStatus::Pending => "pending",
    }
}

fn bitbucket_state(status: BuildStatus) -> &'static str {
    match status.to_scm_status() {
        chengis_types::ScmStatus::Success => "SUCCESSFUL",
        chengis_types::ScmStatus::Failure => "FAILED",
        chengis_types::ScmStatus::Error => "STOPPED",
        chengis_types::ScmStatus::Pending => "INPROGRESS",
    }
}

fn encode_path(path: &str) -> String {
    url::form_urlencoded::byte_serialize(path.as_bytes()).collect()
}

/// `report!(build-info, status, desc)`. Skipped — silently, not an error —
/// if no `commit-sha`, no `repo-url`, or no reporter (credential) is
/// registered for the detected provider.
pub fn report_status(client: &reqwest::blocking::Client, scm: &ScmConfig, build: &BuildContext, status: BuildStatus, description: &str) -> Result<()> {
    let (Some(repo_url), Some(commit_sha)) = (&build.repo_url, &build.commit_sha) else {
        return Ok(());
    };
    let Some(provider) = detect_provider(Some(repo_url), build.gitea_base_url.as_deref()) else {
        return Ok(());
    };
    let Some(credential) = resolve_credential(scm, provider.as_str()) else {
        return Ok(());
    };
    let Some((owner, repo)) = owner_repo(repo_url) else {
        return Ok(());
    };

    let (url, body) = status_request(provider, &owner, &repo, commit_sha, status, description, build.gitea_base_url.as_deref());
    let response = client
        .post(&url)
        .header("Authorization", credential.authorization_header())
        .json(&body)
        .send()
        .context("failed to send scm status request")?;

    if !response.status().is_success() {
        anyhow::bail!("scm status report to {provider_name} failed with status {code}", provider_name = provider.as_str(), code = response.status());
    }
    Ok(())
}

/// One PR/MR required check and its outcome, as `is_ready_for_merge` needs
/// to see it.
#[derive(Debug, Clone)]
pub struct PrStatusCheck {
    pub name: String,
    pub required: bool,
    pub status: BuildStatus,
}

/// Every `required` check must have succeeded for the build; non-required
/// checks never block.
pub fn is_ready_for_merge(checks: &[PrStatusCheck]) -> bool {
    checks.iter().filter(|c| c.required).all(|c| c.status == BuildStatus::Success)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    Failed,
    NotReady,
}

fn bitbucket_merge_strategy(merge_method: &str) -> &str {
    if merge_method == "rebase" { "fast_forward" } else { merge_method }
}

fn merge_request(provider: ScmProvider, owner: &str, repo: &str, pr_number: u64, merge_method: &str, delete_branch_after: bool, base_url: Option<&str>) -> (reqwest::Method, String, Value) {
    match provider {
        ScmProvider::GitHub => (
            reqwest::Method::PUT,
            format!("https://api.github.com/repos/{owner}/{repo}/pulls/{pr_number}/merge"),
            json!({ "merge_method": merge_method }),
        ),
        ScmProvider::GitLab => (
            reqwest::Method::PUT,
            format!("https://gitlab.com/api/v4/projects/{}/merge_requests/{pr_number}/merge", encode_path(&format!("{owner}/{repo}"))),
            json!({ "squash": merge_method == "squash", "should_remove_source_branch": delete_branch_after }),
        ),
        ScmProvider::Bitbucket => (
            reqwest::Method::POST,
            format!("https://api.bitbucket.org/2.0/repositories/{owner}/{repo}/pullrequests/{pr_number}/merge"),
            json!({ "merge_strategy": bitbucket_merge_strategy(merge_method) }),
        ),
        ScmProvider::Gitea => (
            reqwest::Method::POST,
            format!("{}/repos/{owner}/{repo}/pulls/{pr_number}/merge", base_url.unwrap_or_default().trim_end_matches('/')),
            json!({ "Do": merge_method }),
        ),
    }
}

fn delete_branch_request(provider: ScmProvider, owner: &str, repo: &str, branch: &str, base_url: Option<&str>) -> (String,) {
    let url = match provider {
        ScmProvider::GitHub => format!("https://api.github.com/repos/{owner}/{repo}/git/refs/heads/{branch}"),
        ScmProvider::GitLab => format!("https://gitlab.com/api/v4/projects/{}/repository/branches/{branch}", encode_path(&format!("{owner}/{repo}"))),
        ScmProvider::Bitbucket => format!("https://api.bitbucket.org/2.0/repositories/{owner}/{repo}/refs/branches/{branch}"),
        ScmProvider::Gitea => format!("{}/repos/{owner}/{repo}/branches/{branch}", base_url.unwrap_or_default().trim_end_matches('/')),
    };
    (url,)
}

/// `execute-auto-merge!`: dispatches the provider-specific merge call once
/// `pr_status_checks_enabled` (if set) confirms every required check
/// succeeded. HTTP result rule is uniform across providers: status `< 300`
/// ⇒ merged, `>= 300` ⇒ failed. Branch deletion failure is logged by the
/// caller (via the `Result` this returns) and never escalated to a merge
/// failure — the merge has already happened by the time deletion runs.
#[allow(clippy::too_many_arguments)]
pub fn auto_merge(
    client: &reqwest::blocking::Client,
    scm: &ScmConfig,
    build: &BuildContext,
    pr_number: u64,
    merge_method: &str,
    checks: &[PrStatusCheck],
    pr_status_checks_enabled: bool,
    delete_branch_after: bool,
    branch: Option<&str>,
) -> Result<(MergeOutcome, Option<Result<()>>)> {
    if pr_status_checks_enabled && !is_ready_for_merge(checks) {
        return Ok((MergeOutcome::NotReady, None));
    }
    let Some(repo_url) = &build.repo_url else {
        return Ok((MergeOutcome::NotReady, None));
    };
    let Some(provider) = detect_provider(Some(repo_url), build.gitea_base_url.as_deref()) else {
        return Ok((MergeOutcome::NotReady, None));
    };
    let Some(credential) = resolve_credential(scm, provider.as_str()) else {
        return Ok((MergeOutcome::NotReady, None));
    };
    let Some((owner, repo)) = owner_repo(repo_url) else {
        return Ok((MergeOutcome::NotReady, None));
    };

    let (method, url, body) = merge_request(provider, &owner, &repo, pr_number, merge_method, delete_branch_after, build.gitea_base_url.as_deref());
    let response = client
        .request(method, &url)
        .header("Authorization", credential.authorization_header())
        .json(&body)
        .send()
        .context("failed to send auto-merge request")?;

    let outcome = if response.status().as_u16() < 300 { MergeOutcome::Merged } else { MergeOutcome::Failed };

    if outcome != MergeOutcome::Merged || !delete_branch_after {
        return Ok((outcome, None));
    }
    let Some(branch) = branch else {
        return Ok((outcome, None));
    };

    let (delete_url,) = delete_branch_request(provider, &owner, &repo, branch, build.gitea_base_url.as_deref());
    let delete_result = client
        .delete(&delete_url)
        .header("Authorization", credential.authorization_header())
        .send()
        .context("failed to send branch-delete request")
        .and_then(|r| if r.status().is_success() { Ok(()) } else { anyhow::bail!("branch delete failed with status {}", r.status()) });

    Ok((outcome, Some(delete_result)))
}
