//! Git context capture for the build execution engine.
//!
//! Triggers carry a `git-commit`/`git-branch`, but webhook payloads don't
//! always carry everything the data model wants (§3's `Build.git-author`,
//! `git-message`); when a workspace has already been checked out (§4.C),
//! this crate fills the rest in by shelling out to `git`.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Everything about a checked-out workspace that ends up on a `Build` row
/// or in a provenance attestation's source fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitContext {
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub author: Option<String>,
    pub message: Option<String>,
    pub dirty: Option<bool>,
}

impl GitContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_commit(&self) -> bool {
        self.commit.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.unwrap_or(true)
    }

    /// `Build.git-commit-short`: first 7 hex characters.
    pub fn short_commit(&self) -> Option<&str> {
        self.commit.as_ref().map(|c| if c.len() > 7 { &c[..7] } else { c.as_str() })
    }
}

fn run_git(path: &Path, args: &[&str]) -> Result<Option<String>> {
    let output = Command::new("git")
        .args(args)
        .current_dir(path)
        .output()
        .with_context(|| format!("failed to run git {args:?}"))?;
    if !output.status.success() {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(if text.is_empty() { None } else { Some(text) })
}

pub fn is_git_repo(path: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(path)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn is_git_clean(path: &Path) -> Result<bool> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(path)
        .output()
        .context("failed to run git status")?;
    if !output.status.success() {
        return Err(anyhow!("git status failed: {}", String::from_utf8_lossy(&output.stderr)));
    }
    Ok(output.stdout.is_empty())
}

pub fn get_commit_hash(path: &Path) -> Result<String> {
    run_git(path, &["rev-parse", "HEAD"])?.ok_or_else(|| anyhow!("not a git repository with a commit"))
}

pub fn get_branch(path: &Path) -> Result<Option<String>> {
    let branch = run_git(path, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(branch.filter(|b| b != "HEAD"))
}

pub fn get_author(path: &Path) -> Result<Option<String>> {
    run_git(path, &["log", "-1", "--pretty=format:%an"])
}

pub fn get_message(path: &Path) -> Result<Option<String>> {
    run_git(path, &["log", "-1", "--pretty=format:%s"])
}

pub fn get_remote_url(path: &Path, remote: &str) -> Result<Option<String>> {
    run_git(path, &["remote", "get-url", remote])
}

pub fn get_changed_files(path: &Path) -> Result<Vec<String>> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(path)
        .output()
        .context("failed to run git status")?;
    if !output.status.success() {
        return Err(anyhow!("git status failed: {}", String::from_utf8_lossy(&output.stderr)));
    }
    let status = String::from_utf8_lossy(&output.stdout);
    Ok(status.lines().map(|line| line.chars().skip(3).collect()).collect())
}

/// Capture everything available from a checked-out workspace in one pass.
/// Missing git data (detached HEAD, shallow clone without log access) is
/// left `None` rather than failing the capture.
pub fn get_git_context(path: &Path) -> GitContext {
    GitContext {
        commit: get_commit_hash(path).ok(),
        branch: get_branch(path).ok().flatten(),
        author: get_author(path).ok().flatten(),
        message: get_message(path).ok().flatten(),
        dirty: is_git_clean(path).ok().map(|clean| !clean),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    fn init_git_repo(dir: &Path) {
        Command::new("git").args(["init"]).current_dir(dir).output().expect("git init");
        Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(dir)
            .output()
            .expect("git config");
        Command::new("git")
            .args(["config", "user.name", "Test User"])
            .current_dir(dir)
            .output()
            .expect("git config");
    }

    fn make_commit(dir: &Path, msg: &str) {
        Command::new("git")
            .args(["commit", "--allow-empty", "-m", msg])
            .current_dir(dir)
            .output()
            .expect("git commit");
    }

    #[test]
    fn is_git_repo_detects_repo() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        assert!(is_git_repo(td.path()));
    }

    #[test]
    fn is_git_repo_returns_false_for_non_repo() {
        let td = tempdir().expect("tempdir");
        assert!(!is_git_repo(td.path()));
    }

    #[test]
    fn get_git_context_populates_commit_author_and_message() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        make_commit(td.path(), "initial commit");

        let context = get_git_context(td.path());
        assert!(context.has_commit());
        assert!(!context.is_dirty());
        assert_eq!(context.message.as_deref(), Some("initial commit"));
        assert_eq!(context.author.as_deref(), Some("Test User"));
        assert!(context.short_commit().is_some());
    }

    #[test]
    fn short_commit_truncates_to_seven_chars() {
        let mut context = GitContext::new();
        context.commit = Some("0123456789abcdef0123456789abcdef01234567".to_string());
        assert_eq!(context.short_commit(), Some("0123456"));
    }

    #[test]
    fn get_remote_url_none_when_no_remote() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        assert!(get_remote_url(td.path(), "origin").expect("remote url").is_none());
    }

    #[test]
    fn get_changed_files_empty_on_clean_tree() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        make_commit(td.path(), "test");
        assert!(get_changed_files(td.path()).expect("changed files").is_empty());
    }
}
