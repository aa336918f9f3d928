//! Workspace manager: scoped per-build directory allocation with
//! guaranteed cleanup.
//!
//! Every build gets a private directory under the configured workspace
//! root, addressed by `(org-id, job-id, build-id)`. The handle removes its
//! directory tree on drop unless the caller explicitly [`Workspace::keep`]s
//! it, so a panicking or early-returning executor can never leak a
//! workspace directory across builds.
//!
//! Same atomic write-to-temp-then-rename discipline as the rest of this
//! workspace's persistence layers, narrowed down to the one thing the
//! executor actually needs — a private directory that always goes away.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Allocates and reclaims per-build workspace directories under a single
/// configured root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh workspace for `build_id`. If a directory already
    /// exists at that path (a leftover from a crashed prior run), it is
    /// removed first so the build starts from a clean tree.
    pub fn allocate(&self, org_id: &str, job_id: &str, build_id: &str) -> Result<Workspace> {
        let path = self.root.join(org_id).join(job_id).join(build_id);
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("failed to clear stale workspace: {}", path.display()))?;
        }
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create workspace: {}", path.display()))?;
        Ok(Workspace { path, keep: false })
    }
}

/// A single build's private directory. Removed recursively on drop unless
/// [`Workspace::keep`] was called.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    keep: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute path for a file relative to the workspace root.
    pub fn full_path(&self, relative: &str) -> PathBuf {
        self.path.join(relative)
    }

    /// Suppress the cleanup-on-drop, for callers (e.g. a `workspace inspect`
    /// CLI command) that need the directory to outlive the handle.
    pub fn keep(&mut self) {
        self.keep = true;
    }

    pub fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(relative);
        std::fs::read(&full_path).with_context(|| format!("failed to read: {}", full_path.display()))
    }

    /// Write via a temp file in the same directory followed by a rename,
    /// so a crash mid-write never leaves a partial file at `relative`.
    pub fn write(&self, relative: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(relative);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        let tmp_path = full_path.with_extension("tmp");
        std::fs::write(&tmp_path, data)
            .with_context(|| format!("failed to write: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &full_path)
            .with_context(|| format!("failed to rename into place: {}", full_path.display()))?;
        Ok(())
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.full_path(relative).exists()
    }

    /// `${WORKSPACE}` / `:workspace` substitution target for volume mounts
    /// and step working directories.
    pub fn mount_path(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_creates_scoped_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path());
        let workspace = manager.allocate("acme", "job-1", "build-1").unwrap();
        assert!(workspace.path().starts_with(tmp.path()));
        assert!(workspace.path().ends_with("acme/job-1/build-1"));
        assert!(workspace.path().exists());
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path());
        let path = {
            let workspace = manager.allocate("acme", "job-1", "build-1").unwrap();
            workspace.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn kept_workspace_survives_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path());
        let path = {
            let mut workspace = manager.allocate("acme", "job-1", "build-1").unwrap();
            workspace.keep();
            workspace.path().to_path_buf()
        };
        assert!(path.exists());
    }

    #[test]
    fn allocate_clears_stale_leftover_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path());
        let stale_path = tmp.path().join("acme").join("job-1").join("build-1");
        std::fs::create_dir_all(&stale_path).unwrap();
        std::fs::write(stale_path.join("leftover.txt"), b"old run").unwrap();

        let workspace = manager.allocate("acme", "job-1", "build-1").unwrap();
        assert!(!workspace.exists("leftover.txt"));
    }

    #[test]
    fn write_is_atomic_and_readable() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path());
        let workspace = manager.allocate("acme", "job-1", "build-1").unwrap();
        workspace.write("src/main.rs", b"fn main() {}").unwrap();
        assert_eq!(workspace.read("src/main.rs").unwrap(), b"fn main() {}");
        assert!(!workspace.full_path("src/main.tmp").exists());
    }
}
