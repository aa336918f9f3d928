//! Immutable per-job artifact cache: `(job-id, resolved-key) -> directory`.
//! Save is a no-op once an entry exists; restore copies the cached
//! directory back into the workspace, or reports a miss.

use std::path::Path;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: std::path::PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_dir(&self, job_id: &str, resolved_key: &str) -> std::path::PathBuf {
        self.root.join(job_id).join(resolved_key)
    }

    pub fn contains(&self, job_id: &str, resolved_key: &str) -> bool {
        self.entry_dir(job_id, resolved_key).exists()
    }

    /// Copy `source` into the cache under `(job_id, resolved_key)`. Returns
    /// `false` without touching the filesystem if the entry already
    /// exists — the cache is immutable, so the first writer wins.
    pub fn save(&self, job_id: &str, resolved_key: &str, source: &Path) -> Result<bool> {
        let dest = self.entry_dir(job_id, resolved_key);
        if dest.exists() {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        copy_recursive(source, &dest)?;
        Ok(true)
    }

    /// Copy the cached directory back into `dest`. Returns `false` (a
    /// cache miss) if no entry exists for `(job_id, resolved_key)`.
    pub fn restore(&self, job_id: &str, resolved_key: &str, dest: &Path) -> Result<bool> {
        let src = self.entry_dir(job_id, resolved_key);
        if !src.exists() {
            return Ok(false);
        }
        copy_recursive(&src, dest)?;
        Ok(true)
    }
}

fn copy_recursive(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dest).with_context(|| format!("failed to copy {} to {}", src.display(), dest.display()))?;
    }
    Ok(())
}
