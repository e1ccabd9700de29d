//! Diff collaborators: which files changed between two commits.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::error::ScanError;

#[async_trait]
pub trait DiffProvider: Send + Sync {
    /// Paths changed between `from` and `to`. An error means "unknown", and
    /// callers must not treat it as "nothing changed".
    async fn changed_files(&self, from: &str, to: &str) -> Result<BTreeSet<String>, ScanError>;
}

/// `git diff --name-only` in a local checkout
pub struct GitDiff {
    repo_dir: PathBuf,
}

impl GitDiff {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }
}

#[async_trait]
impl DiffProvider for GitDiff {
    async fn changed_files(&self, from: &str, to: &str) -> Result<BTreeSet<String>, ScanError> {
        let unavailable = |reason: String| ScanError::DiffUnavailable {
            from: from.to_string(),
            to: to.to_string(),
            reason,
        };

        // Refuse anything git could read as an option
        if from.starts_with('-') || to.starts_with('-') {
            return Err(unavailable("commit refs must not start with '-'".to_string()));
        }

        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_dir)
            .args(["diff", "--name-only", from, to, "--"])
            .output()
            .await
            .map_err(|e| unavailable(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(unavailable(stderr.trim().to_string()));
        }

        let files: BTreeSet<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        debug!("git diff {}..{}: {} file(s)", from, to, files.len());
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_outside_a_repository_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let diff = GitDiff::new(dir.path());

        let result = diff.changed_files("HEAD~1", "HEAD").await;
        assert!(matches!(result, Err(ScanError::DiffUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_option_like_refs_are_refused() {
        let dir = TempDir::new().unwrap();
        let diff = GitDiff::new(dir.path());

        let result = diff.changed_files("--output=/tmp/x", "HEAD").await;
        assert!(matches!(result, Err(ScanError::DiffUnavailable { .. })));
    }
}
