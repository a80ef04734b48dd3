//! Two-phase `git apply`.
//!
//! The diff is written to a scratch file inside the repository, dry-run with
//! `git apply --check`, and only then applied for real. The scratch file is
//! removed on every exit path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::diff::{self, is_unsafe_path};
use crate::process::{combined_output, run_with_timeout, truncate_output};

const MAX_ERROR_CHARS: usize = 4000;

/// Result of an apply attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub modified_files: Vec<String>,
}

impl ApplyReport {
    fn failed(error: impl Into<String>, modified_files: Vec<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            modified_files,
        }
    }
}

/// Applies unified diffs to a git working tree.
#[derive(Debug, Clone)]
pub struct DiffApplier {
    git_timeout: Duration,
}

impl Default for DiffApplier {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl DiffApplier {
    pub fn new(git_timeout: Duration) -> Self {
        Self { git_timeout }
    }

    /// Apply `diff_text` to the repository at `repo_path`.
    pub async fn apply(&self, diff_text: &str, repo_path: &Path) -> ApplyReport {
        let hunks = diff::parse_unified_diff(diff_text);
        if hunks.is_empty() {
            return ApplyReport::failed("No file changes found in diff", Vec::new());
        }
        let modified_files = diff::touched_paths(&hunks);
        if let Some(bad) = modified_files.iter().find(|p| is_unsafe_path(p)) {
            warn!(path = %bad, "Refusing to apply diff with unsafe path");
            return ApplyReport::failed(format!("Path traversal detected: {bad}"), modified_files);
        }

        let scratch = scratch_path(repo_path);
        let mut body = diff_text.to_string();
        if !body.ends_with('\n') {
            body.push('\n');
        }
        if let Err(e) = tokio::fs::write(&scratch, body).await {
            return ApplyReport::failed(format!("Could not write patch file: {e}"), modified_files);
        }

        let report = self.check_then_apply(&scratch, repo_path, modified_files).await;

        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            warn!(path = %scratch.display(), error = %e, "Could not remove scratch patch file");
        }
        report
    }

    async fn check_then_apply(
        &self,
        scratch: &Path,
        repo_path: &Path,
        modified_files: Vec<String>,
    ) -> ApplyReport {
        if let Err(message) = self.git_apply(scratch, repo_path, true).await {
            info!(files = modified_files.len(), "git apply --check rejected patch");
            return ApplyReport::failed(format!("Patch check failed: {message}"), modified_files);
        }
        if let Err(message) = self.git_apply(scratch, repo_path, false).await {
            warn!("git apply failed after a successful check");
            return ApplyReport::failed(format!("Patch apply failed: {message}"), modified_files);
        }

        info!(files = ?modified_files, "Patch applied");
        ApplyReport {
            success: true,
            error: None,
            modified_files,
        }
    }

    async fn git_apply(&self, scratch: &Path, repo_path: &Path, check: bool) -> Result<(), String> {
        let mut cmd = tokio::process::Command::new("git");
        cmd.arg("apply");
        if check {
            cmd.arg("--check");
        }
        // The command runs inside the repository, so the bare file name resolves.
        cmd.arg("--whitespace=nowarn")
            .arg(scratch.file_name().unwrap_or(scratch.as_os_str()));

        let output = run_with_timeout(&mut cmd, repo_path, self.git_timeout)
            .await
            .map_err(|e| e.to_string())?;
        debug!(check, status = ?output.status.code(), "git apply finished");

        if output.status.success() {
            Ok(())
        } else {
            let text = combined_output(&output);
            let text = if text.trim().is_empty() {
                format!("git apply exited with {:?}", output.status.code())
            } else {
                text
            };
            Err(truncate_output(&text, MAX_ERROR_CHARS))
        }
    }
}

fn scratch_path(repo_path: &Path) -> PathBuf {
    repo_path.join(format!(".autopatch-{}.patch", uuid::Uuid::new_v4()))
}
