//! Patch validation: structure, trust limits, path safety and danger analysis.
//!
//! Validation never touches the filesystem beyond existence checks, so a
//! rejected patch leaves the repository exactly as it was.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::confirmation::ConfirmationTokens;
use crate::diff::{self, FileOperation, Hunk};
use crate::glob::{compile_all, GlobMatcher};

pub const MISSING_HEADERS: &str = "Missing unified diff headers";
pub const NO_FILE_CHANGES: &str = "No file changes found in diff";

/// Upper bounds on what a single patch may do without being rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustLimits {
    pub max_files_per_patch: usize,
    pub max_lines_per_patch: usize,
    pub sensitive_path_globs: Vec<String>,
}

impl Default for TrustLimits {
    fn default() -> Self {
        Self {
            max_files_per_patch: 20,
            max_lines_per_patch: 1000,
            sensitive_path_globs: [
                "server/**",
                ".env",
                ".env.*",
                "**/.env",
                "**/.env.*",
                "package-lock.json",
                "**/package-lock.json",
                "Cargo.lock",
                "**/Cargo.lock",
                ".git/**",
                "**/*.pem",
                "**/*.key",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Why a file made the patch dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerReason {
    Delete,
    SensitivePath,
}

impl std::fmt::Display for DangerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Delete => "delete",
            Self::SensitivePath => "sensitive_path",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DangerItem {
    pub file: String,
    pub reason: DangerReason,
    /// The sensitive glob that matched, for `SensitivePath` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Outcome of validating one diff. Built fresh per call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub hunks: Vec<Hunk>,
    pub file_count: usize,
    pub line_count: usize,
    pub danger_summary: Vec<DangerItem>,
    pub requires_confirmation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_token: Option<String>,
}

impl ValidationResult {
    fn rejected(error: &str) -> Self {
        Self {
            valid: false,
            errors: vec![error.to_string()],
            ..Default::default()
        }
    }

    /// Deduplicated paths touched by the validated hunks.
    pub fn touched_paths(&self) -> Vec<String> {
        diff::touched_paths(&self.hunks)
    }
}

/// Binds a confirmation token to a task and a named diff.
#[derive(Debug, Clone, Copy)]
pub struct TokenBinding<'a> {
    pub task_id: &'a str,
    pub diff_name: &'a str,
}

impl<'a> TokenBinding<'a> {
    pub fn new(task_id: &'a str, diff_name: &'a str) -> Self {
        Self { task_id, diff_name }
    }
}

/// Validates diffs against a set of [`TrustLimits`].
pub struct PatchValidator {
    limits: TrustLimits,
    sensitive: Vec<GlobMatcher>,
    tokens: Option<Arc<ConfirmationTokens>>,
}

impl PatchValidator {
    pub fn new(limits: TrustLimits) -> Self {
        let sensitive = compile_all(&limits.sensitive_path_globs);
        Self {
            limits,
            sensitive,
            tokens: None,
        }
    }

    /// Attach a token service so dangerous patches get a confirmation token.
    pub fn with_tokens(mut self, tokens: Arc<ConfirmationTokens>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn limits(&self) -> &TrustLimits {
        &self.limits
    }

    /// Validate with the validator's default limits.
    pub fn validate(
        &self,
        diff_text: &str,
        repo_root: &Path,
        binding: Option<TokenBinding<'_>>,
    ) -> ValidationResult {
        self.run(diff_text, repo_root, &self.limits, &self.sensitive, binding)
    }

    /// Validate with per-call limits.
    pub fn validate_with_limits(
        &self,
        diff_text: &str,
        repo_root: &Path,
        limits: &TrustLimits,
        binding: Option<TokenBinding<'_>>,
    ) -> ValidationResult {
        let sensitive = compile_all(&limits.sensitive_path_globs);
        self.run(diff_text, repo_root, limits, &sensitive, binding)
    }

    fn run(
        &self,
        diff_text: &str,
        repo_root: &Path,
        limits: &TrustLimits,
        sensitive: &[GlobMatcher],
        binding: Option<TokenBinding<'_>>,
    ) -> ValidationResult {
        if diff_text.trim().is_empty() || !(diff_text.contains("---") && diff_text.contains("+++"))
        {
            return ValidationResult::rejected(MISSING_HEADERS);
        }

        let hunks = diff::parse_unified_diff(diff_text);
        if hunks.is_empty() {
            return ValidationResult::rejected(NO_FILE_CHANGES);
        }

        let mut result = ValidationResult {
            file_count: hunks.len(),
            line_count: hunks.iter().map(|h| h.line_count).sum(),
            ..Default::default()
        };

        if result.file_count > limits.max_files_per_patch {
            result.errors.push(format!(
                "Too many files in patch: {} (max {})",
                result.file_count, limits.max_files_per_patch
            ));
        }
        if result.line_count > limits.max_lines_per_patch {
            result.errors.push(format!(
                "Too many changed lines in patch: {} (max {})",
                result.line_count, limits.max_lines_per_patch
            ));
        }

        for hunk in &hunks {
            check_hunk(hunk, repo_root, &mut result);
        }

        for path in diff::touched_paths(&hunks) {
            if diff::is_unsafe_path(&path) {
                continue;
            }
            if let Some(glob) = sensitive.iter().find(|g| g.is_match(&path)) {
                result.danger_summary.push(DangerItem {
                    file: path,
                    reason: DangerReason::SensitivePath,
                    pattern: Some(glob.glob().to_string()),
                });
            }
        }

        result.hunks = hunks;
        result.valid = result.errors.is_empty();
        result.requires_confirmation = !result.danger_summary.is_empty();

        if result.requires_confirmation {
            if let (Some(tokens), Some(binding)) = (self.tokens.as_ref(), binding) {
                match tokens.generate(binding.task_id, binding.diff_name) {
                    Ok(token) => result.confirmation_token = Some(token),
                    Err(e) => result
                        .warnings
                        .push(format!("Could not issue confirmation token: {e}")),
                }
            }
        }

        if result.valid {
            debug!(
                files = result.file_count,
                lines = result.line_count,
                dangers = result.danger_summary.len(),
                "Patch validated"
            );
        } else {
            info!(errors = ?result.errors, "Patch rejected");
        }
        result
    }
}

impl Default for PatchValidator {
    fn default() -> Self {
        Self::new(TrustLimits::default())
    }
}

fn check_hunk(hunk: &Hunk, repo_root: &Path, result: &mut ValidationResult) {
    match hunk.operation {
        FileOperation::Create => {
            let Some(path) = hunk.new_path.as_deref() else {
                return;
            };
            if diff::is_unsafe_path(path) {
                result.errors.push(traversal(path));
            } else if repo_root.join(path).exists() {
                warn!(path, "Create targets an existing file");
                result
                    .warnings
                    .push(format!("File already exists and will be overwritten: {path}"));
            }
        }
        FileOperation::Delete => {
            let Some(path) = hunk.old_path.as_deref() else {
                return;
            };
            if diff::is_unsafe_path(path) {
                result.errors.push(traversal(path));
                return;
            }
            if !repo_root.join(path).exists() {
                result
                    .errors
                    .push(format!("Cannot delete non-existent file: {path}"));
            }
            result.danger_summary.push(DangerItem {
                file: path.to_string(),
                reason: DangerReason::Delete,
                pattern: None,
            });
        }
        FileOperation::Modify => {
            let old = hunk.old_path.as_deref().unwrap_or_default();
            let new = hunk.new_path.as_deref().unwrap_or_default();
            if diff::is_unsafe_path(old) || diff::is_unsafe_path(new) {
                let offending = if diff::is_unsafe_path(old) { old } else { new };
                result.errors.push(traversal(offending));
                return;
            }
            if !repo_root.join(old).exists() {
                result
                    .errors
                    .push(format!("Cannot modify non-existent file: {old}"));
            }
        }
    }
}

fn traversal(path: &str) -> String {
    format!("Path traversal detected: {path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::ConfirmationTokens;

    fn repo_with(files: &[&str]) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        for f in files {
            let p = tmp.path().join(f);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, "content\n").unwrap();
        }
        tmp
    }

    fn modify(path: &str) -> String {
        format!("--- a/{path}\n+++ b/{path}\n@@ -1 +1 @@\n-content\n+changed\n")
    }

    #[test]
    fn test_empty_and_garbage_rejected() {
        let repo = repo_with(&[]);
        let v = PatchValidator::default();
        for input in ["", "   \n", "not a diff"] {
            let r = v.validate(input, repo.path(), None);
            assert!(!r.valid);
            assert_eq!(r.errors, vec![MISSING_HEADERS.to_string()]);
            assert!(r.hunks.is_empty());
        }
    }

    #[test]
    fn test_markers_without_header_pair() {
        let repo = repo_with(&[]);
        let r = PatchValidator::default().validate("--- x\nsomething\n+++ y\n", repo.path(), None);
        assert!(!r.valid);
        assert_eq!(r.errors, vec![NO_FILE_CHANGES.to_string()]);
    }

    #[test]
    fn test_clean_modify_is_valid() {
        let repo = repo_with(&["src/app.ts"]);
        let r = PatchValidator::default().validate(&modify("src/app.ts"), repo.path(), None);
        assert!(r.valid, "{:?}", r.errors);
        assert_eq!(r.file_count, 1);
        assert_eq!(r.line_count, 2);
        assert!(!r.requires_confirmation);
        assert!(r.danger_summary.is_empty());
    }

    #[test]
    fn test_traversal_rejected() {
        let repo = repo_with(&[]);
        let diff = "--- /dev/null\n+++ b/../outside.txt\n@@ -0,0 +1 @@\n+x\n";
        let r = PatchValidator::default().validate(diff, repo.path(), None);
        assert!(!r.valid);
        assert!(r.errors.iter().any(|e| e.contains("Path traversal")));
    }

    #[test]
    fn test_modify_missing_file_rejected() {
        let repo = repo_with(&[]);
        let r = PatchValidator::default().validate(&modify("ghost.rs"), repo.path(), None);
        assert!(!r.valid);
        assert!(r.errors[0].contains("non-existent"));
    }

    #[test]
    fn test_create_over_existing_warns() {
        let repo = repo_with(&["README.md"]);
        let diff = "--- /dev/null\n+++ b/README.md\n@@ -0,0 +1 @@\n+x\n";
        let r = PatchValidator::default().validate(diff, repo.path(), None);
        assert!(r.valid);
        assert_eq!(r.warnings.len(), 1);
    }

    #[test]
    fn test_sensitive_delete_requires_confirmation() {
        let repo = repo_with(&["server/config.ts"]);
        let diff = "--- a/server/config.ts\n+++ /dev/null\n@@ -1 +0,0 @@\n-content\n";
        let tokens = Arc::new(ConfirmationTokens::new(b"k".to_vec()));
        let v = PatchValidator::default().with_tokens(tokens.clone());

        let r = v.validate(diff, repo.path(), Some(TokenBinding::new("task-1", "step-2-implement")));
        assert!(r.valid, "{:?}", r.errors);
        assert!(r.requires_confirmation);
        assert_eq!(r.danger_summary.len(), 2);
        assert_eq!(r.danger_summary[0].reason, DangerReason::Delete);
        assert_eq!(r.danger_summary[1].reason, DangerReason::SensitivePath);
        assert_eq!(r.danger_summary[1].pattern.as_deref(), Some("server/**"));

        let token = r.confirmation_token.expect("token minted");
        assert!(tokens.validate(&token, "task-1", "step-2-implement"));
    }

    #[test]
    fn test_no_token_without_binding() {
        let repo = repo_with(&[".env"]);
        let v = PatchValidator::default()
            .with_tokens(Arc::new(ConfirmationTokens::with_random_secret()));
        let r = v.validate(&modify(".env"), repo.path(), None);
        assert!(r.requires_confirmation);
        assert!(r.confirmation_token.is_none());
    }

    #[test]
    fn test_limits_enforced_per_call() {
        let repo = repo_with(&["a.txt", "b.txt"]);
        let diff = format!("{}{}", modify("a.txt"), modify("b.txt"));
        let limits = TrustLimits {
            max_files_per_patch: 1,
            max_lines_per_patch: 3,
            sensitive_path_globs: vec![],
        };
        let r = PatchValidator::default().validate_with_limits(&diff, repo.path(), &limits, None);
        assert!(!r.valid);
        assert_eq!(r.errors.len(), 2);
        assert_eq!(r.file_count, 2);
        assert_eq!(r.line_count, 4);
    }

    #[test]
    fn test_first_matching_glob_wins() {
        let repo = repo_with(&["Cargo.lock"]);
        let r = PatchValidator::default().validate(&modify("Cargo.lock"), repo.path(), None);
        let items: Vec<_> = r
            .danger_summary
            .iter()
            .filter(|d| d.reason == DangerReason::SensitivePath)
            .collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].pattern.as_deref(), Some("Cargo.lock"));
    }
}
