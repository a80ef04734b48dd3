//! Workflow configuration.
//!
//! Precedence, lowest to highest: built-in defaults, an optional TOML file,
//! then `AUTOPATCH_*` environment variables.
//!
//! ```toml
//! project_root = "/srv/projects"
//! test_command = "npm test"
//! max_fix_attempts = 3
//!
//! [model]
//! url = "http://localhost:8080/v1"
//! name = "qwen2.5-coder-32b"
//!
//! [limits]
//! max_files_per_patch = 20
//! max_lines_per_patch = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use patchgate::TrustLimits;
use serde::{Deserialize, Serialize};

use crate::errors::WorkflowError;

/// Test runs allowed per workflow (the first run plus fixes).
pub const MAX_FIX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub url: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/v1".into(),
            name: "default".into(),
            api_key: None,
            timeout_secs: 300,
            max_tokens: 4096,
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub model: ModelConfig,
    /// Every repository a run touches must live under this directory.
    pub project_root: PathBuf,
    /// Where snapshots are written; kept outside the repositories.
    pub backup_dir: PathBuf,
    /// Where run records are written.
    pub runs_dir: PathBuf,
    pub test_command: String,
    pub test_timeout_secs: u64,
    pub git_timeout_secs: u64,
    pub max_fix_attempts: u32,
    pub max_test_output_chars: usize,
    /// Signing key for confirmation tokens; random per process when unset.
    #[serde(skip_serializing)]
    pub token_secret: Option<String>,
    pub limits: TrustLimits,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        let data = std::env::temp_dir().join("autopatch");
        Self {
            model: ModelConfig::default(),
            project_root: PathBuf::from("."),
            backup_dir: data.join("backups"),
            runs_dir: data.join("runs"),
            test_command: "npm test".into(),
            test_timeout_secs: 600,
            git_timeout_secs: 60,
            max_fix_attempts: MAX_FIX_ATTEMPTS,
            max_test_output_chars: patchgate::test_runner::DEFAULT_MAX_OUTPUT_CHARS,
            token_secret: None,
            limits: TrustLimits::default(),
        }
    }
}

impl WorkflowConfig {
    /// Defaults, then `path` (if given), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, WorkflowError> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, WorkflowError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WorkflowError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, WorkflowError> {
        toml::from_str(content).map_err(|e| WorkflowError::Configuration(e.to_string()))
    }

    /// Override fields from `AUTOPATCH_*` variables looked up through `var`.
    pub fn apply_env(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), WorkflowError> {
        if let Some(v) = var("AUTOPATCH_MODEL_URL") {
            self.model.url = v;
        }
        if let Some(v) = var("AUTOPATCH_MODEL") {
            self.model.name = v;
        }
        if let Some(v) = var("AUTOPATCH_API_KEY") {
            self.model.api_key = Some(v);
        }
        if let Some(v) = var("AUTOPATCH_MODEL_TIMEOUT_SECS") {
            self.model.timeout_secs = parse_num("AUTOPATCH_MODEL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("AUTOPATCH_PROJECT_ROOT") {
            self.project_root = PathBuf::from(v);
        }
        if let Some(v) = var("AUTOPATCH_BACKUP_DIR") {
            self.backup_dir = PathBuf::from(v);
        }
        if let Some(v) = var("AUTOPATCH_RUNS_DIR") {
            self.runs_dir = PathBuf::from(v);
        }
        if let Some(v) = var("AUTOPATCH_TEST_COMMAND") {
            self.test_command = v;
        }
        if let Some(v) = var("AUTOPATCH_TEST_TIMEOUT_SECS") {
            self.test_timeout_secs = parse_num("AUTOPATCH_TEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("AUTOPATCH_GIT_TIMEOUT_SECS") {
            self.git_timeout_secs = parse_num("AUTOPATCH_GIT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("AUTOPATCH_MAX_FIX_ATTEMPTS") {
            self.max_fix_attempts = parse_num("AUTOPATCH_MAX_FIX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("AUTOPATCH_MAX_FILES") {
            self.limits.max_files_per_patch = parse_num("AUTOPATCH_MAX_FILES", &v)?;
        }
        if let Some(v) = var("AUTOPATCH_MAX_LINES") {
            self.limits.max_lines_per_patch = parse_num("AUTOPATCH_MAX_LINES", &v)?;
        }
        if let Some(v) = var("AUTOPATCH_TOKEN_SECRET") {
            self.token_secret = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.max_fix_attempts == 0 {
            return Err(WorkflowError::Configuration(
                "max_fix_attempts must be at least 1".into(),
            ));
        }
        if self.test_command.trim().is_empty() {
            return Err(WorkflowError::Configuration("test_command is empty".into()));
        }
        if self.model.url.trim().is_empty() {
            return Err(WorkflowError::Configuration("model.url is empty".into()));
        }
        Ok(())
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model.timeout_secs)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, WorkflowError> {
    value
        .trim()
        .parse()
        .map_err(|_| WorkflowError::Configuration(format!("{key} is not a number: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkflowConfig::default();
        assert_eq!(config.max_fix_attempts, MAX_FIX_ATTEMPTS);
        assert_eq!(config.limits.max_files_per_patch, 20);
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = WorkflowConfig::from_toml_str(
            r#"
            test_command = "cargo test"
            max_fix_attempts = 5

            [model]
            url = "http://gpu:8000/v1"

            [limits]
            max_files_per_patch = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.test_command, "cargo test");
        assert_eq!(config.max_fix_attempts, 5);
        assert_eq!(config.model.url, "http://gpu:8000/v1");
        assert_eq!(config.model.name, "default");
        assert_eq!(config.limits.max_files_per_patch, 3);
        assert_eq!(config.limits.max_lines_per_patch, 1000);
        assert!(!config.limits.sensitive_path_globs.is_empty());
    }

    #[test]
    fn test_env_overrides_toml() {
        let mut config = WorkflowConfig::from_toml_str("test_command = \"make test\"").unwrap();
        let env: HashMap<&str, &str> = [
            ("AUTOPATCH_TEST_COMMAND", "pytest -q"),
            ("AUTOPATCH_MAX_LINES", "50"),
            ("AUTOPATCH_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.test_command, "pytest -q");
        assert_eq!(config.limits.max_lines_per_patch, 50);
        assert_eq!(config.model.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_bad_env_number_is_configuration_error() {
        let mut config = WorkflowConfig::default();
        let err = config
            .apply_env(|k| (k == "AUTOPATCH_MAX_FIX_ATTEMPTS").then(|| "three".to_string()))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = WorkflowConfig {
            max_fix_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mistyped_field_is_error() {
        assert!(WorkflowConfig::from_toml_str("max_fix_attempts = \"lots\"").is_err());
    }
}
