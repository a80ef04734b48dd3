//! Test execution against a working tree.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PatchError, PatchResult};
use crate::process::{combined_output, run_with_timeout, truncate_output};

/// Default cap on captured test output, in characters.
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 20_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub success: bool,
    pub output: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Runs a repository's test suite.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, repo_path: &Path) -> TestOutcome;
}

/// Runs a fixed command line (e.g. `npm test`) in the repository.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    max_output_chars: usize,
}

impl CommandTestRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }

    /// Split a shell-style command line into program and arguments.
    pub fn from_command_line(command_line: &str, timeout: Duration) -> PatchResult<Self> {
        let mut parts = shlex::split(command_line)
            .ok_or_else(|| PatchError::validation(format!("Unparseable test command: {command_line}")))?
            .into_iter();
        let program = parts
            .next()
            .ok_or_else(|| PatchError::validation("Test command is empty"))?;
        Ok(Self::new(program, parts.collect(), timeout))
    }

    pub fn with_max_output_chars(mut self, max_output_chars: usize) -> Self {
        self.max_output_chars = max_output_chars;
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, repo_path: &Path) -> TestOutcome {
        let start = Instant::now();
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);

        let outcome = match run_with_timeout(&mut cmd, repo_path, self.timeout).await {
            Ok(output) => TestOutcome {
                success: output.status.success(),
                output: truncate_output(&combined_output(&output), self.max_output_chars),
                exit_code: output.status.code(),
                duration_ms: 0,
            },
            Err(failure) => {
                warn!(command = %self.command_line(), error = %failure, "Test command did not complete");
                TestOutcome {
                    success: false,
                    output: failure.to_string(),
                    exit_code: None,
                    duration_ms: 0,
                }
            }
        };

        let outcome = TestOutcome {
            duration_ms: start.elapsed().as_millis() as u64,
            ..outcome
        };
        info!(
            command = %self.command_line(),
            success = outcome.success,
            exit_code = ?outcome.exit_code,
            duration_ms = outcome.duration_ms,
            "Test run finished"
        );
        outcome
    }
}
