//! Child-process helpers shared by the applier and the test runner.

use std::path::Path;
use std::time::Duration;

/// Why a child process produced no output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessFailure {
    Spawn(String),
    TimedOut(Duration),
}

impl std::fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "Failed to execute: {e}"),
            Self::TimedOut(d) => write!(f, "Timed out after {}s", d.as_secs()),
        }
    }
}

/// Run `cmd` in `working_dir`, killing the whole process group when the
/// timeout elapses.
pub async fn run_with_timeout(
    cmd: &mut tokio::process::Command,
    working_dir: &Path,
    timeout: Duration,
) -> Result<std::process::Output, ProcessFailure> {
    cmd.current_dir(working_dir)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(ProcessFailure::Spawn(e.to_string())),
        Err(_) => Err(ProcessFailure::TimedOut(timeout)),
    }
}

/// Merge stdout and stderr into one lossy UTF-8 string.
pub fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout.into_owned(),
        (true, false) => stderr.into_owned(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}

/// Keep at most `max_chars` characters, preferring the tail where failures
/// are usually reported.
pub fn truncate_output(s: &str, max_chars: usize) -> String {
    let trimmed = s.trim();
    let char_count = trimmed.chars().count();
    if char_count <= max_chars {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(char_count - max_chars).collect();
    format!("… (truncated {} chars)\n{tail}", char_count - max_chars)
}
